use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub transaction: TransactionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

/// Per-transaction behavior. Fixed for the lifetime of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Commit requires a prior review step unless forced
    pub require_confirmation: bool,
    /// A commit with failed operations still ends `Completed`
    pub allow_partial_success: bool,
    pub max_pending_operations: usize,
    /// Per-mutation timeout
    pub timeout_ms: u64,
    /// Entities committed concurrently; same-entity calls are always sequential
    pub max_concurrency: usize,
}

impl TransactionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            require_confirmation: false,
            allow_partial_success: false,
            max_pending_operations: 100,
            timeout_ms: 30_000,
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is not set
    pub filter: String,
    pub log_events: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = env::var("TXN_REQUIRE_CONFIRMATION") {
            self.transaction.require_confirmation =
                v.parse().unwrap_or(self.transaction.require_confirmation);
        }
        if let Ok(v) = env::var("TXN_ALLOW_PARTIAL_SUCCESS") {
            self.transaction.allow_partial_success =
                v.parse().unwrap_or(self.transaction.allow_partial_success);
        }
        if let Ok(v) = env::var("TXN_MAX_PENDING_OPERATIONS") {
            self.transaction.max_pending_operations =
                v.parse().unwrap_or(self.transaction.max_pending_operations);
        }
        if let Ok(v) = env::var("TXN_TIMEOUT_MS") {
            self.transaction.timeout_ms = v.parse().unwrap_or(self.transaction.timeout_ms);
        }
        if let Ok(v) = env::var("TXN_MAX_CONCURRENCY") {
            // zero would stall every commit
            self.transaction.max_concurrency = v
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .unwrap_or(self.transaction.max_concurrency);
        }

        if let Ok(v) = env::var("LOG_FILTER") {
            self.logging.filter = v;
        }
        if let Ok(v) = env::var("LOG_EVENTS") {
            self.logging.log_events = v.parse().unwrap_or(self.logging.log_events);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            transaction: TransactionConfig::default(),
            logging: LoggingConfig {
                filter: "optimistic_txn=debug,info".to_string(),
                log_events: true,
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            transaction: TransactionConfig {
                require_confirmation: false,
                allow_partial_success: false,
                max_pending_operations: 250,
                timeout_ms: 15_000,
                max_concurrency: 8,
            },
            logging: LoggingConfig {
                filter: "info".to_string(),
                log_events: true,
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            transaction: TransactionConfig {
                require_confirmation: true,
                allow_partial_success: false,
                max_pending_operations: 500,
                timeout_ms: 10_000,
                max_concurrency: 8,
            },
            logging: LoggingConfig {
                filter: "warn".to_string(),
                log_events: false,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}
