pub mod cli;
pub mod config;
pub mod entity;
pub mod error;
pub mod registry;
pub mod transaction;
pub mod types;
pub mod view;

pub use error::{CacheError, MutationError, Result, TransactionError};

#[cfg(test)]
pub mod testing;
