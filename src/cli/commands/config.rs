use crate::cli::utils::output_success;
use crate::cli::OutputFormat;
use crate::config::config;
use crate::is_production;

pub async fn handle(output_format: OutputFormat) -> anyhow::Result<()> {
    let config = config();

    match output_format {
        OutputFormat::Json => {
            output_success(
                &output_format,
                "Resolved configuration",
                Some(serde_json::json!({ "config": config })),
            )?;
        }
        OutputFormat::Text => {
            let txn = &config.transaction;
            println!("Environment:             {:?}", config.environment);
            println!("Require confirmation:    {}", txn.require_confirmation);
            println!("Allow partial success:   {}", txn.allow_partial_success);
            println!("Max pending operations:  {}", txn.max_pending_operations);
            println!("Mutation timeout:        {}ms", txn.timeout_ms);
            println!("Max concurrency:         {}", txn.max_concurrency);
            println!("Log filter:              {}", config.logging.filter);
            println!("Log events:              {}", config.logging.log_events);
            if is_production!() && txn.require_confirmation {
                println!("Note: production preset, commits need a review step");
            }
        }
    }
    Ok(())
}
