use clap::Args;
use std::path::PathBuf;

use crate::cli::scenario::{Scenario, Simulator};
use crate::cli::utils::{output_error, output_step, output_success, output_summary};
use crate::cli::OutputFormat;

#[derive(Args)]
pub struct RunArgs {
    #[arg(help = "Scenario file (YAML)")]
    pub scenario: PathBuf,

    #[arg(long, help = "Stop at the first step that fails")]
    pub fail_fast: bool,
}

pub async fn handle(args: RunArgs, output_format: OutputFormat) -> anyhow::Result<()> {
    let scenario = Scenario::load(&args.scenario)?;
    let name = scenario.name.clone().unwrap_or_else(|| args.scenario.display().to_string());
    tracing::info!("Running scenario {} ({} steps)", name, scenario.steps.len());

    let mut simulator = Simulator::new(&scenario)?;
    let mut failed = 0;

    for (index, step) in scenario.steps.iter().enumerate() {
        let report = simulator.apply(index, step).await?;
        output_step(&output_format, &report)?;

        if !report.ok {
            failed += 1;
            if args.fail_fast {
                output_error(
                    &output_format,
                    &format!("Scenario {} stopped at step {}", name, index),
                    report.error_code.as_deref(),
                )?;
                return Err(anyhow::anyhow!("step {} ({}) failed: {}", index, report.step, report.message));
            }
        }
    }

    output_summary(&output_format, &simulator.summary())?;
    output_success(
        &output_format,
        &format!("Scenario {} finished: {} steps, {} failed", name, scenario.steps.len(), failed),
        Some(serde_json::json!({ "steps": scenario.steps.len(), "failed": failed })),
    )
}
