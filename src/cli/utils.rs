use serde_json::{json, Value};

use crate::cli::scenario::StepReport;
use crate::cli::OutputFormat;
use crate::transaction::TransactionSummary;

/// Output a success message in the appropriate format
pub fn output_success(output_format: &OutputFormat, message: &str, data: Option<Value>) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let mut response = json!({
                "success": true,
                "message": message
            });

            if let (Some(Value::Object(extra)), Some(body)) = (data, response.as_object_mut()) {
                body.extend(extra);
            }

            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Text => {
            println!("✓ {}", message);
        }
    }
    Ok(())
}

/// Output an error message in the appropriate format
pub fn output_error(output_format: &OutputFormat, message: &str, error_code: Option<&str>) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let mut response = json!({
                "success": false,
                "error": message
            });

            if let Some(code) = error_code {
                response["error_code"] = json!(code);
            }

            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Text => {
            eprintln!("Error: {}", message);
        }
    }
    Ok(())
}

/// Output one scenario step
pub fn output_step(output_format: &OutputFormat, report: &StepReport) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            let marker = if report.ok { "✓" } else { "✗" };
            match &report.error_code {
                Some(code) => println!("{} [{}] {}: {} ({})", marker, report.index, report.step, report.message, code),
                None => println!("{} [{}] {}: {}", marker, report.index, report.step, report.message),
            }
            if report.step == "show" {
                print_rows(&report.data);
            }
        }
    }
    Ok(())
}

/// Rows of a `show` step, one line each with its pending marker
fn print_rows(data: &Value) {
    let Some(rows) = data.get("rows").and_then(Value::as_array) else {
        return;
    };
    for row in rows {
        let state = row.get("state").and_then(Value::as_str).unwrap_or("");
        let selected = if row.get("selected").and_then(Value::as_bool).unwrap_or(false) { "*" } else { " " };
        let body = row.get("data").map(Value::to_string).unwrap_or_default();
        println!("    {}{:<8} {}", selected, state, body);
    }
}

/// Output pending-change counts in the appropriate format
pub fn output_summary(output_format: &OutputFormat, summary: &TransactionSummary) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "pending": summary }))?);
        }
        OutputFormat::Text => {
            if summary.is_empty() {
                println!("No pending changes");
            } else {
                println!(
                    "{} pending changes ({} creates, {} updates, {} deletes) across {} entity types",
                    summary.total,
                    summary.creates,
                    summary.updates,
                    summary.deletes,
                    summary.entity_type_count()
                );
            }
        }
    }
    Ok(())
}
