//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use vodfetch_types::BatchSummary;

/// Print the outcome of a batch in the requested format
pub fn print_summary(summary: &BatchSummary, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} {} completed, {} failed, {} paused",
                style("■").bold(),
                style(summary.succeeded).green().bold(),
                style(summary.failed).red().bold(),
                style(summary.paused).yellow().bold()
            );
            if summary.paused > 0 {
                println!("  Run `vodfetch resume` to continue.");
            }
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}
