//! Output formatting helpers shared across commands.

use crate::OutputFormat;
use serde::Serialize;

/// Print `value` as pretty JSON under `OutputFormat::Json`, or hand off
/// to `human` otherwise.
pub fn print<T: Serialize>(value: &T, format: OutputFormat, human: impl FnOnce()) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Human | OutputFormat::Table => human(),
    }
    Ok(())
}

pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec))
}

pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
