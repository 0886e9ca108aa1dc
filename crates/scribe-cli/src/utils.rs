//! Utility functions for the scribe CLI

use anyhow::Result;
use chrono::{DateTime, Utc};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;

/// Number of steps a progress bar uses for a 0.0..=1.0 fraction
pub const PROGRESS_STEPS: u64 = 1000;

/// Create a progress bar with standard styling
pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:>3}% ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if seconds > 0 {
        format!("{}.{:03}s", seconds, millis)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Format seconds stored as `f64`
pub fn format_seconds(seconds: f64) -> String {
    if seconds.is_finite() && seconds >= 0.0 {
        format_duration(Duration::from_secs_f64(seconds))
    } else {
        "-".to_string()
    }
}

/// UTC rendering of an optional timestamp
pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Print formatted output (JSON or human-readable)
pub fn print_output(data: &Value, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(data)?);
    } else {
        print_human_readable(data);
    }
    Ok(())
}

fn print_human_readable(data: &Value) {
    match data {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::Array(arr) => {
                        println!("{}:", style(key).bold());
                        for (i, item) in arr.iter().enumerate() {
                            println!("  {}: {}", i + 1, format_value(item));
                        }
                    }
                    Value::Object(_) => {
                        println!("{}:", style(key).bold());
                        print_nested_object(value, 1);
                    }
                    _ => println!("{}: {}", style(key).bold(), format_value(value)),
                }
            }
        }
        _ => println!("{}", format_value(data)),
    }
}

fn print_nested_object(data: &Value, indent: usize) {
    let prefix = "  ".repeat(indent);

    if let Value::Object(map) = data {
        for (key, value) in map {
            match value {
                Value::Object(_) => {
                    println!("{}{}:", prefix, style(key).bold());
                    print_nested_object(value, indent + 1);
                }
                _ => println!("{}{}: {}", prefix, style(key).bold(), format_value(value)),
            }
        }
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Print warning with styling
pub fn print_warning(message: &str) {
    eprintln!("{} {}", style("Warning:").yellow().bold(), message);
}

/// Print success message with styling
pub fn print_success(message: &str) {
    println!("{} {}", style("Success:").green().bold(), message);
}
