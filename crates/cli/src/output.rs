//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
#[allow(dead_code)]
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Color a lifecycle or pipeline status for terminal output
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "ready" | "running" => status.green().to_string(),
        "partially_ready" | "crash_loop" | "starting" | "pending" => status.yellow().to_string(),
        "not_ready" | "degraded" | "terminated" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Format a readiness fraction as a percentage
pub fn format_percent(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}

/// Shorten a config hash for table display
pub fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

/// Format a unix timestamp for display
pub fn format_timestamp(ts: i64) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}
