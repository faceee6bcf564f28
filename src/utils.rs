//! # Utility Functions and Helper Module
//!
//! Helpers shared across the sweep engine: wall-clock timestamps, human
//! readable formatting, basic statistics, parameter validation and small
//! console table/progress renderers.
//!
//! ## Key Functionality Categories
//!
//! - **Time**: Wall-clock timestamps compatible with the envelope format
//! - **Formatting**: Human-readable display of durations and bit rates
//! - **Statistics**: Mean, extremes and standard deviation of latency samples
//! - **Validation**: Sweep parameter validation with clear error messages
//! - **Display Helpers**: Table formatting and progress indicators
//!
//! ## Usage Examples
//!
//! ```rust
//! use lpwan_bench::utils::*;
//! use std::time::Duration;
//!
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! assert_eq!(format_bitrate(5120.0), "5.12 kbit/s");
//!
//! # fn main() -> anyhow::Result<()> {
//! validate_payload_size(128)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique identifier for a trial
///
/// Used to name per-trial artifacts (raw sample files) so concurrent
/// protocol workers never collide.
pub fn generate_trial_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current wall-clock time as fractional seconds since Unix epoch
///
/// This is the timestamp representation carried inside measurement
/// envelopes. Sender and receiver hosts are expected to share a clock
/// (same host, or NTP-synchronised containers).
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use lpwan_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a bit rate in a human-readable way
///
/// Uses decimal scaling (powers of 1000), matching how link capacities
/// (`50kbit`, `1mbit`) are expressed.
///
/// ```rust
/// # use lpwan_bench::utils::format_bitrate;
/// assert_eq!(format_bitrate(800.0), "800 bit/s");
/// assert_eq!(format_bitrate(250_000.0), "250.00 kbit/s");
/// assert_eq!(format_bitrate(1_500_000.0), "1.50 Mbit/s");
/// ```
pub fn format_bitrate(bits_per_second: f64) -> String {
    if bits_per_second < 1_000.0 {
        format!("{:.0} bit/s", bits_per_second)
    } else if bits_per_second < 1_000_000.0 {
        format!("{:.2} kbit/s", bits_per_second / 1_000.0)
    } else if bits_per_second < 1_000_000_000.0 {
        format!("{:.2} Mbit/s", bits_per_second / 1_000_000.0)
    } else {
        format!("{:.2} Gbit/s", bits_per_second / 1_000_000_000.0)
    }
}

/// Calculate statistics from a slice of values
///
/// ## Returns
/// Tuple of (mean, min, max, standard_deviation) as f64 values
///
/// ## Standard Deviation Calculation
///
/// Uses the sample standard deviation formula:
/// s = √(Σ(x - x̄)² / (N - 1))
///
/// Fewer than two values carry no spread information, so the deviation is
/// reported as 0.0 rather than NaN. An empty slice yields all zeros.
///
/// ```rust
/// # use lpwan_bench::utils::calculate_stats;
/// let (mean, min, max, std_dev) = calculate_stats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
/// assert_eq!(mean, 5.0);
/// assert_eq!(min, 2.0);
/// assert_eq!(max, 9.0);
/// assert!((std_dev - 2.138).abs() < 0.001);
/// ```
pub fn calculate_stats(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let sum: f64 = values.iter().sum();
    let count = values.len() as f64;
    let mean = sum / count;

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let std_dev = if values.len() < 2 {
        0.0
    } else {
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1.0);
        variance.sqrt()
    };

    (mean, min, max, std_dev)
}

/// Validate that a payload size is reasonable
///
/// - **Minimum**: 1 byte (sizes below the envelope metadata are allowed and
///   simply produce metadata-only payloads)
/// - **Maximum**: 60 KB so a payload plus protocol header still fits in a
///   single UDP datagram
pub fn validate_payload_size(payload_size: usize) -> Result<()> {
    if payload_size == 0 {
        anyhow::bail!("Payload size cannot be zero");
    }
    if payload_size > crate::defaults::MAX_PAYLOAD_SIZE {
        anyhow::bail!(
            "Payload size {} is too large (maximum {} bytes)",
            payload_size,
            crate::defaults::MAX_PAYLOAD_SIZE
        );
    }
    Ok(())
}

/// Validate that a send rate is positive and finite
pub fn validate_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        anyhow::bail!("Rate must be a positive number of messages per second, got {}", rate);
    }
    Ok(())
}

/// Validate that a trial duration is non-zero
pub fn validate_duration(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        anyhow::bail!("Trial duration cannot be zero");
    }
    Ok(())
}

/// Print a formatted table row
///
/// ```rust
/// # use lpwan_bench::utils::{print_table_row, print_table_separator};
/// let widths = [10, 10, 12];
/// print_table_separator(&widths);
/// print_table_row(&["Protocol", "Done", "Progress"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a table separator
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}", "-".repeat(width + 2));
        print!("+");
    }
    println!();
}

/// Create a progress bar-like indicator
///
/// - **Zero Total**: Returns all filled blocks to avoid division by zero
/// - **Overflow**: Caps progress at 100% even if current > total
///
/// ```rust
/// # use lpwan_bench::utils::create_progress_indicator;
/// assert_eq!(create_progress_indicator(0, 100, 10), "░░░░░░░░░░");
/// assert_eq!(create_progress_indicator(50, 100, 10), "█████░░░░░");
/// assert_eq!(create_progress_indicator(100, 100, 10), "██████████");
/// ```
pub fn create_progress_indicator(current: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return "█".repeat(width);
    }

    let progress = (current as f64 / total as f64).min(1.0);
    let filled = ((progress * width as f64) as usize).min(width);
    let empty = width - filled;

    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}
