//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the driver and the orchestrator:
//!
//! - **Validation**: sweep parameters are checked once, up front, with clear
//!   error messages, so a typo never starts a server.
//! - **Formatting**: human-readable durations for progress logs.
//! - **Naming**: the timestamp that ties all artifacts of one sweep together.
//!
//! ## Usage Examples
//!
//! ```rust
//! use server_bench::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
//!
//! validate_port(8080)?;
//! validate_counts("connections", &[10, 50, 100])?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;

/// Format of the timestamp embedded in artifact names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Local wall-clock timestamp for artifact names, e.g. `20240315-142501`.
pub fn run_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Format a duration in a human-readable way
///
/// Sub-minute durations keep two decimals of the most fitting unit; longer
/// ones use a compound `1h 2m 3s` form.
///
/// ## Examples
///
/// ```rust
/// # use server_bench::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(5)), "5.00s");
/// assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
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

/// Rough wall-clock cost of a sweep, for the start-up banner.
///
/// Counts the client runs, the per-server settle delay and, for traced runs,
/// the tracer settle and attach delays. Readiness probing and teardown are
/// not included.
pub fn estimate_sweep_time(
    threads: usize,
    connections: usize,
    duration: Duration,
    cooldown: Duration,
    runs_per_combination: u32,
    trace_overhead: Duration,
) -> Duration {
    let combinations = (threads * connections) as u32;
    let per_run = duration + cooldown;
    per_run * combinations * runs_per_combination
        + crate::defaults::SERVER_SETTLE * threads as u32
        + trace_overhead * combinations
}

/// Validate that a port number is in the valid range
///
/// Ports below 1024 need root to bind; the servers under test run as the
/// invoking user, so such a port can only mean a typo.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1024 {
        anyhow::bail!("Port number {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Validate a thread or connection count list
///
/// ## Validation Rules
///
/// - the list must not be empty
/// - every entry must be at least 1
pub fn validate_counts(name: &str, values: &[u32]) -> Result<()> {
    if values.is_empty() {
        anyhow::bail!("At least one value is required for {}", name);
    }
    if let Some(position) = values.iter().position(|&v| v == 0) {
        anyhow::bail!(
            "{} cannot contain zero (entry {} of {:?})",
            name,
            position + 1,
            values
        );
    }
    Ok(())
}

/// Validate that a message size is reasonable
///
/// Zero-length messages are meaningless to the client; anything above 16 MB
/// is almost certainly a unit mistake.
pub fn validate_message_size(message_size: usize) -> Result<()> {
    if message_size == 0 {
        anyhow::bail!("Message size cannot be zero");
    }
    if message_size > 16 * 1024 * 1024 {
        anyhow::bail!("Message size {} is too large (maximum 16MB)", message_size);
    }
    Ok(())
}

/// Validate the per-run client duration.
///
/// The client takes whole seconds, so anything under one second would be
/// passed as `-t 0`.
pub fn validate_duration(duration: Duration) -> Result<()> {
    if duration.as_secs() == 0 {
        anyhow::bail!(
            "Duration {} is too short (minimum 1s)",
            format_duration(duration)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test duration formatting across all unit ranges
    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    /// Test port number validation rules
    #[test]
    fn test_validate_port() {
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(8080).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(1023).is_err());
        assert!(validate_port(80).is_err());
    }

    /// Test sweep list validation rules
    #[test]
    fn test_validate_counts() {
        assert!(validate_counts("threads", &[1, 2, 4]).is_ok());
        assert!(validate_counts("threads", &[]).is_err());

        let err = validate_counts("connections", &[10, 0]).unwrap_err();
        assert!(err.to_string().contains("entry 2"));
    }

    /// Test message size validation rules
    #[test]
    fn test_validate_message_size() {
        assert!(validate_message_size(1).is_ok());
        assert!(validate_message_size(1024).is_ok());
        assert!(validate_message_size(0).is_err());
        assert!(validate_message_size(16 * 1024 * 1024 + 1).is_err());
    }

    /// Test client duration validation
    #[test]
    fn test_validate_duration() {
        assert!(validate_duration(Duration::from_secs(1)).is_ok());
        assert!(validate_duration(Duration::from_millis(500)).is_err());
    }

    /// Test the artifact timestamp shape
    #[test]
    fn test_run_timestamp_shape() {
        let ts = run_timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(ts.as_bytes()[8], b'-');
        assert!(ts.chars().filter(|c| *c != '-').all(|c| c.is_ascii_digit()));
    }

    /// Test the sweep time estimate
    #[test]
    fn test_estimate_sweep_time() {
        let estimate = estimate_sweep_time(
            2,
            3,
            Duration::from_secs(10),
            Duration::from_secs(1),
            1,
            Duration::ZERO,
        );
        // 6 runs of 11s plus two 3s server settles.
        assert_eq!(estimate, Duration::from_secs(72));
    }
}
