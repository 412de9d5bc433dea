//! Text parsers for benchmark client and tracer output.
//!
//! None of these fail: output that does not match degrades to zero-valued
//! metrics or an empty histogram, with a warning.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::results::SyscallHistogram;

/// Throughput figures extracted from one client run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BenchMetrics {
    pub tps_request: u64,
    pub tps_response: u64,
    pub success_rate: f64,
}

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Speed:\s*(\d+)\s*request/sec,\s*(\d+)\s*response/sec")
            .expect("valid speed pattern")
    })
}

fn requests_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Requests:\s*(\d+)").expect("valid requests pattern")
    })
}

fn responses_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Responses:\s*(\d+)").expect("valid responses pattern")
    })
}

fn success_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Success rate:\s*([0-9]+(?:\.[0-9]+)?)%")
            .expect("valid success pattern")
    })
}

fn syscall_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[pid\s+\d+\]\s*)?(?:\d+\s+)?([A-Za-z_][A-Za-z0-9_]*)\(")
            .expect("valid syscall pattern")
    })
}

fn capture_u64(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract request/response throughput and success rate from client output.
///
/// The `Speed:` line is authoritative. A rate that is zero there (or missing)
/// is derived from the raw `Requests:`/`Responses:` counts divided by the run
/// duration. A genuine zero-throughput run looks the same as a missing field,
/// so both take the fallback.
pub fn parse_bench_output(text: &str, duration: Duration) -> BenchMetrics {
    let (mut tps_request, mut tps_response) = speed_re()
        .captures(text)
        .map(|c| {
            let value = |i: usize| {
                c.get(i)
                    .and_then(|m| m.as_str().parse::<u64>().ok())
                    .unwrap_or(0)
            };
            (value(1), value(2))
        })
        .unwrap_or((0, 0));

    let secs = duration.as_secs();
    if tps_request == 0 {
        if let Some(requests) = capture_u64(requests_re(), text) {
            tps_request = per_second(requests, secs);
            debug!(requests, secs, "Derived request rate from raw count");
        }
    }
    if tps_response == 0 {
        if let Some(responses) = capture_u64(responses_re(), text) {
            tps_response = per_second(responses, secs);
            debug!(responses, secs, "Derived response rate from raw count");
        }
    }

    let success_rate = success_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    if success_rate.is_none() {
        warn!("No success rate in client output, recording 0");
    }
    if tps_request == 0 && tps_response == 0 {
        warn!("Client output reports zero throughput (or none at all)");
    }

    BenchMetrics {
        tps_request,
        tps_response,
        success_rate: success_rate.unwrap_or(0.0),
    }
}

fn per_second(count: u64, secs: u64) -> u64 {
    if secs == 0 {
        0
    } else {
        count / secs
    }
}

/// Parse an aggregate (`strace -c`) report into a histogram and total count.
///
/// A record is a line of at least five columns whose first column is a
/// percentage. The fourth column is the call count and the last is the
/// syscall name. The `total` summary, headers and separators never match.
pub fn parse_strace_output(text: &str) -> (SyscallHistogram, u64) {
    let mut histogram = SyscallHistogram::default();
    let mut total = 0u64;

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        if fields[0].trim_end_matches('%').parse::<f64>().is_err() {
            continue;
        }
        let name = fields[fields.len() - 1];
        if name == "total" {
            continue;
        }
        let Ok(calls) = fields[3].parse::<u64>() else {
            continue;
        };
        histogram.add(name, calls);
        total += calls;
    }

    if histogram.is_empty() {
        warn!("No syscall records found in trace report");
    }
    (histogram, total)
}

/// Count syscall lines in a per-process (`strace -ff`) trace file.
///
/// Each call line starts with the syscall name followed by `(`. Signal and
/// exit notices (`---`, `+++`) and resumed calls (`<...`) are not counted.
pub fn parse_strace_raw(text: &str) -> SyscallHistogram {
    let mut histogram = SyscallHistogram::default();
    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty()
            || line.starts_with("+++")
            || line.starts_with("---")
            || line.starts_with("<...")
        {
            continue;
        }
        if let Some(name) = syscall_line_re()
            .captures(line)
            .and_then(|c| c.get(1))
        {
            histogram.add(name.as_str(), 1);
        }
    }
    histogram
}
