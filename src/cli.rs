use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server Bench - sweep thread and connection counts against a TCP echo server
#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Connection counts to benchmark (space or comma separated)
    #[clap(short = 'c', long, num_args = 1.., value_delimiter = ',', help_heading = "Sweep")]
    pub connections: Vec<u32>,

    /// Server thread counts to benchmark (space or comma separated)
    #[clap(short = 't', long, num_args = 1.., value_delimiter = ',', help_heading = "Sweep")]
    pub threads: Vec<u32>,

    /// Duration of each client run (e.g. "30s", "2m", bare seconds)
    #[clap(short = 'd', long, value_parser = parse_duration, help_heading = "Sweep")]
    pub duration: Option<Duration>,

    /// Message length passed to the benchmark client, in bytes
    #[clap(short = 'l', long, help_heading = "Sweep")]
    pub message_length: Option<usize>,

    /// Pause between consecutive client runs
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Sweep")]
    pub cooldown: Duration,

    /// Server address as host:port
    #[clap(short = 'a', long, help_heading = "Server")]
    pub server_address: Option<String>,

    /// Register a server binary; it becomes the first candidate for its type
    #[clap(short = 'p', long, help_heading = "Server")]
    pub server_path: Option<PathBuf>,

    /// Server implementation to benchmark
    #[clap(short = 's', long, value_enum, help_heading = "Server")]
    pub server_type: Option<ServerVariant>,

    /// Persist a new default server type before running
    #[clap(long, value_enum, help_heading = "Server")]
    pub set_default_type: Option<ServerVariant>,

    /// Skip the regular (untraced) benchmark runs
    #[clap(long, default_value_t = false, help_heading = "Benchmark Types")]
    pub no_regular: bool,

    /// Also run benchmarks with a syscall tracer attached to the server
    #[clap(long, default_value_t = false, help_heading = "Benchmark Types")]
    pub strace: bool,

    /// How the tracer is attached when --strace is given
    #[clap(long, value_enum, default_value_t = TraceMode::Attach, help_heading = "Benchmark Types")]
    pub trace_mode: TraceMode,

    /// Directory for CSV results and per-run artifacts
    #[clap(short = 'r', long, help_heading = "Output")]
    pub results_dir: Option<PathBuf>,

    /// Settings file
    #[clap(long, default_value = crate::defaults::CONFIG_FILE, help_heading = "Output")]
    pub config: PathBuf,

    /// Do not build the benchmark client before the sweep
    #[clap(long, default_value_t = false)]
    pub skip_compile: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only print warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

/// Server implementations under test
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
pub enum ServerVariant {
    /// io_uring based chat/echo server
    #[clap(name = "iouring")]
    #[serde(rename = "iouring")]
    IoUring,

    /// epoll based echo server
    #[clap(name = "epoll")]
    #[serde(rename = "epoll")]
    Epoll,
}

impl std::fmt::Display for ServerVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl ServerVariant {
    pub const ALL: [ServerVariant; 2] = [ServerVariant::IoUring, ServerVariant::Epoll];

    /// Tag used in the settings file and environment.
    pub fn tag(&self) -> &'static str {
        match self {
            ServerVariant::IoUring => "iouring",
            ServerVariant::Epoll => "epoll",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.tag() == tag.trim())
    }

    /// Server argv after the binary path: `<host> <port> [threads]`.
    pub fn server_args(&self, host: &str, port: u16, threads: Option<u32>) -> Vec<String> {
        let mut args = vec![host.to_string(), port.to_string()];
        if let Some(threads) = threads {
            args.push(threads.to_string());
        }
        args
    }

    /// Substrings of the process name that identify this server in the
    /// process table.
    pub fn name_hints(&self) -> &'static [&'static str] {
        match self {
            ServerVariant::IoUring => &["chat_server", "tcpchat", "server"],
            ServerVariant::Epoll => &["epoll_server", "server", "echo"],
        }
    }
}

/// Tracer placement for traced runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TraceMode {
    /// Attach an aggregating tracer to the running server for each client run
    #[default]
    #[clap(name = "attach")]
    Attach,

    /// Launch each server under the tracer and count syscalls per process
    #[clap(name = "follow")]
    Follow,
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() {
        return Err(format!("Duration must be a finite number: {}", s));
    }
    if num < 0.0 {
        return Err(format!("Duration cannot be negative: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(secs).map_err(|_| format!("Duration out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    /// Test that non-finite and oversized durations are rejected, not panics
    #[test]
    fn test_parse_duration_rejects_unrepresentable_values() {
        for input in ["inf", "nan", "infs", "1e30", "1e30h", "-inf"] {
            assert!(parse_duration(input).is_err(), "accepted {:?}", input);
        }
        assert!(Args::try_parse_from(["server-bench", "-d", "inf"]).is_err());
    }

    #[test]
    fn test_server_variant_tags_round_trip() {
        for variant in ServerVariant::ALL {
            assert_eq!(ServerVariant::from_tag(variant.tag()), Some(variant));
        }
        assert_eq!(ServerVariant::from_tag("kqueue"), None);
        assert_eq!(ServerVariant::IoUring.to_string(), "iouring");
    }

    #[test]
    fn test_server_args_with_and_without_threads() {
        assert_eq!(
            ServerVariant::Epoll.server_args("127.0.0.1", 8080, Some(4)),
            vec!["127.0.0.1", "8080", "4"]
        );
        assert_eq!(
            ServerVariant::IoUring.server_args("0.0.0.0", 9000, None),
            vec!["0.0.0.0", "9000"]
        );
    }

    #[test]
    fn test_args_parse_comma_and_space_lists() {
        let args = Args::parse_from([
            "server-bench",
            "-c",
            "10,50",
            "100",
            "-t",
            "1,2",
            "-s",
            "epoll",
            "--strace",
            "-d",
            "5s",
        ]);
        assert_eq!(args.connections, vec![10, 50, 100]);
        assert_eq!(args.threads, vec![1, 2]);
        assert_eq!(args.server_type, Some(ServerVariant::Epoll));
        assert_eq!(args.duration, Some(Duration::from_secs(5)));
        assert!(args.strace);
        assert_eq!(args.trace_mode, TraceMode::Attach);
        assert_eq!(args.cooldown, Duration::from_secs(1));
    }
}
