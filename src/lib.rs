//! # Server Bench Library
//!
//! A benchmarking harness for TCP echo servers. It starts an external server
//! binary (an io_uring or an epoll implementation), drives load against it
//! with an external benchmark client, optionally attaches a syscall tracer,
//! and records throughput and syscall histograms to CSV.
//!
//! ## Run Lifecycle
//!
//! For each server thread count the harness:
//!
//! 1. resolves the server binary from an ordered candidate list;
//! 2. launches it and probes the port until it accepts connections;
//! 3. for each connection count, runs the client, optionally with a tracer
//!    attached to the server's pid (found through the process table);
//! 4. tears the server down before the next thread count starts.
//!
//! Every child process is owned by a [`process::ProcessHandle`]; releasing a
//! handle always leaves the process dead and reaped, so no exit path leaks a
//! server or a tracer.
//!
//! ## Architecture Overview
//!
//! - `resolver`: first executable server binary among the candidates
//! - `process`: child ownership, launch and readiness probing
//! - `locator`: pid lookup by listening port
//! - `trace`: tracer attach/stop/collect state machine
//! - `client`: benchmark client invocation
//! - `parsers`: client and tracer output parsing
//! - `orchestrator`: the thread × connection sweep
//! - `results`: CSV logs, run artifacts and the sweep summary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server_bench::{
//!     cancel::CancelToken, client::BenchClient, locator::ProcfsTable,
//!     orchestrator::{Orchestrator, SweepPlan}, results::RunArtifacts,
//!     trace::TracerCommand, ServerVariant,
//! };
//! use std::path::{Path, PathBuf};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plan = SweepPlan::new(
//!         ServerVariant::Epoll,
//!         PathBuf::from("./epollechoserver/build/epoll_server"),
//!         "127.0.0.1",
//!         8080,
//!         vec![1, 2, 4],
//!         vec![10, 100],
//!     );
//!     let artifacts = RunArtifacts::create(Path::new("benchmark_results"), "20240101-000000")?;
//!     let client = BenchClient::new(vec!["./target/release/bench".to_string()]);
//!     let tracer = TracerCommand::new(vec!["strace".to_string()]);
//!
//!     let mut orchestrator = Orchestrator::new(
//!         plan, client, tracer, Box::new(ProcfsTable), artifacts, CancelToken::new(),
//!     )?;
//!     let report = orchestrator.run().await?;
//!     println!("{} results, {} failures", report.results.len(), report.failures.len());
//!     Ok(())
//! }
//! ```

/// Structured cancellation shared by every wait in a sweep
pub mod cancel;

/// Command-line interface
///
/// Argument parsing with clap, the `ServerVariant` and `TraceMode`
/// enumerations and human-readable duration parsing.
pub mod cli;

/// Benchmark client invocation and build step
pub mod client;

/// Persisted settings and environment overrides
///
/// The settings document is an explicit value: loading never writes, and
/// every mutation is followed by an explicit save from the driver.
pub mod config;

/// Typed errors for every stage of a run
pub mod error;

/// PID lookup by listening port
pub mod locator;

pub mod logging;

/// The benchmark sweep
///
/// Explicit nested iteration over thread and connection counts with a
/// scoped server teardown per thread count.
pub mod orchestrator;

/// Client and tracer output parsing
pub mod parsers;

/// Child process ownership, launch and readiness probing
pub mod process;

/// Server binary resolution
pub mod resolver;

/// Result records, CSV logs and run artifacts
///
/// Manages everything the sweep writes to disk:
/// - append-only CSV logs with a stable header
/// - per-run raw output, error post-mortems and tracer reports
/// - the JSON sweep summary
pub mod results;

/// Trace session management
pub mod trace;

pub mod utils;

pub use cancel::CancelToken;
pub use cli::{Args, ServerVariant, TraceMode};
pub use config::{EnvOverrides, HarnessConfig};
pub use error::{HarnessError, LaunchError, ResolveError, TraceError};
pub use orchestrator::{Orchestrator, SweepPlan, SweepReport};
pub use process::{LaunchPolicy, ProcessHandle, Readiness};
pub use results::{BenchmarkResult, SyscallHistogram};

/// The current version of the harness
///
/// Populated from Cargo.toml and recorded in every sweep summary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Timings mirror what the servers and the tracer need in practice; tests
/// shrink them through `LaunchPolicy`, `TraceTiming` and `SweepPlan`.
pub mod defaults {
    use std::time::Duration;

    /// Settings file read from the working directory
    pub const CONFIG_FILE: &str = "bench_config.json";

    /// Directory for CSV results and run artifacts
    pub const RESULTS_DIR: &str = "benchmark_results";

    /// Length of each client run
    pub const DURATION: Duration = Duration::from_secs(30);

    pub const SERVER_ADDRESS: &str = "127.0.0.1:8080";

    /// Payload length passed to the client
    pub const MESSAGE_LENGTH: usize = 1024;

    /// Readiness probe: attempts, interval and per-attempt connect timeout
    pub const READINESS_ATTEMPTS: u32 = 10;
    pub const READINESS_INTERVAL: Duration = Duration::from_secs(1);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Wait after readiness before the first client run of a server
    pub const SERVER_SETTLE: Duration = Duration::from_secs(3);

    /// Wait after spawning a tracer before checking it is alive
    pub const TRACER_SETTLE: Duration = Duration::from_secs(5);

    /// Extra wait after the tracer check before the client starts
    pub const TRACER_ATTACH_DELAY: Duration = Duration::from_secs(2);

    /// Grace period per step of the tracer stop ladder
    pub const TRACER_GRACE: Duration = Duration::from_secs(1);

    /// Grace period between SIGTERM and SIGKILL for servers
    pub const STOP_GRACE: Duration = Duration::from_secs(5);

    /// Pause between consecutive client runs
    pub const COOLDOWN: Duration = Duration::from_secs(1);
}
