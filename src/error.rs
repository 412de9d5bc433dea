//! # Error Taxonomy
//!
//! Typed errors for every stage of a benchmark run. Each stage gets its own
//! enum so callers can decide, per failure class, whether the sweep keeps
//! going:
//!
//! - [`ResolveError`]: no runnable server binary. Fatal for the sweep.
//! - [`LaunchError`]: the server died early or never opened its port. Only
//!   the current thread-count iteration is skipped.
//! - [`TraceError`]: the tracer could not be attached. The traced run of the
//!   combination is skipped; its regular run is unaffected.
//! - [`ClientError`]: the benchmark client failed. The combination is skipped.
//!
//! Output that does not match the expected patterns is not an error at all;
//! the parsers degrade to zero-valued metrics.

use std::path::PathBuf;

use thiserror::Error;

/// Marker for a wait that was interrupted by the sweep's cancel token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Failure to find a runnable server binary.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no executable {variant} server binary among {} candidate(s): {}", candidates.len(), display_paths(candidates))]
    NotFound {
        variant: String,
        candidates: Vec<PathBuf>,
    },

    #[error("{} does not exist or is not executable", path.display())]
    NotExecutable { path: PathBuf },
}

/// Failure to bring a child process up to readiness.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited during startup (attempt {attempt}, exit code {})", display_code(*exit_code))]
    ExitedEarly { attempt: u32, exit_code: Option<i32> },

    #[error("port {address} not ready after {attempts} attempts")]
    TimedOut { address: String, attempts: u32 },

    #[error("launch cancelled")]
    Cancelled,
}

impl From<Cancelled> for LaunchError {
    fn from(_: Cancelled) -> Self {
        LaunchError::Cancelled
    }
}

/// Failure to attach or collect a syscall trace.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("no process is listening on port {port}")]
    NoTarget { port: u16 },

    #[error("failed to spawn tracer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tracer for pid {target_pid} exited before attaching (exit code {})", display_code(*exit_code))]
    TracerExited {
        target_pid: u32,
        exit_code: Option<i32>,
    },

    #[error("failed to read trace report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process table scan failed: {0}")]
    Scan(#[from] LocateError),

    #[error("trace cancelled")]
    Cancelled,
}

impl From<Cancelled> for TraceError {
    fn from(_: Cancelled) -> Self {
        TraceError::Cancelled
    }
}

/// Failure while running the external benchmark client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("benchmark client command is empty")]
    EmptyCommand,

    #[error("failed to spawn benchmark client {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("benchmark client exited with code {}", display_code(*exit_code))]
    Failed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("benchmark client cancelled")]
    Cancelled,
}

impl From<Cancelled> for ClientError {
    fn from(_: Cancelled) -> Self {
        ClientError::Cancelled
    }
}

/// Failure to enumerate the process or socket tables.
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("cannot read {table}: {reason}")]
    Unreadable { table: &'static str, reason: String },

    #[error("process lookup is not supported on this platform")]
    Unsupported,
}

/// Per-process probe failure. Never fatal: the locator skips the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("process exited")]
    Gone,

    #[error("access denied")]
    AccessDenied,

    #[error("{0}")]
    Other(String),
}

/// Failure to load or save the persisted settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server address {address:?}: expected host:port")]
    InvalidAddress { address: String },
}

/// Umbrella error for one benchmark combination.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{context}: {reason}")]
    Output { context: String, reason: String },

    #[error("sweep cancelled")]
    Cancelled,
}

impl From<Cancelled> for HarnessError {
    fn from(_: Cancelled) -> Self {
        HarnessError::Cancelled
    }
}

impl HarnessError {
    /// True when the error came from the cancel token rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            HarnessError::Cancelled
                | HarnessError::Launch(LaunchError::Cancelled)
                | HarnessError::Trace(TraceError::Cancelled)
                | HarnessError::Client(ClientError::Cancelled)
        )
    }
}

fn display_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
