//! # Trace Session Manager
//!
//! Attaches a syscall tracer to the server for the length of one client run
//! and brings its report back:
//!
//! ```text
//! Starting ──► Attached ──► Stopping ──► Collected
//!     │                         │
//!     └──────────► Failed ◄─────┘
//! ```
//!
//! - **Starting**: locate the pid listening on the server port, spawn the
//!   tracer against it, wait the settle interval and check the tracer is still
//!   running.
//! - **Attached**: the caller runs the client. The tracer is passive.
//! - **Stopping**: SIGINT, then SIGTERM, then SIGKILL, each after a grace
//!   period. Tracers flush their summary on a graceful stop, so the kill is
//!   only the last resort.
//! - **Collected**: the report file is read and parsed.
//!
//! Every path out of a session, including cancellation during Starting,
//! leaves the tracer process dead and reaped.
//!
//! The per-process mode used by follow tracing does not go through a session:
//! the server itself is launched under the tracer (see [`TracerCommand::follow_argv`])
//! and [`collect_follow_output`] gathers the per-process files afterwards.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Cancelled, TraceError};
use crate::locator::{self, ProcessTable};
use crate::parsers::{parse_strace_output, parse_strace_raw};
use crate::process::{ProcessHandle, GRACEFUL_LADDER};
use crate::results::SyscallHistogram;

/// Argv prefix of the tracer, e.g. `["sudo", "strace"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerCommand {
    argv: Vec<String>,
}

impl TracerCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// `<tracer> -c -p <pid> -o <output>`: aggregate counts for one process.
    pub fn attach_argv(&self, pid: u32, output: &Path) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.extend([
            "-c".to_string(),
            "-p".to_string(),
            pid.to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ]);
        argv
    }

    /// `<tracer> -ff -o <output> <server> <args...>`: one raw trace file per
    /// process, written to `<output>.<tid>`.
    pub fn follow_argv(&self, output: &Path, server: &Path, server_args: &[String]) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.extend([
            "-ff".to_string(),
            "-o".to_string(),
            output.display().to_string(),
            server.display().to_string(),
        ]);
        argv.extend(server_args.iter().cloned());
        argv
    }
}

/// Delays of a trace session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceTiming {
    /// Wait after spawning before checking the tracer is alive.
    pub settle: Duration,
    /// Extra wait after a successful check before the client starts.
    pub attach_delay: Duration,
    /// Grace period after each stop signal.
    pub grace: Duration,
}

impl Default for TraceTiming {
    fn default() -> Self {
        Self {
            settle: crate::defaults::TRACER_SETTLE,
            attach_delay: crate::defaults::TRACER_ATTACH_DELAY,
            grace: crate::defaults::TRACER_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Starting,
    Attached,
    Stopping,
    Collected,
    Failed,
}

/// Parsed tracer output.
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub target_pid: u32,
    pub histogram: SyscallHistogram,
    pub total: u64,
    pub raw: String,
    pub output_path: PathBuf,
}

/// One tracer attached to one server process.
#[derive(Debug)]
pub struct TraceSession {
    tracer: ProcessHandle,
    target_pid: u32,
    output_path: PathBuf,
    timing: TraceTiming,
    state: TraceState,
}

impl TraceSession {
    /// Locate the listener on `host:port`, attach the tracer and wait until
    /// it is settled.
    ///
    /// `output_for` names the report file once the target pid is known.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        tracer: &TracerCommand,
        table: &dyn ProcessTable,
        host: &str,
        port: u16,
        hints: &[String],
        output_for: impl FnOnce(u32) -> PathBuf,
        timing: TraceTiming,
        cancel: &CancelToken,
    ) -> Result<Self, TraceError> {
        let target_pid =
            locator::locate(table, host, port, hints)?.ok_or(TraceError::NoTarget { port })?;
        let output_path = output_for(target_pid);

        let argv = tracer.attach_argv(target_pid, &output_path);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TraceError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty tracer command"),
            })?;
        info!("Attaching tracer to pid {}: {}", target_pid, argv.join(" "));
        let handle = ProcessHandle::spawn_with(program, args, Stdio::null(), Stdio::inherit())
            .map_err(|source| TraceError::Spawn {
                program: program.clone(),
                source,
            })?;

        let mut session = Self {
            tracer: handle,
            target_pid,
            output_path,
            timing,
            state: TraceState::Starting,
        };

        if let Err(Cancelled) = cancel.sleep(timing.settle).await {
            session.release().await;
            return Err(TraceError::Cancelled);
        }

        if !session.tracer.is_alive() {
            session.state = TraceState::Failed;
            let exit_code = session.tracer.exit_code();
            warn!("Tracer exited during startup (exit code {:?})", exit_code);
            return Err(TraceError::TracerExited {
                target_pid,
                exit_code,
            });
        }

        if let Err(Cancelled) = cancel.sleep(timing.attach_delay).await {
            session.release().await;
            return Err(TraceError::Cancelled);
        }

        session.state = TraceState::Attached;
        debug!(tracer_pid = session.tracer.pid(), target_pid, "Tracer attached");
        Ok(session)
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    pub fn tracer_pid(&self) -> u32 {
        self.tracer.pid()
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Stop the tracer and collect its report. The tracer is dead on return
    /// whatever the outcome.
    pub async fn finish(mut self) -> Result<TraceReport, TraceError> {
        self.state = TraceState::Stopping;
        let stopped = self
            .tracer
            .stop_with(&GRACEFUL_LADDER, self.timing.grace)
            .await;
        debug!(outcome = ?stopped, "Tracer stopped");

        let raw = match std::fs::read_to_string(&self.output_path) {
            Ok(raw) => raw,
            Err(source) => {
                self.state = TraceState::Failed;
                return Err(TraceError::Report {
                    path: self.output_path.clone(),
                    source,
                });
            }
        };

        let (histogram, total) = parse_strace_output(&raw);
        self.state = TraceState::Collected;
        info!(
            target_pid = self.target_pid,
            syscalls = histogram.len(),
            total,
            "Trace collected"
        );

        Ok(TraceReport {
            target_pid: self.target_pid,
            histogram,
            total,
            raw,
            output_path: self.output_path.clone(),
        })
    }

    async fn release(&mut self) {
        self.state = TraceState::Failed;
        self.tracer
            .stop_with(&GRACEFUL_LADDER, self.timing.grace)
            .await;
    }
}

/// Read every `<prefix>.<tid>` file written by a follow-mode tracer and
/// merge their syscall counts. Returns the number of files read.
pub fn collect_follow_output(prefix: &Path) -> Result<(usize, SyscallHistogram), TraceError> {
    let dir = prefix
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = prefix
        .file_name()
        .map(|n| format!("{}.", n.to_string_lossy()))
        .unwrap_or_default();

    let entries = std::fs::read_dir(dir).map_err(|source| TraceError::Report {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&stem))
                .is_some_and(|tid| !tid.is_empty() && tid.chars().all(|c| c.is_ascii_digit()))
        })
        .collect();
    files.sort();

    let mut histogram = SyscallHistogram::default();
    for path in &files {
        let text = std::fs::read_to_string(path).map_err(|source| TraceError::Report {
            path: path.clone(),
            source,
        })?;
        histogram.merge(&parse_strace_raw(&text));
    }

    debug!(
        files = files.len(),
        syscalls = histogram.total(),
        "Collected per-process traces for {}",
        prefix.display()
    );
    Ok((files.len(), histogram))
}
