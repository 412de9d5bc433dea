//! # Sweep Orchestrator
//!
//! Runs the full benchmark sweep as two explicit nested loops:
//!
//! ```text
//! for threads in plan.threads            ── one server per iteration
//!     launch server (optionally under the follow tracer)
//!     settle
//!     for connections in plan.connections
//!         regular run                    ── client only
//!         traced run                     ── attach tracer, client, collect
//!     teardown server                    ── always, whatever happened above
//! ```
//!
//! Runs never overlap: each iteration owns the server port and at most one
//! attached tracer. Teardown of the iteration's server happens before the
//! next iteration starts, on success, on failure and on cancellation.
//!
//! ## Failure policy
//!
//! - A server that fails to launch skips its thread count; the sweep goes on.
//! - A tracer that fails to attach, or leaves no report, fails the traced
//!   run of that combination; the regular run is unaffected.
//! - A failed client run skips its combination; a post-mortem is written.
//! - Cancellation stops the sweep after the current teardown.
//! - Failing to write results aborts the sweep.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::cli::{ServerVariant, TraceMode};
use crate::client::BenchClient;
use crate::error::{ClientError, HarnessError, TraceError};
use crate::locator::{self, ProcessTable};
use crate::parsers::parse_bench_output;
use crate::process::{self, LaunchPolicy, ProcessHandle, GRACEFUL_LADDER};
use crate::results::{
    follow_row, write_error_report, BenchmarkResult, CsvLog, FailureRecord, RunArtifacts, RunLog,
    SweepMetadata, SweepSummary,
};
use crate::trace::{collect_follow_output, TraceSession, TraceTiming, TracerCommand};
use crate::utils::format_duration;

/// Everything that parameterizes one sweep.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub variant: ServerVariant,
    pub server_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub threads: Vec<u32>,
    pub connections: Vec<u32>,
    /// Length of each client run.
    pub duration: Duration,
    pub message_length: usize,
    pub run_regular: bool,
    pub run_trace: bool,
    pub trace_mode: TraceMode,
    /// Pause after each client run.
    pub cooldown: Duration,
    /// Wait between readiness and the first client run of a server.
    pub server_settle: Duration,
    /// Grace period after each stop signal during teardown.
    pub stop_grace: Duration,
    pub launch: LaunchPolicy,
    pub trace_timing: TraceTiming,
}

impl SweepPlan {
    /// A plan with default timings and regular runs only.
    pub fn new(
        variant: ServerVariant,
        server_path: PathBuf,
        host: impl Into<String>,
        port: u16,
        threads: Vec<u32>,
        connections: Vec<u32>,
    ) -> Self {
        Self {
            variant,
            server_path,
            host: host.into(),
            port,
            threads,
            connections,
            duration: crate::defaults::DURATION,
            message_length: crate::defaults::MESSAGE_LENGTH,
            run_regular: true,
            run_trace: false,
            trace_mode: TraceMode::Attach,
            cooldown: crate::defaults::COOLDOWN,
            server_settle: crate::defaults::SERVER_SETTLE,
            stop_grace: crate::defaults::STOP_GRACE,
            launch: LaunchPolicy::default(),
            trace_timing: TraceTiming::default(),
        }
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn follow_tracing(&self) -> bool {
        self.run_trace && self.trace_mode == TraceMode::Follow
    }

    fn attach_tracing(&self) -> bool {
        self.run_trace && self.trace_mode == TraceMode::Attach
    }

    /// Follow mode needs client load on the traced server, so each
    /// combination gets a client run even when regular runs are disabled.
    fn client_runs(&self) -> bool {
        self.run_regular || self.follow_tracing()
    }

    /// Client runs per combination.
    pub fn runs_per_combination(&self) -> u32 {
        u32::from(self.client_runs()) + u32::from(self.attach_tracing())
    }

    /// Fixed tracer delays added to every traced combination.
    pub fn trace_overhead(&self) -> Duration {
        if self.attach_tracing() {
            self.trace_timing.settle + self.trace_timing.attach_delay
        } else {
            Duration::ZERO
        }
    }
}

/// Outcome of a sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub results: Vec<BenchmarkResult>,
    pub failures: Vec<FailureRecord>,
    pub cancelled: bool,
}

impl SweepReport {
    /// True when every requested combination produced a result.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}

/// Drives one sweep against one server binary.
pub struct Orchestrator {
    plan: SweepPlan,
    client: BenchClient,
    tracer: TracerCommand,
    table: Box<dyn ProcessTable>,
    artifacts: RunArtifacts,
    cancel: CancelToken,
    hints: Vec<String>,
    run_log: RunLog,
    regular_csv: CsvLog,
    strace_csv: CsvLog,
    follow_csv: CsvLog,
}

impl Orchestrator {
    pub fn new(
        plan: SweepPlan,
        client: BenchClient,
        tracer: TracerCommand,
        table: Box<dyn ProcessTable>,
        artifacts: RunArtifacts,
        cancel: CancelToken,
    ) -> Result<Self> {
        let hints = locator::name_hints(&plan.server_path, plan.variant);
        let run_log = RunLog::new(artifacts.run_log());
        let regular_csv = CsvLog::open(&artifacts.regular_csv())?;
        let strace_csv = CsvLog::open(&artifacts.strace_csv())?;
        let follow_csv = CsvLog::open(&artifacts.follow_csv())?;
        Ok(Self {
            plan,
            client,
            tracer,
            table,
            artifacts,
            cancel,
            hints,
            run_log,
            regular_csv,
            strace_csv,
            follow_csv,
        })
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    pub fn artifacts(&self) -> &RunArtifacts {
        &self.artifacts
    }

    /// Run every thread × connection combination and write the summary.
    pub async fn run(&mut self) -> Result<SweepReport> {
        let started = Local::now();
        let mut report = SweepReport::default();
        self.log_header()?;

        let threads_list = self.plan.threads.clone();
        for (index, &threads) in threads_list.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            info!(
                "=== Server threads {} ({}/{}) ===",
                threads,
                index + 1,
                threads_list.len()
            );
            self.run_log
                .section(&format!("SERVER THREADS = {}", threads))?;

            match self.run_thread_iteration(threads, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    report.cancelled = true;
                    break;
                }
                Err(e @ HarnessError::Output { .. }) => {
                    error!("Aborting sweep: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Skipping thread count {}: {}", threads, e);
                    self.run_log
                        .line(&format!("threads={} FAILED: {}", threads, e))?;
                    report.failures.push(FailureRecord {
                        thread_count: threads,
                        connection_count: None,
                        traced: self.plan.follow_tracing(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if report.cancelled {
            warn!("Sweep cancelled");
            self.run_log.line("Sweep cancelled")?;
        }
        self.write_summary(started, &report)?;
        info!(
            "Sweep finished: {} result(s), {} failure(s) in {}",
            report.results.len(),
            report.failures.len(),
            format_duration((Local::now() - started).to_std().unwrap_or_default())
        );
        Ok(report)
    }

    /// One server lifetime. The server is torn down before this returns,
    /// whatever the combinations did.
    async fn run_thread_iteration(
        &mut self,
        threads: u32,
        report: &mut SweepReport,
    ) -> Result<(), HarnessError> {
        let server_args = self
            .plan
            .variant
            .server_args(&self.plan.host, self.plan.port, Some(threads));
        let follow_prefix = self
            .plan
            .follow_tracing()
            .then(|| self.artifacts.follow_prefix(threads));

        let argv = match &follow_prefix {
            Some(prefix) => self
                .tracer
                .follow_argv(prefix, &self.plan.server_path, &server_args),
            None => {
                let mut argv = vec![self.plan.server_path.display().to_string()];
                argv.extend(server_args);
                argv
            }
        };

        let mut server = process::launch(
            &argv[0],
            &argv[1..],
            &self.plan.host,
            self.plan.port,
            &self.plan.launch,
            &self.cancel,
        )
        .await?;
        info!("Server started (pid {})", server.pid());

        let outcome = match self.note(&format!(
            "Server started (pid {}): {}",
            server.pid(),
            argv.join(" ")
        )) {
            Ok(()) => self.run_combinations(threads, &mut server, report).await,
            Err(e) => Err(e),
        };

        self.teardown(threads, &mut server, follow_prefix.as_deref())
            .await;
        outcome
    }

    async fn run_combinations(
        &mut self,
        threads: u32,
        server: &mut ProcessHandle,
        report: &mut SweepReport,
    ) -> Result<(), HarnessError> {
        info!(
            "Letting server settle for {}",
            format_duration(self.plan.server_settle)
        );
        self.cancel.sleep(self.plan.server_settle).await?;

        let connections_list = self.plan.connections.clone();
        for &connections in &connections_list {
            if !server.is_alive() {
                let reason = format!(
                    "server exited unexpectedly (exit code {:?})",
                    server.exit_code()
                );
                error!("{}", reason);
                self.note(&format!("threads={} {}", threads, reason))?;
                report.failures.push(FailureRecord {
                    thread_count: threads,
                    connection_count: Some(connections),
                    traced: false,
                    reason,
                });
                continue;
            }

            if self.plan.client_runs() {
                match self.regular_run(threads, connections).await? {
                    Ok(result) => report.results.push(result),
                    Err(failure) => report.failures.push(failure),
                }
                self.cancel.sleep(self.plan.cooldown).await?;
            }

            if self.plan.attach_tracing() {
                match self.traced_run(threads, connections).await? {
                    Ok(result) => report.results.push(result),
                    Err(failure) => report.failures.push(failure),
                }
                self.cancel.sleep(self.plan.cooldown).await?;
            }
        }
        Ok(())
    }

    /// Client run against the plain server. The outer error aborts the
    /// iteration; the inner one is a skipped combination.
    async fn regular_run(
        &mut self,
        threads: u32,
        connections: u32,
    ) -> Result<Result<BenchmarkResult, FailureRecord>, HarnessError> {
        info!(
            "Regular run: threads={} connections={}",
            threads, connections
        );
        let address = self.plan.address();
        let outcome = self
            .client
            .run(
                &address,
                connections,
                self.plan.duration,
                self.plan.message_length,
                &self.cancel,
            )
            .await;

        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.client_failure(threads, connections, false, e),
        };

        let raw_path = self.artifacts.raw_output(connections, threads);
        std::fs::write(&raw_path, &output.stdout)
            .map_err(|e| output_error("writing client output", &e))?;

        let metrics = parse_bench_output(&output.stdout, self.plan.duration);
        let result = BenchmarkResult::new(connections, threads, metrics);
        self.regular_csv
            .append_result(&result)
            .map_err(|e| output_error("appending regular result", &e))?;
        self.log_result(&result, "regular")?;
        Ok(Ok(result))
    }

    /// Client run with an attached tracer.
    async fn traced_run(
        &mut self,
        threads: u32,
        connections: u32,
    ) -> Result<Result<BenchmarkResult, FailureRecord>, HarnessError> {
        info!(
            "Traced run: threads={} connections={}",
            threads, connections
        );

        let artifacts = self.artifacts.clone();
        let session = TraceSession::start(
            &self.tracer,
            self.table.as_ref(),
            &self.plan.host,
            self.plan.port,
            &self.hints,
            |pid| artifacts.strace_log(pid, connections),
            self.plan.trace_timing,
            &self.cancel,
        )
        .await;

        let session = match session {
            Ok(session) => session,
            Err(TraceError::Cancelled) => return Err(HarnessError::Cancelled),
            Err(e) => {
                warn!("Tracing skipped for connections={}: {}", connections, e);
                return self.trace_failure(threads, connections, &e);
            }
        };

        let address = self.plan.address();
        let outcome = self
            .client
            .run(
                &address,
                connections,
                self.plan.duration,
                self.plan.message_length,
                &self.cancel,
            )
            .await;

        // The tracer is stopped before anything else, including on
        // cancellation and client failure.
        let trace = session.finish().await;

        let output = match outcome {
            Ok(output) => output,
            Err(e) => return self.client_failure(threads, connections, true, e),
        };
        let trace = match trace {
            Ok(trace) => trace,
            Err(e) => {
                warn!("Trace report unavailable: {}", e);
                return self.trace_failure(threads, connections, &e);
            }
        };

        let metrics = parse_bench_output(&output.stdout, self.plan.duration);
        let result = BenchmarkResult::new(connections, threads, metrics).with_trace(
            trace.target_pid,
            trace.histogram,
            trace.total,
        );
        self.strace_csv
            .append_result(&result)
            .map_err(|e| output_error("appending traced result", &e))?;
        self.log_result(&result, "traced")?;
        Ok(Ok(result))
    }

    /// A traced combination without a usable trace. Nothing is written to
    /// the strace log so its syscall columns stay intact.
    fn trace_failure(
        &self,
        threads: u32,
        connections: u32,
        error: &TraceError,
    ) -> Result<Result<BenchmarkResult, FailureRecord>, HarnessError> {
        self.note(&format!(
            "threads={} connections={} (traced) FAILED: {}",
            threads, connections, error
        ))?;
        Ok(Err(FailureRecord {
            thread_count: threads,
            connection_count: Some(connections),
            traced: true,
            reason: error.to_string(),
        }))
    }

    fn client_failure(
        &self,
        threads: u32,
        connections: u32,
        traced: bool,
        error: ClientError,
    ) -> Result<Result<BenchmarkResult, FailureRecord>, HarnessError> {
        if let ClientError::Cancelled = error {
            return Err(HarnessError::Cancelled);
        }

        if let ClientError::Failed {
            exit_code,
            stdout,
            stderr,
        } = &error
        {
            error!(
                "Benchmark failed (threads={} connections={}): {}",
                threads,
                connections,
                stderr.trim()
            );
            let argv = self.client.args_for(
                &self.plan.address(),
                connections,
                self.plan.duration,
                self.plan.message_length,
            );
            let path = self.artifacts.error_report(connections, threads);
            write_error_report(&path, &argv, *exit_code, stderr, stdout)
                .map_err(|e| output_error("writing error report", &e))?;
            info!("Error details saved to {}", path.display());
        } else {
            error!(
                "Benchmark failed (threads={} connections={}): {}",
                threads, connections, error
            );
        }

        self.note(&format!(
            "threads={} connections={}{} FAILED: {}",
            threads,
            connections,
            if traced { " (traced)" } else { "" },
            error
        ))?;

        Ok(Err(FailureRecord {
            thread_count: threads,
            connection_count: Some(connections),
            traced,
            reason: error.to_string(),
        }))
    }

    /// Stop the iteration's server. Never cancellable.
    async fn teardown(
        &mut self,
        threads: u32,
        server: &mut ProcessHandle,
        follow_prefix: Option<&std::path::Path>,
    ) {
        let grace = self.plan.stop_grace;
        let Some(prefix) = follow_prefix else {
            info!("Terminating server (pid {})", server.pid());
            server.shutdown(grace).await;
            return;
        };

        info!("Stopping follow tracer (pid {})", server.pid());
        let stopped = server.stop_with(&GRACEFUL_LADDER, grace).await;
        info!(outcome = ?stopped, "Follow tracer stopped");
        if !self.kill_leftover_listener(grace).await {
            let line = format!(
                "threads={} port {} not confirmed free after teardown",
                threads, self.plan.port
            );
            if let Err(e) = self.note(&line) {
                warn!("{}", e);
            }
        }

        match collect_follow_output(prefix) {
            Ok((0, _)) => warn!("No per-process trace files for {}", prefix.display()),
            Ok((files, histogram)) => {
                info!(
                    "Follow trace: {} process file(s), {} syscalls",
                    files,
                    histogram.total()
                );
                if let Err(e) = self
                    .follow_csv
                    .append(&follow_row(threads, files, &histogram))
                {
                    error!("Failed to record follow trace: {:#}", e);
                }
            }
            Err(e) => warn!("Follow trace unavailable: {}", e),
        }
    }

    /// Kill whatever still listens on the server port after the tracer went
    /// away, so the next iteration can bind it. Returns false when a
    /// listener is still there afterwards.
    async fn kill_leftover_listener(&self, grace: Duration) -> bool {
        let pid = match self.listener_pid() {
            Ok(Some(pid)) => pid,
            Ok(None) => return true,
            Err(e) => {
                warn!("Could not check for leftover server: {}", e);
                return false;
            }
        };

        warn!("Killing leftover server process {}", pid);
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            error!("Failed to kill leftover server {}: {}", pid, e);
        }
        tokio::time::sleep(grace).await;

        match self.listener_pid() {
            Ok(None) => true,
            Ok(Some(still)) => {
                error!(
                    "Port {} is still held by pid {} after SIGKILL",
                    self.plan.port, still
                );
                false
            }
            Err(e) => {
                warn!("Could not confirm leftover server is gone: {}", e);
                false
            }
        }
    }

    fn listener_pid(&self) -> Result<Option<u32>, crate::error::LocateError> {
        locator::locate(
            self.table.as_ref(),
            &self.plan.host,
            self.plan.port,
            &self.hints,
        )
    }

    fn log_header(&self) -> Result<()> {
        let plan = &self.plan;
        self.run_log.section("BENCHMARK SWEEP")?;
        self.run_log.line(&format!(
            "Server: {} ({})",
            plan.server_path.display(),
            plan.variant
        ))?;
        self.run_log.line(&format!("Address: {}", plan.address()))?;
        self.run_log.line(&format!("Threads: {:?}", plan.threads))?;
        self.run_log
            .line(&format!("Connections: {:?}", plan.connections))?;
        self.run_log.line(&format!(
            "Duration: {} per run, message length {}",
            format_duration(plan.duration),
            plan.message_length
        ))?;
        if plan.run_trace {
            self.run_log
                .line(&format!("Tracing: {:?}", plan.trace_mode))?;
        }
        Ok(())
    }

    fn log_result(&self, result: &BenchmarkResult, kind: &str) -> Result<(), HarnessError> {
        info!(
            "{} threads={} connections={}: {} req/s, {} resp/s, {:.2}% success",
            kind,
            result.thread_count,
            result.connection_count,
            result.tps_request,
            result.tps_response,
            result.success_rate
        );
        let mut line = format!(
            "threads={} connections={} {}: {} req/s, {} resp/s, {:.2}%",
            result.thread_count,
            result.connection_count,
            kind,
            result.tps_request,
            result.tps_response,
            result.success_rate
        );
        if let Some(total) = result.total_syscalls {
            line.push_str(&format!(", {} syscalls", total));
        }
        self.note(&line)
    }

    fn note(&self, line: &str) -> Result<(), HarnessError> {
        self.run_log
            .line(line)
            .map_err(|e| output_error("writing run log", &e))
    }

    fn write_summary(&self, started: chrono::DateTime<Local>, report: &SweepReport) -> Result<()> {
        let summary = SweepSummary {
            metadata: SweepMetadata {
                version: crate::VERSION.to_string(),
                variant: self.plan.variant,
                server_path: self.plan.server_path.clone(),
                server_address: self.plan.address(),
                trace_mode: self.plan.run_trace.then_some(self.plan.trace_mode),
                started,
                finished: Local::now(),
                cancelled: report.cancelled,
            },
            total_results: report.results.len(),
            total_failures: report.failures.len(),
            results: report.results.clone(),
            failures: report.failures.clone(),
        };
        summary.write(&self.artifacts.summary_json())
    }
}

fn output_error(context: &str, error: &dyn std::fmt::Display) -> HarnessError {
    HarnessError::Output {
        context: context.to_string(),
        reason: error.to_string(),
    }
}
