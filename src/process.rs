//! # Process Launcher
//!
//! Owns child processes for the duration of a run. A [`ProcessHandle`] wraps
//! exactly one OS process together with the argv that started it; releasing
//! the handle always leaves the process dead and reaped:
//!
//! - **Normal paths** call [`ProcessHandle::shutdown`] or
//!   [`ProcessHandle::stop_with`], which walk a signal ladder and give the
//!   process a grace period at each step.
//! - **Every other path** (early return, error, cancellation, panic) hits
//!   `Drop`, which force-kills and reaps whatever is still running.
//!
//! ## Readiness
//!
//! [`launch`] spawns the server and runs a bounded readiness probe: each
//! attempt waits one interval, checks whether the process already exited and
//! then tries a short TCP connect to the target address. The probe ends in
//! exactly one of [`Readiness::Ready`], [`Readiness::ProcessDied`] or
//! [`Readiness::TimedOut`]; only `Ready` hands the handle back.

use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Cancelled, LaunchError};

/// How often a stopping process is polled for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Signals sent, in order, to stop a tracer without losing its report.
pub const GRACEFUL_LADDER: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Signals sent, in order, to stop a server.
pub const SERVER_LADDER: [Signal; 1] = [Signal::SIGTERM];

/// Bounds of the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPolicy {
    /// Maximum number of probe attempts.
    pub attempts: u32,
    /// Wait before each attempt.
    pub interval: Duration,
    /// Timeout of each TCP connect.
    pub connect_timeout: Duration,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::defaults::READINESS_ATTEMPTS,
            interval: crate::defaults::READINESS_INTERVAL,
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
        }
    }
}

/// Terminal state of a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The port accepted a connection on this attempt.
    Ready { attempts: u32 },
    /// The process exited before the port opened.
    ProcessDied {
        attempt: u32,
        exit_code: Option<i32>,
    },
    /// Every attempt was used without a successful connect.
    TimedOut { attempts: u32 },
}

/// What finally stopped a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// It had already exited before any signal was sent.
    AlreadyExited,
    /// It exited within the grace period after this signal.
    BySignal(Signal),
    /// Nothing on the ladder worked; it was killed.
    Killed,
}

/// Exclusive owner of one child process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    argv: Vec<String>,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn `program` with `args`. Stdout and stderr are inherited so the
    /// child's own diagnostics reach the terminal.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, std::io::Error> {
        Self::spawn_with(program, args, Stdio::inherit(), Stdio::inherit())
    }

    /// Spawn with explicit stdout/stderr wiring.
    pub fn spawn_with(
        program: &str,
        args: &[String],
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<Self, std::io::Error> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        let pid = child.id();

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());

        debug!(pid, argv = ?argv, "Spawned child process");
        Ok(Self {
            child,
            pid,
            argv,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Poll the process without blocking. Reaps it if it has exited.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = self.pid, "Failed to poll child process: {}", e);
                false
            }
        }
    }

    /// Exit code once the process has been reaped. `None` while running or
    /// when it was killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Send `sig` if the process is still running.
    pub fn signal(&mut self, sig: Signal) -> nix::Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        signal::kill(Pid::from_raw(self.pid as i32), sig)
    }

    /// Poll until the process exits or `within` elapses. Returns whether it
    /// exited.
    pub async fn wait_exit(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Walk `ladder`, giving the process `grace` after each signal, then
    /// force-kill. The process is dead and reaped on return.
    pub async fn stop_with(&mut self, ladder: &[Signal], grace: Duration) -> Stopped {
        if !self.is_alive() {
            return Stopped::AlreadyExited;
        }

        for &sig in ladder {
            if let Err(e) = self.signal(sig) {
                warn!(pid = self.pid, "Failed to send {}: {}", sig, e);
                continue;
            }
            if self.wait_exit(grace).await {
                debug!(pid = self.pid, "Process stopped after {}", sig);
                return Stopped::BySignal(sig);
            }
            warn!(pid = self.pid, "Process still alive after {}", sig);
        }

        self.kill_and_reap();
        Stopped::Killed
    }

    /// Terminate a server: SIGTERM, grace period, then SIGKILL.
    pub async fn shutdown(&mut self, grace: Duration) -> Stopped {
        let stopped = self.stop_with(&SERVER_LADDER, grace).await;
        info!(pid = self.pid, outcome = ?stopped, "Process terminated");
        stopped
    }

    /// SIGKILL and block until reaped. No-op when already reaped.
    pub fn kill_and_reap(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(pid = self.pid, "kill failed (already exited?): {}", e);
        }
        match self.child.wait() {
            Ok(status) => self.exit = Some(status),
            Err(e) => warn!(pid = self.pid, "Failed to reap child process: {}", e),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!(pid = self.pid, "Releasing live process, killing it");
            self.kill_and_reap();
        }
    }
}

/// Poll `host:port` until it accepts a connection, the process dies or the
/// attempts run out.
pub async fn wait_until_ready(
    handle: &mut ProcessHandle,
    host: &str,
    port: u16,
    policy: &LaunchPolicy,
    cancel: &CancelToken,
) -> Result<Readiness, Cancelled> {
    for attempt in 1..=policy.attempts {
        cancel.sleep(policy.interval).await?;
        debug!(attempt, max = policy.attempts, "Waiting for {}:{}", host, port);

        if !handle.is_alive() {
            return Ok(Readiness::ProcessDied {
                attempt,
                exit_code: handle.exit_code(),
            });
        }

        if probe_port(host, port, policy.connect_timeout).await {
            return Ok(Readiness::Ready { attempts: attempt });
        }
    }

    Ok(Readiness::TimedOut {
        attempts: policy.attempts,
    })
}

/// One short connect attempt.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Spawn `program args...` and wait for it to listen on `host:port`.
///
/// On any outcome other than readiness the process is terminated and reaped
/// before the error is returned.
pub async fn launch(
    program: &str,
    args: &[String],
    host: &str,
    port: u16,
    policy: &LaunchPolicy,
    cancel: &CancelToken,
) -> Result<ProcessHandle, LaunchError> {
    info!("Starting {} {}", program, args.join(" "));
    let mut handle = ProcessHandle::spawn(program, args).map_err(|source| LaunchError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let readiness = match wait_until_ready(&mut handle, host, port, policy, cancel).await {
        Ok(readiness) => readiness,
        Err(Cancelled) => {
            handle.shutdown(crate::defaults::STOP_GRACE).await;
            return Err(LaunchError::Cancelled);
        }
    };

    match readiness {
        Readiness::Ready { attempts } => {
            info!(
                pid = handle.pid(),
                attempts, "Server is accepting connections on {}:{}", host, port
            );
            Ok(handle)
        }
        Readiness::ProcessDied { attempt, exit_code } => {
            warn!(
                "Server exited during startup (attempt {}, exit code {:?})",
                attempt, exit_code
            );
            Err(LaunchError::ExitedEarly { attempt, exit_code })
        }
        Readiness::TimedOut { attempts } => {
            warn!("Server startup timed out after {} attempts", attempts);
            handle.shutdown(crate::defaults::STOP_GRACE).await;
            Err(LaunchError::TimedOut {
                address: format!("{}:{}", host, port),
                attempts,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn fast_policy(attempts: u32) -> LaunchPolicy {
        LaunchPolicy {
            attempts,
            interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(50),
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn pid_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_ready_on_first_attempt_when_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut handle = ProcessHandle::spawn("sh", &sh("sleep 30")).unwrap();

        let readiness = wait_until_ready(
            &mut handle,
            "127.0.0.1",
            port,
            &fast_policy(10),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(readiness, Readiness::Ready { attempts: 1 });
        assert!(handle.is_alive());
    }

    #[tokio::test]
    async fn test_early_exit_stops_probing_at_that_attempt() {
        let port = free_port();
        let mut handle = ProcessHandle::spawn("sh", &sh("exit 3")).unwrap();

        let start = Instant::now();
        let readiness = wait_until_ready(
            &mut handle,
            "127.0.0.1",
            port,
            &LaunchPolicy {
                attempts: 10,
                interval: Duration::from_millis(300),
                connect_timeout: Duration::from_millis(50),
            },
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            readiness,
            Readiness::ProcessDied {
                attempt: 1,
                exit_code: Some(3)
            }
        );
        // Nowhere near the ten intervals a full timeout would take.
        assert!(start.elapsed() < Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_closed_port_times_out_after_all_attempts() {
        let port = free_port();
        let mut handle = ProcessHandle::spawn("sh", &sh("sleep 30")).unwrap();

        let start = Instant::now();
        let readiness = wait_until_ready(
            &mut handle,
            "127.0.0.1",
            port,
            &fast_policy(10),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(readiness, Readiness::TimedOut { attempts: 10 });
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_launch_timeout_terminates_the_process() {
        let port = free_port();
        let err = launch(
            "sh",
            &sh("sleep 30"),
            "127.0.0.1",
            port,
            &fast_policy(3),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LaunchError::TimedOut { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_launch_reports_early_exit_code() {
        let port = free_port();
        let err = launch(
            "sh",
            &sh("exit 7"),
            "127.0.0.1",
            port,
            &fast_policy(10),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            LaunchError::ExitedEarly {
                attempt: 1,
                exit_code: Some(7)
            }
        ));
    }

    #[tokio::test]
    async fn test_launch_spawn_failure() {
        let err = launch(
            "/nonexistent/server-binary",
            &[],
            "127.0.0.1",
            free_port(),
            &fast_policy(1),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_launch_releases_process() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = launch(
            "sh",
            &sh("sleep 30"),
            "127.0.0.1",
            free_port(),
            &fast_policy(10),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LaunchError::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_with_escalates_past_ignored_signals() {
        let mut handle =
            ProcessHandle::spawn("sh", &sh("trap '' INT TERM; while :; do sleep 0.05; done"))
                .unwrap();
        let pid = handle.pid();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = handle
            .stop_with(&GRACEFUL_LADDER, Duration::from_millis(200))
            .await;
        assert_eq!(stopped, Stopped::Killed);
        assert!(!handle.is_alive());
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_with_returns_first_effective_signal() {
        let mut handle = ProcessHandle::spawn("sh", &sh("sleep 30")).unwrap();
        let stopped = handle.shutdown(Duration::from_secs(2)).await;
        assert_eq!(stopped, Stopped::BySignal(Signal::SIGTERM));
        assert_eq!(handle.exit_code(), None);
    }

    #[test]
    fn test_drop_kills_and_reaps() {
        let handle = ProcessHandle::spawn("sh", &sh("sleep 30")).unwrap();
        let pid = handle.pid();
        assert_eq!(handle.argv()[0], "sh");
        drop(handle);
        assert!(!pid_alive(pid));
    }
}
