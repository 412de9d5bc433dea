//! Benchmark client invocation.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::ClientError;

/// Captured output of a successful client run.
#[derive(Debug, Clone)]
pub struct ClientOutput {
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
}

/// The external load generator, e.g. `cargo run --release --bin bench --`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchClient {
    argv: Vec<String>,
}

impl BenchClient {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Full argv for one run: `<tool> -a <addr> -c <conns> -t <secs> -l <len>`.
    pub fn args_for(
        &self,
        address: &str,
        connections: u32,
        duration: Duration,
        message_length: usize,
    ) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.extend([
            "-a".to_string(),
            address.to_string(),
            "-c".to_string(),
            connections.to_string(),
            "-t".to_string(),
            duration.as_secs().to_string(),
            "-l".to_string(),
            message_length.to_string(),
        ]);
        argv
    }

    /// Run the client to completion and capture its output.
    ///
    /// A non-zero exit is a [`ClientError::Failed`] carrying both streams so
    /// the caller can write a post-mortem. On cancellation the child is
    /// killed.
    pub async fn run(
        &self,
        address: &str,
        connections: u32,
        duration: Duration,
        message_length: usize,
        cancel: &CancelToken,
    ) -> Result<ClientOutput, ClientError> {
        if self.argv.is_empty() {
            return Err(ClientError::EmptyCommand);
        }
        let argv = self.args_for(address, connections, duration, message_length);
        info!("Running benchmark: {}", argv.join(" "));
        let (stdout, stderr) = run_captured(&argv, cancel).await?;
        Ok(ClientOutput {
            argv,
            stdout,
            stderr,
        })
    }
}

/// Run a build command, e.g. `cargo build --release --bin bench`, with its
/// output shown on the terminal.
pub async fn build(argv: &[String], cancel: &CancelToken) -> Result<(), ClientError> {
    let (program, args) = argv.split_first().ok_or(ClientError::EmptyCommand)?;
    info!("Building benchmark client: {}", argv.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ClientError::Spawn {
            program: program.clone(),
            source,
        })?;

    let status = cancel
        .run(child.wait())
        .await?
        .map_err(|source| ClientError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !status.success() {
        warn!("Build failed with {}", status);
        return Err(ClientError::Failed {
            exit_code: status.code(),
            stdout: String::new(),
            stderr: String::new(),
        });
    }
    info!("Benchmark client built");
    Ok(())
}

async fn run_captured(
    argv: &[String],
    cancel: &CancelToken,
) -> Result<(String, String), ClientError> {
    let (program, args) = argv.split_first().ok_or(ClientError::EmptyCommand)?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ClientError::Spawn {
            program: program.clone(),
            source,
        })?;

    // Dropping the output future on cancellation drops the child, which
    // kills it.
    let output = cancel
        .run(child.wait_with_output())
        .await?
        .map_err(|source| ClientError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!(
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Client finished with {}",
        output.status
    );

    if !output.status.success() {
        return Err(ClientError::Failed {
            exit_code: output.status.code(),
            stdout,
            stderr,
        });
    }
    Ok((stdout, stderr))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> BenchClient {
        // `sh -c <script>` ignores the trailing client flags except as $0..$n.
        BenchClient::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_args_for_appends_client_flags() {
        let client = BenchClient::new(vec![
            "cargo".to_string(),
            "run".to_string(),
            "--release".to_string(),
            "--bin".to_string(),
            "bench".to_string(),
            "--".to_string(),
        ]);
        let argv = client.args_for("127.0.0.1:8080", 500, Duration::from_secs(30), 1024);
        assert_eq!(
            &argv[6..],
            &["-a", "127.0.0.1:8080", "-c", "500", "-t", "30", "-l", "1024"]
        );
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let client = sh("echo 'Speed: 10 request/sec, 9 response/sec'; echo 'Success rate: 90.00%'");
        let output = client
            .run(
                "127.0.0.1:8080",
                10,
                Duration::from_secs(1),
                64,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(output.stdout.contains("Speed: 10 request/sec"));
        assert_eq!(output.argv[0], "sh");
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_both_streams() {
        let client = sh("echo partial; echo 'connection refused' >&2; exit 3");
        let err = client
            .run(
                "127.0.0.1:8080",
                10,
                Duration::from_secs(1),
                64,
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            ClientError::Failed {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout.trim(), "partial");
                assert_eq!(stderr.trim(), "connection refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_long_client() {
        let client = sh("sleep 30");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = client
            .run("127.0.0.1:8080", 1, Duration::from_secs(30), 64, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_commands_are_rejected() {
        let cancel = CancelToken::new();
        assert!(matches!(
            build(&[], &cancel).await,
            Err(ClientError::EmptyCommand)
        ));
        assert!(matches!(
            BenchClient::new(vec![])
                .run("127.0.0.1:8080", 1, Duration::from_secs(1), 1, &cancel)
                .await,
            Err(ClientError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_build_reports_failure() {
        let cancel = CancelToken::new();
        build(&["true".to_string()], &cancel).await.unwrap();
        assert!(matches!(
            build(&["false".to_string()], &cancel).await,
            Err(ClientError::Failed { exit_code: Some(1), .. })
        ));
    }
}
