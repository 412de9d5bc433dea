#![cfg(unix)]

use std::net::TcpListener;
use std::time::{Duration, Instant};

use nix::sys::signal;
use nix::unistd::Pid;
use server_bench::cancel::CancelToken;
use server_bench::process::{launch, wait_until_ready, LaunchPolicy, ProcessHandle, Readiness};

fn policy(interval_ms: u64) -> LaunchPolicy {
    LaunchPolicy {
        attempts: 10,
        interval: Duration::from_millis(interval_ms),
        connect_timeout: Duration::from_millis(50),
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn readiness_returns_as_soon_as_the_port_opens() {
    let port = free_port();
    let opener = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(350));
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_secs(3));
        drop(listener);
    });

    let mut handle = ProcessHandle::spawn("sh", &sh("sleep 30")).unwrap();
    let start = Instant::now();
    let readiness = wait_until_ready(
        &mut handle,
        "127.0.0.1",
        port,
        &policy(100),
        &CancelToken::new(),
    )
    .await
    .unwrap();

    match readiness {
        Readiness::Ready { attempts } => {
            assert!(attempts >= 3, "ready too early at attempt {}", attempts);
            assert!(attempts < 10);
        }
        other => panic!("unexpected readiness: {:?}", other),
    }
    // Well short of the full ten intervals.
    assert!(start.elapsed() < Duration::from_millis(900));

    drop(handle);
    opener.join().unwrap();
}

#[tokio::test]
async fn process_dying_mid_probe_ends_the_loop_at_that_attempt() {
    let port = free_port();
    let mut handle = ProcessHandle::spawn("sh", &sh("sleep 0.25; exit 5")).unwrap();

    let readiness = wait_until_ready(
        &mut handle,
        "127.0.0.1",
        port,
        &policy(100),
        &CancelToken::new(),
    )
    .await
    .unwrap();

    match readiness {
        Readiness::ProcessDied { attempt, exit_code } => {
            assert!((2..=5).contains(&attempt), "died at attempt {}", attempt);
            assert_eq!(exit_code, Some(5));
        }
        other => panic!("unexpected readiness: {:?}", other),
    }
}

#[tokio::test]
async fn launch_gives_up_after_every_attempt() {
    let port = free_port();
    let start = Instant::now();
    let err = launch(
        "sh",
        &sh("exec sleep 30"),
        "127.0.0.1",
        port,
        &policy(30),
        &CancelToken::new(),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("not ready after 10 attempts"));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn launched_server_is_released_by_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut server = launch(
        "sh",
        &sh("exec sleep 30"),
        "127.0.0.1",
        port,
        &policy(30),
        &CancelToken::new(),
    )
    .await
    .unwrap();
    let pid = server.pid();
    assert_eq!(server.argv(), &["sh", "-c", "exec sleep 30"]);

    server.shutdown(Duration::from_secs(2)).await;
    assert!(!server.is_alive());
    assert!(signal::kill(Pid::from_raw(pid as i32), None).is_err());
}
