//! # PID Locator
//!
//! Finds the process that owns a listening TCP socket. The scan runs in two
//! passes over the live process table:
//!
//! 1. processes whose name contains one of the variant's name hints and that
//!    hold a socket listening on the port;
//! 2. only when pass 1 finds nothing, any process holding such a socket.
//!
//! Processes that vanish or deny access while being inspected are skipped.
//! The table itself sits behind the [`ProcessTable`] trait; on Linux it is
//! backed by `procfs`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use tracing::{debug, trace};

use crate::cli::ServerVariant;
use crate::error::{LocateError, ProbeError};

/// Longest process name the kernel reports (`TASK_COMM_LEN - 1`).
const COMM_LEN: usize = 15;

/// Read access to the host's process and socket tables.
pub trait ProcessTable {
    /// Socket inodes in LISTEN state bound to `port` on `host` (or on the
    /// wildcard address).
    fn listening_inodes(&self, host: &str, port: u16) -> Result<HashSet<u64>, LocateError>;

    /// All live process ids.
    fn pids(&self) -> Result<Vec<u32>, LocateError>;

    /// Short process name.
    fn name(&self, pid: u32) -> Result<String, ProbeError>;

    /// Inodes of every socket the process holds open.
    fn socket_inodes(&self, pid: u32) -> Result<Vec<u64>, ProbeError>;
}

/// Name hints for a server binary: its own file name, as the kernel would
/// truncate it, followed by the variant's fixed hints.
pub fn name_hints(binary: &Path, variant: ServerVariant) -> Vec<String> {
    let mut hints = Vec::new();
    if let Some(stem) = binary.file_name().and_then(|n| n.to_str()) {
        hints.push(stem.chars().take(COMM_LEN).collect::<String>());
    }
    for hint in variant.name_hints() {
        if !hints.iter().any(|h| h == hint) {
            hints.push(hint.to_string());
        }
    }
    hints
}

/// Find the pid listening on `host:port`.
///
/// Returns `Ok(None)` when nothing listens there. Fails only when the tables
/// themselves cannot be enumerated.
pub fn locate(
    table: &dyn ProcessTable,
    host: &str,
    port: u16,
    hints: &[String],
) -> Result<Option<u32>, LocateError> {
    let inodes = table.listening_inodes(host, port)?;
    if inodes.is_empty() {
        debug!("No listening socket on {}:{}", host, port);
        return Ok(None);
    }

    let pids = table.pids()?;

    if !hints.is_empty() {
        for &pid in &pids {
            let name = match table.name(pid) {
                Ok(name) => name,
                Err(e) => {
                    trace!(pid, "Skipping process: {}", e);
                    continue;
                }
            };
            let lowered = name.to_lowercase();
            if !hints.iter().any(|h| lowered.contains(&h.to_lowercase())) {
                continue;
            }
            if holds_any(table, pid, &inodes) {
                debug!(pid, name = %name, "Located listener by name on port {}", port);
                return Ok(Some(pid));
            }
        }
    }

    for &pid in &pids {
        if holds_any(table, pid, &inodes) {
            debug!(pid, "Located listener by port {}", port);
            return Ok(Some(pid));
        }
    }

    Ok(None)
}

fn holds_any(table: &dyn ProcessTable, pid: u32, inodes: &HashSet<u64>) -> bool {
    match table.socket_inodes(pid) {
        Ok(held) => held.iter().any(|inode| inodes.contains(inode)),
        Err(e) => {
            trace!(pid, "Skipping process: {}", e);
            false
        }
    }
}

/// True when a socket bound to `local` serves connections to `host`.
fn binds_host(local: IpAddr, host: &str) -> bool {
    if local.is_unspecified() {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(wanted) => wanted.is_unspecified() || wanted == local,
        // Hostnames are not resolved here; the port decides.
        Err(_) => true,
    }
}

/// The process table of the running Linux host.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsTable;

#[cfg(target_os = "linux")]
impl ProcfsTable {
    fn probe_error(e: procfs::ProcError) -> ProbeError {
        match e {
            procfs::ProcError::NotFound(_) => ProbeError::Gone,
            procfs::ProcError::PermissionDenied(_) => ProbeError::AccessDenied,
            other => ProbeError::Other(other.to_string()),
        }
    }

    fn process(pid: u32) -> Result<procfs::process::Process, ProbeError> {
        procfs::process::Process::new(pid as i32).map_err(Self::probe_error)
    }
}

#[cfg(target_os = "linux")]
impl ProcessTable for ProcfsTable {
    fn listening_inodes(&self, host: &str, port: u16) -> Result<HashSet<u64>, LocateError> {
        use procfs::net::TcpState;

        let mut entries = procfs::net::tcp().map_err(|e| LocateError::Unreadable {
            table: "/proc/net/tcp",
            reason: e.to_string(),
        })?;
        // IPv6 may be disabled; the v4 table alone is still usable.
        if let Ok(v6) = procfs::net::tcp6() {
            entries.extend(v6);
        }

        Ok(entries
            .into_iter()
            .filter(|entry| entry.state == TcpState::Listen)
            .filter(|entry| entry.local_address.port() == port)
            .filter(|entry| binds_host(entry.local_address.ip(), host))
            .map(|entry| entry.inode)
            .collect())
    }

    fn pids(&self) -> Result<Vec<u32>, LocateError> {
        let processes =
            procfs::process::all_processes().map_err(|e| LocateError::Unreadable {
                table: "/proc",
                reason: e.to_string(),
            })?;
        Ok(processes
            .filter_map(Result::ok)
            .map(|process| process.pid as u32)
            .collect())
    }

    fn name(&self, pid: u32) -> Result<String, ProbeError> {
        let stat = Self::process(pid)?.stat().map_err(Self::probe_error)?;
        if stat.state == 'Z' {
            return Err(ProbeError::Gone);
        }
        Ok(stat.comm)
    }

    fn socket_inodes(&self, pid: u32) -> Result<Vec<u64>, ProbeError> {
        use procfs::process::FDTarget;

        let fds = Self::process(pid)?.fd().map_err(Self::probe_error)?;
        Ok(fds
            .filter_map(Result::ok)
            .filter_map(|fd| match fd.target {
                FDTarget::Socket(inode) => Some(inode),
                _ => None,
            })
            .collect())
    }
}

/// Placeholder table for platforms without procfs.
#[cfg(not(target_os = "linux"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsTable;

#[cfg(not(target_os = "linux"))]
impl ProcessTable for ProcfsTable {
    fn listening_inodes(&self, _host: &str, _port: u16) -> Result<HashSet<u64>, LocateError> {
        Err(LocateError::Unsupported)
    }

    fn pids(&self) -> Result<Vec<u32>, LocateError> {
        Err(LocateError::Unsupported)
    }

    fn name(&self, _pid: u32) -> Result<String, ProbeError> {
        Err(ProbeError::Other("unsupported platform".to_string()))
    }

    fn socket_inodes(&self, _pid: u32) -> Result<Vec<u64>, ProbeError> {
        Err(ProbeError::Other("unsupported platform".to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory process table.
    #[derive(Default)]
    pub(crate) struct FakeTable {
        pub listeners: HashMap<u16, HashSet<u64>>,
        pub processes: Vec<(u32, Result<String, ProbeError>, Result<Vec<u64>, ProbeError>)>,
    }

    impl FakeTable {
        pub fn listen(mut self, port: u16, inode: u64) -> Self {
            self.listeners.entry(port).or_default().insert(inode);
            self
        }

        pub fn process(mut self, pid: u32, name: &str, inodes: &[u64]) -> Self {
            self.processes
                .push((pid, Ok(name.to_string()), Ok(inodes.to_vec())));
            self
        }

        pub fn failing(mut self, pid: u32, err: ProbeError) -> Self {
            self.processes.push((pid, Err(err.clone()), Err(err)));
            self
        }
    }

    impl ProcessTable for FakeTable {
        fn listening_inodes(&self, _host: &str, port: u16) -> Result<HashSet<u64>, LocateError> {
            Ok(self.listeners.get(&port).cloned().unwrap_or_default())
        }

        fn pids(&self) -> Result<Vec<u32>, LocateError> {
            Ok(self.processes.iter().map(|(pid, _, _)| *pid).collect())
        }

        fn name(&self, pid: u32) -> Result<String, ProbeError> {
            self.processes
                .iter()
                .find(|(p, _, _)| *p == pid)
                .map(|(_, name, _)| name.clone())
                .unwrap_or(Err(ProbeError::Gone))
        }

        fn socket_inodes(&self, pid: u32) -> Result<Vec<u64>, ProbeError> {
            self.processes
                .iter()
                .find(|(p, _, _)| *p == pid)
                .map(|(_, _, inodes)| inodes.clone())
                .unwrap_or(Err(ProbeError::Gone))
        }
    }

    fn hints(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_name_pass_wins_over_earlier_port_match() {
        // A forwarding proxy listed first shares the socket; the named
        // server must still be chosen.
        let table = FakeTable::default()
            .listen(8080, 42)
            .process(100, "socat", &[42])
            .process(200, "epoll_server", &[7, 42]);

        let pid = locate(&table, "127.0.0.1", 8080, &hints(&["server"])).unwrap();
        assert_eq!(pid, Some(200));
    }

    #[test]
    fn test_port_only_fallback_when_no_name_matches() {
        let table = FakeTable::default()
            .listen(8080, 42)
            .process(100, "bash", &[1])
            .process(300, "renamed_build", &[42]);

        let pid = locate(&table, "127.0.0.1", 8080, &hints(&["server", "echo"])).unwrap();
        assert_eq!(pid, Some(300));
    }

    #[test]
    fn test_vanished_and_denied_processes_are_skipped() {
        let table = FakeTable::default()
            .listen(9000, 5)
            .failing(10, ProbeError::Gone)
            .failing(11, ProbeError::AccessDenied)
            .process(12, "chat_server", &[5]);

        let pid = locate(&table, "0.0.0.0", 9000, &hints(&["chat_server"])).unwrap();
        assert_eq!(pid, Some(12));
    }

    #[test]
    fn test_no_listener_is_none() {
        let table = FakeTable::default()
            .listen(8080, 42)
            .process(200, "epoll_server", &[42]);
        assert_eq!(locate(&table, "127.0.0.1", 8081, &hints(&["server"])).unwrap(), None);
    }

    #[test]
    fn test_name_hints_truncate_binary_name() {
        let hints = name_hints(
            Path::new("/opt/build/epoll_server_release_x86"),
            ServerVariant::Epoll,
        );
        assert_eq!(hints[0], "epoll_server_re");
        assert!(hints.contains(&"echo".to_string()));
        // "server" appears once even though both sources could add it.
        assert_eq!(hints.iter().filter(|h| *h == "server").count(), 1);
    }

    #[test]
    fn test_binds_host() {
        assert!(binds_host("0.0.0.0".parse().unwrap(), "127.0.0.1"));
        assert!(binds_host("127.0.0.1".parse().unwrap(), "127.0.0.1"));
        assert!(!binds_host("10.0.0.1".parse().unwrap(), "127.0.0.1"));
        assert!(binds_host("10.0.0.1".parse().unwrap(), "localhost"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_finds_own_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let pid = locate(&ProcfsTable, "127.0.0.1", port, &[]).unwrap();
        assert_eq!(pid, Some(std::process::id()));
    }
}
