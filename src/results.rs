//! # Results and Artifacts
//!
//! Everything a sweep leaves on disk:
//!
//! - **CSV logs** ([`CsvLog`]): append-only, one header per file. The header
//!   is fixed by the first row written (or read back from an existing file)
//!   and later rows are mapped onto it by column name.
//! - **Run directory** ([`RunArtifacts`]): raw client output, error
//!   post-mortems, tracer reports and the human-readable [`RunLog`].
//! - **Sweep summary** ([`SweepSummary`]): one JSON document with metadata,
//!   all results and all failures, written at the end of every sweep.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::cli::{ServerVariant, TraceMode};
use crate::parsers::BenchMetrics;

/// Number of syscall columns written per CSV row.
pub const TOP_SYSCALLS: usize = 10;

const ROW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Syscall name to call count, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallHistogram {
    entries: Vec<(String, u64)>,
}

impl SyscallHistogram {
    /// Add `count` calls of `name`, keeping its first-seen position.
    pub fn add(&mut self, name: &str, count: u64) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, c)) => *c += count,
            None => self.entries.push((name.to_string(), count)),
        }
    }

    /// Fold another histogram into this one.
    pub fn merge(&mut self, other: &SyscallHistogram) {
        for (name, count) in other.iter() {
            self.add(name, count);
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| *c)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|(_, c)| c).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), *c))
    }

    /// The `n` most frequent syscalls, highest count first. Ties keep
    /// first-seen order.
    pub fn top(&self, n: usize) -> Vec<(&str, u64)> {
        let mut sorted: Vec<(&str, u64)> = self.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted.truncate(n);
        sorted
    }
}

impl Serialize for SyscallHistogram {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, count) in &self.entries {
            map.serialize_entry(name, count)?;
        }
        map.end()
    }
}

/// Outcome of one client run against one server configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkResult {
    pub connection_count: u32,
    pub thread_count: u32,
    pub tps_request: u64,
    pub tps_response: u64,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscalls: Option<SyscallHistogram>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_syscalls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_pid: Option<u32>,
    pub timestamp: DateTime<Local>,
}

impl BenchmarkResult {
    pub fn new(connection_count: u32, thread_count: u32, metrics: BenchMetrics) -> Self {
        Self {
            connection_count,
            thread_count,
            tps_request: metrics.tps_request,
            tps_response: metrics.tps_response,
            success_rate: metrics.success_rate,
            syscalls: None,
            total_syscalls: None,
            server_pid: None,
            timestamp: Local::now(),
        }
    }

    /// Attach a collected syscall histogram.
    pub fn with_trace(mut self, server_pid: u32, syscalls: SyscallHistogram, total: u64) -> Self {
        self.server_pid = Some(server_pid);
        self.syscalls = Some(syscalls);
        self.total_syscalls = Some(total);
        self
    }

    pub fn is_traced(&self) -> bool {
        self.syscalls.is_some()
    }

    /// Named CSV cells in column order.
    pub fn csv_row(&self) -> Vec<(String, String)> {
        let mut row = vec![
            cell("connection_count", self.connection_count),
            cell("thread_count", self.thread_count),
            cell("tps_request", self.tps_request),
            cell("tps_response", self.tps_response),
            cell("success_rate", format!("{:.2}", self.success_rate)),
        ];
        if let Some(syscalls) = &self.syscalls {
            row.push(cell("total_syscalls", self.total_syscalls.unwrap_or(0)));
            row.extend(syscall_cells(syscalls));
        }
        row.push(cell("timestamp", self.timestamp.format(ROW_TIME_FORMAT)));
        row
    }
}

/// Per-thread-count summary of a follow-mode trace.
pub fn follow_row(
    thread_count: u32,
    processes: usize,
    histogram: &SyscallHistogram,
) -> Vec<(String, String)> {
    let mut row = vec![
        cell("thread_count", thread_count),
        cell("traced_processes", processes),
        cell("total_syscalls", histogram.total()),
    ];
    row.extend(syscall_cells(histogram));
    row.push(cell("timestamp", Local::now().format(ROW_TIME_FORMAT)));
    row
}

fn syscall_cells(histogram: &SyscallHistogram) -> Vec<(String, String)> {
    histogram
        .top(TOP_SYSCALLS)
        .into_iter()
        .map(|(name, count)| cell(&format!("syscall_{}", name), count))
        .collect()
}

fn cell(name: &str, value: impl std::fmt::Display) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// Append-only CSV file with a single header row.
#[derive(Debug)]
pub struct CsvLog {
    path: PathBuf,
    header: Option<Vec<String>>,
}

impl CsvLog {
    /// Open `path` for appending. An existing header is read back so new
    /// rows line up with it.
    pub fn open(path: &Path) -> Result<Self> {
        let header = if path.exists() && std::fs::metadata(path)?.len() > 0 {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let header: Vec<String> = reader
                .headers()
                .with_context(|| format!("Failed to read header of {}", path.display()))?
                .iter()
                .map(str::to_string)
                .collect();
            debug!("Appending to {} ({} columns)", path.display(), header.len());
            Some(header)
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    /// Append one row. The first row on an empty file fixes the header.
    pub fn append(&mut self, row: &[(String, String)]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        let header = match &self.header {
            Some(header) => header.clone(),
            None => {
                let header: Vec<String> = row.iter().map(|(name, _)| name.clone()).collect();
                writer.write_record(&header)?;
                self.header = Some(header.clone());
                header
            }
        };

        let record: Vec<&str> = header
            .iter()
            .map(|column| {
                row.iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, value)| value.as_str())
                    .unwrap_or("")
            })
            .collect();
        writer.write_record(&record)?;
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn append_result(&mut self, result: &BenchmarkResult) -> Result<()> {
        self.append(&result.csv_row())
    }
}

/// Paths of everything one sweep writes.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    results_dir: PathBuf,
    run_dir: PathBuf,
    timestamp: String,
}

impl RunArtifacts {
    /// Create `results_dir/combined_benchmark_<timestamp>/`.
    pub fn create(results_dir: &Path, timestamp: &str) -> Result<Self> {
        let run_dir = results_dir.join(format!("combined_benchmark_{}", timestamp));
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create {}", run_dir.display()))?;
        info!("Writing run artifacts to {}", run_dir.display());
        Ok(Self {
            results_dir: results_dir.to_path_buf(),
            run_dir,
            timestamp: timestamp.to_string(),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn regular_csv(&self) -> PathBuf {
        self.results_dir
            .join(format!("regular_results_{}.csv", self.timestamp))
    }

    pub fn strace_csv(&self) -> PathBuf {
        self.results_dir
            .join(format!("strace_results_{}.csv", self.timestamp))
    }

    pub fn follow_csv(&self) -> PathBuf {
        self.results_dir
            .join(format!("follow_syscalls_{}.csv", self.timestamp))
    }

    pub fn summary_json(&self) -> PathBuf {
        self.results_dir
            .join(format!("sweep_summary_{}.json", self.timestamp))
    }

    pub fn run_log(&self) -> PathBuf {
        self.run_dir.join("benchmark_log.txt")
    }

    pub fn raw_output(&self, connections: u32, threads: u32) -> PathBuf {
        self.run_dir.join(format!(
            "regular_benchmark_conn_{}_threads_{}_{}.txt",
            connections,
            threads,
            crate::utils::run_timestamp()
        ))
    }

    pub fn error_report(&self, connections: u32, threads: u32) -> PathBuf {
        self.run_dir.join(format!(
            "error_conn_{}_threads_{}_{}.txt",
            connections,
            threads,
            crate::utils::run_timestamp()
        ))
    }

    pub fn strace_log(&self, pid: u32, connections: u32) -> PathBuf {
        self.run_dir.join(format!(
            "strace_server_pid_{}_conn_{}_{}.log",
            pid,
            connections,
            crate::utils::run_timestamp()
        ))
    }

    /// Output prefix for a follow-mode tracer; the tracer appends `.<tid>`.
    pub fn follow_prefix(&self, threads: u32) -> PathBuf {
        self.run_dir
            .join(format!("strace_follow_threads_{}_{}", threads, self.timestamp))
    }
}

/// Write a post-mortem for a failed client run. Appends when the file exists.
pub fn write_error_report(
    path: &Path,
    command: &[String],
    exit_code: Option<i32>,
    stderr: &str,
    stdout: &str,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "Command: {}", command.join(" "))?;
    match exit_code {
        Some(code) => writeln!(file, "Exit code: {}", code)?,
        None => writeln!(file, "Exit code: none (killed by signal)")?,
    }
    writeln!(file, "\n--- stderr ---\n{}", stderr)?;
    writeln!(file, "--- stdout ---\n{}", stdout)?;
    file.flush()?;
    Ok(())
}

/// Human-readable log of one sweep.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a section banner.
    pub fn section(&self, title: &str) -> Result<()> {
        let rule = "=".repeat(60);
        self.write(&format!(
            "\n{}\n{} ({})\n{}",
            rule,
            title,
            Local::now().format(ROW_TIME_FORMAT),
            rule
        ))
    }

    /// Write one timestamped line.
    pub fn line(&self, message: &str) -> Result<()> {
        self.write(&format!(
            "[{}] {}",
            Local::now().format(ROW_TIME_FORMAT),
            message
        ))
    }

    fn write(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", text)?;
        Ok(())
    }
}

/// A combination that produced no result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub thread_count: u32,
    /// `None` when the whole thread-count iteration failed.
    pub connection_count: Option<u32>,
    pub traced: bool,
    pub reason: String,
}

/// Metadata block of the sweep summary.
#[derive(Debug, Clone, Serialize)]
pub struct SweepMetadata {
    pub version: String,
    pub variant: ServerVariant,
    pub server_path: PathBuf,
    pub server_address: String,
    pub trace_mode: Option<TraceMode>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub cancelled: bool,
}

/// Final JSON document of a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub metadata: SweepMetadata,
    pub total_results: usize,
    pub total_failures: usize,
    pub results: Vec<BenchmarkResult>,
    pub failures: Vec<FailureRecord>,
}

impl SweepSummary {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Sweep summary written to {}", path.display());
        Ok(())
    }
}
