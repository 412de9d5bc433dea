//! # Server Bench - Main Entry Point
//!
//! Sweeps server thread counts and client connection counts against an
//! io_uring or epoll echo server and records throughput (and optionally
//! syscall counts) for every combination.
//!
//! ## Execution Flow
//!
//! 1. **Initialize logging**: colorized console output, optional log file
//! 2. **Load settings**: the JSON settings file plus environment overrides;
//!    a missing file is created with defaults, registrations are saved
//! 3. **Resolve the server binary**: first executable candidate wins
//! 4. **Build the plan**: CLI flags override settings, then validation
//! 5. **Build the client**: unless `--skip-compile`
//! 6. **Run the sweep**: Ctrl-C cancels it through the same cleanup paths
//!
//! ## Exit Codes
//!
//! - `0`: every requested combination produced a result
//! - `1`: anything else (no binary, failed combinations, interrupt)

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

use server_bench::{
    cli::Args,
    client::{self, BenchClient},
    config::{split_address, EnvOverrides, HarnessConfig, Loaded},
    locator::ProcfsTable,
    logging,
    orchestrator::{Orchestrator, SweepPlan},
    resolver,
    results::RunArtifacts,
    trace::TracerCommand,
    utils::{self, format_duration},
    CancelToken,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Server Bench v{}", server_bench::VERSION);
    debug!("Configuration: {:?}", args);

    let mut config = match HarnessConfig::load_or_default(&args.config) {
        Loaded::Missing(config) => {
            if let Err(e) = config.save(&args.config) {
                warn!("Could not create default settings: {}", e);
            }
            config
        }
        Loaded::FromFile(config) | Loaded::Unusable(config) => config,
    };
    let overrides = EnvOverrides::from_env();

    if let Some(variant) = args.set_default_type {
        config.set_default_variant(variant);
        config.save(&args.config)?;
        info!("Default server type set to {}", variant);
    }

    let variant = args
        .server_type
        .unwrap_or_else(|| overrides.default_variant(&config));

    if let Some(path) = &args.server_path {
        match resolver::register_path(&mut config, variant, path) {
            Ok(stored) => {
                config.save(&args.config)?;
                info!("Registered {} as {} server binary", stored.display(), variant);
            }
            Err(e) => {
                error!("Cannot register server path: {}", e);
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let server_path = match resolver::resolve(&config, &overrides, variant) {
        Ok(path) => path,
        Err(e) => {
            error!("{}", e);
            error!("Register a binary with --server-path or set SERVER_BINARY_PATH");
            return Ok(ExitCode::FAILURE);
        }
    };
    info!("Using {} server: {}", variant, server_path.display());

    let plan = build_plan(&args, &config, variant, server_path)?;
    let cancel = CancelToken::new();
    let _ctrl_c = cancel.cancel_on_ctrl_c();

    if !args.skip_compile {
        if let Err(e) = client::build(&config.benchmark_build, &cancel).await {
            error!("Failed to build the benchmark client: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    }

    let results_dir = args
        .results_dir
        .clone()
        .unwrap_or_else(|| config.results_dir.clone());
    let artifacts = RunArtifacts::create(&results_dir, &utils::run_timestamp())?;

    let estimate = utils::estimate_sweep_time(
        plan.threads.len(),
        plan.connections.len(),
        plan.duration,
        plan.cooldown,
        plan.runs_per_combination(),
        plan.trace_overhead(),
    );
    info!(
        "Sweep: threads {:?} x connections {:?}, {} per run (estimated {})",
        plan.threads,
        plan.connections,
        format_duration(plan.duration),
        format_duration(estimate)
    );

    let mut orchestrator = Orchestrator::new(
        plan,
        BenchClient::new(config.benchmark_tool.clone()),
        TracerCommand::new(config.tracer.clone()),
        Box::new(ProcfsTable),
        artifacts,
        cancel,
    )?;
    let report = orchestrator
        .run()
        .await
        .context("Benchmark sweep aborted")?;

    info!(
        "Results in {}",
        orchestrator.artifacts().run_dir().display()
    );
    for failure in &report.failures {
        warn!(
            "Failed: threads={} connections={} {}: {}",
            failure.thread_count,
            failure
                .connection_count
                .map_or_else(|| "all".to_string(), |c| c.to_string()),
            if failure.traced { "(traced)" } else { "(regular)" },
            failure.reason
        );
    }

    if report.is_complete() {
        info!("All {} benchmark runs completed", report.results.len());
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            "Sweep incomplete: {} result(s), {} failure(s){}",
            report.results.len(),
            report.failures.len(),
            if report.cancelled { ", interrupted" } else { "" }
        );
        Ok(ExitCode::FAILURE)
    }
}

/// Merge CLI flags over the settings and validate the result.
fn build_plan(
    args: &Args,
    config: &HarnessConfig,
    variant: server_bench::ServerVariant,
    server_path: std::path::PathBuf,
) -> Result<SweepPlan> {
    let address = args
        .server_address
        .as_deref()
        .unwrap_or(&config.default_server_address);
    let (host, port) = split_address(address)?;
    utils::validate_port(port)?;

    let threads = if args.threads.is_empty() {
        config.default_threads.clone()
    } else {
        args.threads.clone()
    };
    let connections = if args.connections.is_empty() {
        config.default_connections.clone()
    } else {
        args.connections.clone()
    };
    utils::validate_counts("threads", &threads)?;
    utils::validate_counts("connections", &connections)?;

    let duration = args.duration.unwrap_or_else(|| config.default_duration());
    utils::validate_duration(duration)?;
    let message_length = args.message_length.unwrap_or(config.message_length);
    utils::validate_message_size(message_length)?;

    if args.no_regular && !args.strace {
        anyhow::bail!("Nothing to run: --no-regular given without --strace");
    }
    if args.strace && config.tracer.is_empty() {
        anyhow::bail!("--strace requires a tracer command in the settings file");
    }
    if config.benchmark_tool.is_empty() {
        anyhow::bail!("No benchmark client command in the settings file");
    }

    let mut plan = SweepPlan::new(variant, server_path, host, port, threads, connections);
    plan.duration = duration;
    plan.message_length = message_length;
    plan.run_regular = !args.no_regular;
    plan.run_trace = args.strace;
    plan.trace_mode = args.trace_mode;
    plan.cooldown = args.cooldown;
    Ok(plan)
}
