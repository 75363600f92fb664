//! mongo-recorder - MongoDB Traffic Recorder
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use mongo_recorder::config::{CliArgs, RecordConfig, ServerSelection};
use mongo_recorder::progress::{print_header, print_summary};
use mongo_recorder::topology::{build_plan, resolve_servers};
use mongo_recorder::{OplogMerge, Recorder, RecorderOptions};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Connect / server selection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Records fetched per poll
const POLL_BATCH_SIZE: i64 = 1000;

/// Server-side time limit of one poll
const POLL_MAX_TIME: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Merge config file and flags
    let config = RecordConfig::load(&args).context("Invalid configuration")?;
    log_config(&config);

    if config.noop {
        println!("{}", config.effective_toml().context("Failed to render configuration")?);
        info!("Skipping recording as per --noop");
        return Ok(());
    }

    // Connect before anything is recorded
    let servers = resolve_servers(&config, CONNECT_TIMEOUT).context("Failed to determine servers")?;
    let plan = build_plan(&config, &servers, CONNECT_TIMEOUT, POLL_BATCH_SIZE, POLL_MAX_TIME)
        .context("Failed to connect to the servers")?;

    print_header(&config, &plan);

    let mut recorder = Recorder::new(RecorderOptions::default(), OplogMerge);

    // Setup signal handler: first interrupt stops, second exits
    let stop_flag = recorder.stop_flag();
    ctrlc::set_handler(move || {
        if stop_flag.swap(true, Ordering::SeqCst) {
            eprintln!("\nSecond interrupt, exiting now");
            std::process::exit(130);
        }
        eprintln!("\nTrying to gracefully exit the recording...");
    })
    .context("Failed to set signal handler")?;

    let summary = recorder
        .record(plan, config.duration)
        .context("Recording failed")?;

    print_summary(&summary);

    if summary.interrupted() {
        warn!("Recording was interrupted before the window ended");
    }
    if summary.write_failures > 0 {
        warn!(failures = summary.write_failures, "Some records could not be written");
    }

    Ok(())
}

fn log_config(config: &RecordConfig) {
    match &config.servers {
        ServerSelection::Explicit { oplog, profilers } => {
            info!(server = %oplog, "Oplog server");
            for (index, profiler) in profilers.iter().enumerate() {
                info!(index = index, server = %profiler, "Profiler server");
            }
        }
        ServerSelection::Auto(options) => {
            info!(
                router = %options.router_spec(),
                use_secondaries = options.use_secondaries,
                "Servers will be discovered"
            );
        }
    }
    info!(seconds = config.duration.as_secs(), "Recording duration");
    info!(databases = ?config.targets.databases, "Target databases");
    info!(collections = ?config.targets.collections, "Target collections");
    info!(path = %config.oplog_output.display(), "Oplog output file");
    info!(path = %config.output.display(), "Output file");
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("mongo_recorder=debug,warn")
    } else {
        EnvFilter::new("mongo_recorder=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
