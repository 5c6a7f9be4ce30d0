//! USDT Exporter
//!
//! Compiles the configured eBPF programs, attaches them to the USDT probes
//! and uprobes of every process running the target binaries, and serves the
//! programs' tables as Prometheus metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Serve metrics for the programs in config.yaml on :8080/metrics
//! sudo ./usdt-exporter --config config.yaml
//!
//! # Custom address and path, verbose logging
//! sudo ./usdt-exporter --config config.yaml --listen-address 127.0.0.1:9435 \
//!     --metrics-path /probe-metrics --verbose
//!
//! # Compile with a specific clang
//! sudo ./usdt-exporter --config config.yaml --clang /usr/bin/clang-17
//!
//! # Running in a container with the host's procfs mounted at /host/proc
//! sudo ./usdt-exporter --config config.yaml --proc-root /host/proc
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use usdt_common::{DEFAULT_LISTEN_ADDRESS, DEFAULT_METRICS_PATH, PROC_ROOT};
use usdt_exporter::{
    exporter::{serve, shutdown_signal, AppState},
    AyaRuntime, Config, Exporter, ProcessLocator,
};

/// Prometheus exporter for USDT probes and uprobes using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Configuration file declaring the programs to attach
    #[clap(short, long)]
    config: PathBuf,

    /// Address to serve metrics on
    #[clap(long, default_value = DEFAULT_LISTEN_ADDRESS)]
    listen_address: SocketAddr,

    /// Path under which to expose metrics
    #[clap(long, default_value = DEFAULT_METRICS_PATH)]
    metrics_path: String,

    /// Compiler used to build the instrumentation
    #[clap(long, default_value = "clang")]
    clang: PathBuf,

    /// procfs mount to discover and instrument processes through
    #[clap(long, default_value = PROC_ROOT)]
    proc_root: PathBuf,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("Starting USDT exporter...");
    info!("   Config: {:?}", args.config);
    info!("   Listen address: {}", args.listen_address);
    info!("   Metrics path: {}", args.metrics_path);

    let config = Config::from_file(&args.config)?;
    info!("  ✓ Loaded {} programs", config.programs.len());

    // Installed before attaching, so a stop request during a slow attach
    // still ends in a clean detach
    let shutdown = shutdown_signal()?;

    let locator = ProcessLocator::new(args.proc_root);
    let runtime = Arc::new(AyaRuntime::new(args.clang).with_proc_root(locator.root()));
    let mut exporter = Exporter::new(config, runtime, locator)?;
    exporter.attach().context("Error attaching probes")?;

    let exporter = Arc::new(exporter);
    let state = Arc::new(AppState::new(Arc::clone(&exporter), &args.metrics_path)?);

    serve(state, args.listen_address, shutdown).await?;

    // The server has released its handles, so the exporter can be closed
    // before the process exits.
    match Arc::try_unwrap(exporter) {
        Ok(mut exporter) => exporter.close(),
        Err(_) => warn!("Exporter still in use at shutdown; relying on drop"),
    }

    info!("Shutdown complete");
    Ok(())
}
