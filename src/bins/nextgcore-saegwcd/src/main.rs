//! NextGCore SAEGW-C daemon
//!
//! Loads the configuration, bumps the persisted restart counter and runs the
//! gateway tasks until a shutdown signal arrives. Message transport is
//! attached to the gateway handle.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nextgcore_saegwcd::config::SaegwcConfig;
use nextgcore_saegwcd::gateway::Gateway;
use nextgcore_saegwcd::restart;

/// Tick granularity of the probe and response timers
const TIMER_TICK: Duration = Duration::from_millis(100);

/// NextGCore SAEGW-C - EPC gateway session coordinator
#[derive(Parser, Debug)]
#[command(name = "nextgcore-saegwcd")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC SGW-C / PGW-C / SAEGW-C Session Coordinator", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nextgcore/saegwc.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    log::info!("NextGCore SAEGW-C v{} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);

    let config = SaegwcConfig::load(Path::new(&args.config))
        .with_context(|| format!("Failed to load configuration {}", args.config))?;

    let restart_counter = match restart::load_and_increment(&config.restart_counter_path) {
        Ok(counter) => counter,
        Err(e) => {
            log::warn!("Restart counter unavailable, using 1: {e}");
            1
        }
    };
    let recovery_ts = restart::pfcp_recovery_timestamp(SystemTime::now());

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let gateway = Gateway::new(config, restart_counter, recovery_ts).context("Failed to create gateway")?;
    let mut handle = gateway.spawn(shutdown.clone(), TIMER_TICK);

    let outbound_task = handle.take_outbound().map(|mut outbound| {
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                log::trace!("TX {} to {:?}", message.name(), message.peer());
            }
        })
    });

    log::info!("NextGCore SAEGW-C ready");

    let mut interval = tokio::time::interval(TIMER_TICK);
    loop {
        interval.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    log::info!("Shutting down...");
    handle.shutdown().await;
    if let Some(task) = outbound_task {
        task.abort();
    }

    log::info!("NextGCore SAEGW-C stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_millis();
    if args.no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.init();

    Ok(())
}

fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    Ok(())
}
