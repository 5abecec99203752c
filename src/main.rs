//! Archive engine daemon.
//!
//! Loads a channel configuration, samples the channels from the simulated
//! data sources and writes one CSV file per channel below the output
//! directory until interrupted.
//!
//! ```bash
//! archive_engine config/archive_engine.toml /var/archive/run1 --log-format json
//! ```

use anyhow::{bail, Context, Result};
use archive_engine::data::storage::CsvStorage;
use archive_engine::logging::{self, LogFormat, TracingConfig};
use archive_engine::source::sim::SimContext;
use archive_engine::{Engine, EngineConfig, SharedClock, SystemClock};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Marks an output directory as in use by a running engine.
const LOCK_FILE: &str = "archive_active.lck";
/// Snapshot of the configuration actually in effect, written on shutdown.
const ONLINE_CONFIG: &str = "onlineconfig.toml";

#[derive(Parser)]
#[command(name = "archive_engine")]
#[command(about = "Samples process channels and archives them to disk", long_about = None)]
struct Cli {
    /// Engine configuration (TOML)
    config: PathBuf,

    /// Directory receiving the channel files
    output: PathBuf,

    /// Free-text description reported in the engine status
    #[arg(long, default_value = "Archive Engine")]
    description: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    log_format: LogFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Milliseconds between simulated source updates
    #[arg(long, default_value = "100")]
    sim_rate: u64,
}

/// Lock file held for the lifetime of the engine.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        if path.exists() {
            bail!(
                "found lock file '{}': another engine may be writing to this directory",
                path.display()
            );
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot create lock file '{}'", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot remove lock file");
        }
    }
}

/// Resolve on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("cannot listen for Ctrl-C")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let tracing_config =
        TracingConfig::from_args(&cli.log_level, cli.log_format).map_err(anyhow::Error::msg)?;
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("cannot load '{}'", cli.config.display()))?;

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("cannot create '{}'", cli.output.display()))?;
    let _lock = DirLock::acquire(&cli.output)?;

    let clock: SharedClock = Arc::new(SystemClock);
    let sources = Arc::new(SimContext::start(
        Arc::clone(&clock),
        Duration::from_millis(cli.sim_rate.max(1)),
    )?);
    let storage = Box::new(CsvStorage::new(&cli.output, config.file_size));
    let engine = Arc::new(Engine::from_config(&config, clock, sources.clone(), storage)?);
    engine.set_description(cli.description.clone());

    tracing::info!(
        config = %cli.config.display(),
        output = %cli.output.display(),
        description = %cli.description,
        "starting archive engine"
    );
    engine.start()?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let worker = {
        let engine = Arc::clone(&engine);
        let keep_running = Arc::clone(&keep_running);
        tokio::task::spawn_blocking(move || engine.run(&keep_running))
    };

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    keep_running.store(false, Ordering::SeqCst);
    worker.await.context("engine loop panicked")?;

    let shutdown = engine.shutdown();
    sources.shutdown();
    let written = shutdown.context("engine did not stop cleanly")?;
    tracing::info!(samples = written, "final write done");

    let online = cli.output.join(ONLINE_CONFIG);
    engine
        .write_config(&online)
        .with_context(|| format!("cannot write '{}'", online.display()))?;

    let status = serde_json::to_string(&engine.status())?;
    tracing::info!(%status, "archive engine stopped");
    Ok(())
}
