//! tally-daemon worker binary.
//!
//! Reads `config.toml` (or the path specified with `--config`), opens the
//! live ledger and the archive, seeds the periodic tasks, and runs a pool of
//! worker loops over the durable task queue.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use tally_core::config::PipelineConfig;
use tally_pipeline::{Runner, notify::LogNotifier};
use tally_store_sqlite::{SqliteArchive, SqliteStore};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Tally pipeline daemon")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Enqueue the periodic tasks on startup.
  #[arg(long)]
  seed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct DaemonConfig {
  /// Path of the live ledger database.
  #[serde(default = "default_store_path")]
  store_path:   PathBuf,
  /// Path of the long-term archive database.
  #[serde(default = "default_archive_path")]
  archive_path: PathBuf,
  #[serde(default)]
  pipeline:     PipelineConfig,
}

fn default_store_path() -> PathBuf { PathBuf::from("tally.db") }

fn default_archive_path() -> PathBuf { PathBuf::from("tally-archive.db") }

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("TALLY"))
    .build()
    .context("failed to read config file")?;

  let daemon_cfg: DaemonConfig = settings
    .try_deserialize()
    .context("failed to deserialise DaemonConfig")?;

  let store_path = expand_tilde(&daemon_cfg.store_path);
  let archive_path = expand_tilde(&daemon_cfg.archive_path);

  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open ledger at {store_path:?}"))?;
  let archive = SqliteArchive::open(&archive_path)
    .await
    .with_context(|| format!("failed to open archive at {archive_path:?}"))?;

  let workers = daemon_cfg.pipeline.workers.max(1);
  let runner =
    Runner::new(store, archive, LogNotifier, daemon_cfg.pipeline.clone());

  if cli.seed {
    runner.seed(Utc::now()).await?;
    tracing::info!("periodic tasks seeded");
  }

  tracing::info!(
    workers,
    store = %store_path.display(),
    archive = %archive_path.display(),
    "tally daemon started"
  );

  let mut handles = Vec::with_capacity(workers);
  for worker in 0..workers {
    let runner = runner.clone();
    handles.push(tokio::spawn(async move {
      if let Err(err) = runner.run().await {
        tracing::error!(worker, %err, "worker loop exited with error");
      }
    }));
  }

  for handle in handles {
    handle.await.context("worker panicked")?;
  }

  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
