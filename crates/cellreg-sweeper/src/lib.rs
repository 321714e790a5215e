//! Operator tooling for the subscription store: configuration loading,
//! logging setup and the expiry sweep.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use cellreg_store_sqlite::{RegistryConfig, SqliteRegistry, SweepReport};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  #[default]
  Text,
  Json,
}

/// Top-level configuration, loaded from `cellreg.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
  pub store_path: PathBuf,
  /// Node name whose expired rows `sweep` removes. Empty selects rows that
  /// were never attributed to a node.
  pub writer:     String,
  pub log_format: LogFormat,
  pub store:      RegistryConfig,
}

impl Default for SweeperConfig {
  fn default() -> Self {
    Self {
      store_path: PathBuf::from("~/.local/share/cellreg/subscriptions.db"),
      writer:     String::new(),
      log_format: LogFormat::default(),
      store:      RegistryConfig::default(),
    }
  }
}

/// Read `path` (if it exists) and layer `CELLREG_*` environment variables on
/// top. Nested keys use a double underscore, e.g.
/// `CELLREG_STORE__BUSY_TIMEOUT_MS`.
pub fn load_config(path: &Path) -> anyhow::Result<SweeperConfig> {
  let settings = config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(
      config::Environment::with_prefix("CELLREG")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?;

  settings
    .try_deserialize()
    .context("failed to deserialise SweeperConfig")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

// ─── Logging ──────────────────────────────────────────────────────────────────

pub fn init_tracing(format: LogFormat) {
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::INFO.into())
    .from_env_lossy();
  let builder = tracing_subscriber::fmt().with_env_filter(filter);
  match format {
    LogFormat::Text => builder.init(),
    LogFormat::Json => builder.json().init(),
  }
}

// ─── Sweep ────────────────────────────────────────────────────────────────────

/// Remove `writer`'s expired subscriptions. With `dry_run` the rows are only
/// listed.
pub async fn run_sweep(
  registry: &SqliteRegistry,
  writer: &str,
  dry_run: bool,
) -> anyhow::Result<SweepReport> {
  if !dry_run {
    return registry
      .sweep_expired(writer)
      .await
      .with_context(|| format!("sweep failed for writer {writer:?}"));
  }

  let expired = registry
    .list_expired(writer)
    .await
    .with_context(|| format!("listing expired rows failed for writer {writer:?}"))?;
  for sub in &expired {
    tracing::info!(id = %sub.id, owner = %sub.owner, end_time = ?sub.end_time, "would delete");
  }
  Ok(SweepReport { listed: expired.len(), ..SweepReport::default() })
}
