//! `cellreg-sweeper`: maintenance commands for the subscription store.
//!
//! ```
//! cellreg-sweeper --config cellreg.toml sweep --writer node-a
//! cellreg-sweeper migrate
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use cellreg_core::clock::SystemClock;
use cellreg_store_sqlite::SqliteRegistry;
use cellreg_sweeper::{expand_tilde, init_tracing, load_config, run_sweep};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Subscription store maintenance")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "cellreg.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Delete subscriptions that ended longer than the grace period ago.
  Sweep {
    /// Node whose rows to sweep; defaults to `writer` from the config.
    #[arg(long)]
    writer:  Option<String>,
    /// Only list what would be deleted.
    #[arg(long)]
    dry_run: bool,
  },
  /// Convert a legacy cell-table database to the cell-array layout.
  Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  let cfg = load_config(&cli.config)?;
  init_tracing(cfg.log_format);

  let store_path = expand_tilde(&cfg.store_path);
  let registry =
    SqliteRegistry::open(&store_path, cfg.store.clone(), Arc::new(SystemClock))
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?;
  tracing::info!(path = ?store_path, schema = ?registry.schema(), "opened store");

  match cli.command {
    Command::Sweep { writer, dry_run } => {
      let writer = writer.unwrap_or(cfg.writer);
      let report = run_sweep(&registry, &writer, dry_run).await?;
      tracing::info!(
        writer = %writer,
        dry_run,
        listed = report.listed,
        deleted = report.deleted.len(),
        skipped = report.skipped,
        "sweep finished"
      );
    }
    Command::Migrate => {
      let schema = registry.migrate().await.context("migration failed")?;
      tracing::info!(?schema, "store is on the current layout");
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sweep_flags_parse() {
    let cli = Cli::try_parse_from([
      "cellreg-sweeper",
      "--config",
      "/etc/cellreg.toml",
      "sweep",
      "--writer",
      "node-a",
      "--dry-run",
    ])
    .unwrap();
    assert_eq!(cli.config, PathBuf::from("/etc/cellreg.toml"));
    assert!(matches!(
      cli.command,
      Command::Sweep { writer: Some(ref w), dry_run: true } if w == "node-a"
    ));
  }

  #[test]
  fn config_path_has_a_default() {
    let cli = Cli::try_parse_from(["cellreg-sweeper", "migrate"]).unwrap();
    assert_eq!(cli.config, PathBuf::from("cellreg.toml"));
    assert!(matches!(cli.command, Command::Migrate));
  }

  #[test]
  fn a_subcommand_is_required() {
    assert!(Cli::try_parse_from(["cellreg-sweeper"]).is_err());
  }
}
