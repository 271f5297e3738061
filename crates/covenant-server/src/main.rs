//! `covenant`: server and administrative CLI for the Covenant engine.
//!
//! # Usage
//!
//! ```text
//! covenant serve
//! covenant --config /etc/covenant.toml rebuild subscription <uuid>
//! covenant reconcile-wallets
//! covenant evaluate --category wallet_drift
//! ```

mod admin;
mod config;
mod serve;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use covenant_core::{invariant::ViolationCategory, stream::StreamType};
use covenant_engine::Engine;
use covenant_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::{ServerConfig, expand_tilde};

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(author, version, about = "Covenant consistency engine")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml", env = "COVENANT_CONFIG")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Serve HTTP and run the projector and evaluator loops.
  Serve,
  /// Rebuild one aggregate's projection from its stream.
  Rebuild {
    stream_type: StreamType,
    id:          Uuid,
  },
  /// Rebuild every projection, resuming an interrupted run.
  RebuildAll,
  /// Rebuild one wallet and audit any balance change.
  ReconcileWallet { creator_id: Uuid },
  /// Reconcile every wallet, resuming an interrupted run.
  ReconcileWallets,
  /// Run the invariant predicates once.
  Evaluate {
    #[arg(long)]
    creator_id: Option<Uuid>,
    /// Restrict to these categories (repeatable).
    #[arg(long = "category")]
    categories: Vec<ViolationCategory>,
  },
  /// Expire subscriptions whose grace period has run out.
  SweepGrace {
    /// Evaluate as of this instant (RFC 3339) instead of now.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
  },
  /// Re-post ledger credits for payments that have none.
  RepairLedger {
    #[arg(long)]
    creator_id: Option<Uuid>,
  },
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let cfg = ServerConfig::load(&cli.config)?;

  let store_path = expand_tilde(&cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let engine = Engine::new(Arc::new(store), cfg.engine_config()?);

  match cli.command {
    Command::Serve => {
      serve::run(engine, &cfg).await?;
      Ok(ExitCode::SUCCESS)
    }
    Command::Rebuild { stream_type, id } => {
      admin::rebuild(&engine, stream_type, id).await
    }
    Command::RebuildAll => admin::rebuild_all(&engine).await,
    Command::ReconcileWallet { creator_id } => {
      admin::reconcile_wallet(&engine, creator_id).await
    }
    Command::ReconcileWallets => admin::reconcile_wallets(&engine).await,
    Command::Evaluate { creator_id, categories } => {
      admin::evaluate(&engine, creator_id, categories).await
    }
    Command::SweepGrace { now } => admin::sweep_grace(&engine, now).await,
    Command::RepairLedger { creator_id } => {
      admin::repair_ledger(&engine, creator_id).await
    }
  }
}
