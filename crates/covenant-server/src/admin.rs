//! Out-of-band administrative operations. Each prints a JSON report on
//! stdout; progress and anomalies go to the log.

use std::{
  collections::BTreeSet,
  process::ExitCode,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use covenant_core::{
  invariant::{EvaluationScope, ViolationCategory},
  stream::{StreamId, StreamType},
};
use covenant_engine::Engine;
use covenant_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

fn print(report: &impl Serialize) -> anyhow::Result<()> {
  let out = serde_json::to_string_pretty(report).context("failed to encode report")?;
  println!("{out}");
  Ok(())
}

/// A flag raised on ctrl-c, for jobs that checkpoint and stop cleanly.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
  let cancel = Arc::new(AtomicBool::new(false));
  let flag = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("cancellation requested, stopping after the current aggregate");
      flag.store(true, Ordering::Relaxed);
    }
  });
  cancel
}

pub async fn rebuild(
  engine: &Engine<SqliteStore>,
  stream_type: StreamType,
  id: Uuid,
) -> anyhow::Result<ExitCode> {
  let stream = StreamId::new(stream_type, id);
  let outcome = engine
    .reconciler()
    .rebuild(stream)
    .await
    .with_context(|| format!("failed to rebuild {stream}"))?;
  let clean = outcome.anomaly.is_none();
  print(&json!({
    "stream": outcome.stream,
    "replayed": outcome.replayed,
    "changed": outcome.previous != outcome.current,
    "current": outcome.current,
    "anomaly": outcome.anomaly,
  }))?;
  Ok(exit_code(clean))
}

pub async fn rebuild_all(engine: &Engine<SqliteStore>) -> anyhow::Result<ExitCode> {
  let cancel = cancel_on_ctrl_c();
  let reports = engine
    .reconciler()
    .rebuild_all(&cancel)
    .await
    .context("rebuild-all failed")?;
  print(&reports)?;
  let clean = reports.iter().all(|r| r.is_complete() && r.faulted.is_empty());
  Ok(exit_code(clean))
}

pub async fn reconcile_wallet(
  engine: &Engine<SqliteStore>,
  creator_id: Uuid,
) -> anyhow::Result<ExitCode> {
  let result = engine
    .reconciler()
    .reconcile_wallet(creator_id)
    .await
    .with_context(|| format!("failed to reconcile wallet {creator_id}"))?;
  print(&result)?;
  Ok(exit_code(result.anomaly.is_none()))
}

pub async fn reconcile_wallets(
  engine: &Engine<SqliteStore>,
) -> anyhow::Result<ExitCode> {
  let cancel = cancel_on_ctrl_c();
  let report = engine
    .reconciler()
    .reconcile_all_wallets(&cancel)
    .await
    .context("reconcile-wallets failed")?;
  print(&report)?;
  Ok(exit_code(report.is_complete() && report.faulted.is_empty()))
}

/// Exits non-zero while any violation is open.
pub async fn evaluate(
  engine: &Engine<SqliteStore>,
  creator_id: Option<Uuid>,
  categories: Vec<ViolationCategory>,
) -> anyhow::Result<ExitCode> {
  let scope = EvaluationScope {
    categories: categories.into_iter().collect::<BTreeSet<_>>(),
    creator_id,
  };
  let eval = engine
    .evaluator()
    .evaluate(scope, Utc::now())
    .await
    .context("evaluation failed")?;
  let healthy = eval.is_healthy();
  print(&json!({
    "healthy": healthy,
    "evaluated_at": eval.evaluated_at,
    "by_category": eval.by_category(),
    "violations": eval.violations,
  }))?;
  Ok(exit_code(healthy))
}

pub async fn sweep_grace(
  engine: &Engine<SqliteStore>,
  now: Option<DateTime<Utc>>,
) -> anyhow::Result<ExitCode> {
  let report = engine
    .sweeper()
    .sweep(now.unwrap_or_else(Utc::now))
    .await
    .context("grace sweep failed")?;
  print(&report)?;
  Ok(ExitCode::SUCCESS)
}

pub async fn repair_ledger(
  engine: &Engine<SqliteStore>,
  creator_id: Option<Uuid>,
) -> anyhow::Result<ExitCode> {
  // Fold anything already in the log first so only truly missing credits
  // are re-posted.
  engine
    .projector()
    .catch_up()
    .await
    .context("projector catch-up failed")?;
  let posted = engine
    .poster()
    .repair(creator_id)
    .await
    .context("ledger repair failed")?;
  engine
    .projector()
    .catch_up()
    .await
    .context("projector catch-up failed")?;
  print(&json!({ "creator_id": creator_id, "posted": posted }))?;
  Ok(ExitCode::SUCCESS)
}

fn exit_code(ok: bool) -> ExitCode {
  if ok { ExitCode::SUCCESS } else { ExitCode::from(2) }
}
