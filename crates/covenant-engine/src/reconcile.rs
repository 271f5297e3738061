//! Reconciliation: rebuilding projections from the event log.
//!
//! Single-aggregate rebuilds run inside one store transaction. Bulk runs walk
//! aggregate ids in ascending order and checkpoint a [`JobCursor`] after each
//! one, so an interrupted or cancelled run resumes where it stopped.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use chrono::Utc;
use covenant_core::{
  projection::Anomaly,
  store::{
    EventStore, JobCursor, JobStatus, ProjectionStore, RebuildOutcome,
    WalletCorrection,
  },
  stream::{StreamId, StreamType},
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

const PAGE_SIZE: usize = 100;

/// Result of reconciling one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletReconciliation {
  pub creator_id:       Uuid,
  pub previous_balance: Option<i64>,
  pub balance_cents:    i64,
  /// Present when the cached balance changed.
  pub correction:       Option<WalletCorrection>,
  pub anomaly:          Option<Anomaly>,
}

/// Progress of a bulk rebuild over one stream type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
  pub job:         JobCursor,
  /// Aggregates that halted on a defect during this invocation.
  pub faulted:     Vec<Anomaly>,
  /// Wallet balances changed during this invocation.
  pub corrections: u64,
}

impl ReconcileReport {
  pub fn is_complete(&self) -> bool { self.job.status == JobStatus::Completed }
}

pub fn job_name(prefix: &str, stream_type: StreamType) -> String {
  format!("{prefix}:{stream_type}")
}

pub struct Reconciler<S> {
  store: Arc<S>,
}

impl<S: EventStore + ProjectionStore> Reconciler<S> {
  pub fn new(store: Arc<S>) -> Self { Self { store } }

  /// Replace one aggregate's row with a replay of its stream.
  pub async fn rebuild(&self, stream: StreamId) -> Result<RebuildOutcome, S::Error> {
    let outcome = self.store.rebuild_projection(stream).await?;
    match &outcome.anomaly {
      Some(a) => warn!(
        stream = %stream,
        stream_version = a.stream_version,
        reason = %a.reason,
        replayed = outcome.replayed,
        "rebuild halted at defect"
      ),
      None => info!(stream = %stream, replayed = outcome.replayed, "rebuilt projection"),
    }
    Ok(outcome)
  }

  /// Rebuild a wallet from its ledger events and record an audit entry if the
  /// cached balance was wrong.
  pub async fn reconcile_wallet(
    &self,
    creator_id: Uuid,
  ) -> Result<WalletReconciliation, S::Error> {
    let outcome = self.rebuild(StreamId::wallet(creator_id)).await?;

    let previous = outcome.previous.as_ref().and_then(|r| r.wallet());
    let current = outcome.current.as_ref().and_then(|r| r.wallet());
    let previous_balance = previous.map(|w| w.balance_cents);
    let balance_cents = current.map_or(0, |w| w.balance_cents);

    let changed = match (previous, current) {
      (None, None) => false,
      (Some(p), Some(c)) => p.balance_cents != c.balance_cents,
      _ => true,
    };

    let correction = if changed {
      let correction = WalletCorrection {
        correction_id: Uuid::new_v4(),
        creator_id,
        previous_balance,
        corrected_balance: balance_cents,
        entry_count: current.map_or(0, |w| w.entry_count),
        watermark: outcome.current.as_ref().map_or(0, |r| r.watermark),
        corrected_at: Utc::now(),
        reason: match previous_balance {
          Some(_) => "cached balance diverged from ledger".into(),
          None => "wallet projection was missing".into(),
        },
      };
      self.store.record_correction(correction.clone()).await?;
      info!(
        creator_id = %creator_id,
        previous_balance = ?previous_balance,
        corrected_balance = balance_cents,
        "wallet balance corrected"
      );
      Some(correction)
    } else {
      None
    };

    Ok(WalletReconciliation {
      creator_id,
      previous_balance,
      balance_cents,
      correction,
      anomaly: outcome.anomaly,
    })
  }

  /// Rebuild every aggregate of `stream_type`, resuming the named job if it
  /// was left running. Faulted aggregates are reported and skipped. Checks
  /// `cancel` before each aggregate; a cancelled job resumes on the next
  /// call.
  pub async fn reconcile_all(
    &self,
    stream_type: StreamType,
    job_name: String,
    cancel: &AtomicBool,
  ) -> Result<ReconcileReport, S::Error> {
    let mut job = match self.store.load_job(job_name.clone()).await? {
      Some(job) if job.status != JobStatus::Completed => {
        info!(job = %job_name, last_id = ?job.last_id, "resuming reconcile job");
        JobCursor { status: JobStatus::Running, ..job }
      }
      _ => JobCursor::start(job_name.clone(), stream_type, Utc::now()),
    };
    self.store.save_job(job.clone()).await?;

    let mut faulted = Vec::new();
    let mut corrections = 0;

    loop {
      let ids = self
        .store
        .list_streams(stream_type, job.last_id, PAGE_SIZE)
        .await?;
      if ids.is_empty() {
        job.status = JobStatus::Completed;
        break;
      }

      for id in ids {
        if cancel.load(Ordering::Relaxed) {
          job.status = JobStatus::Cancelled;
          job.updated_at = Utc::now();
          self.store.save_job(job.clone()).await?;
          warn!(job = %job.job_name, last_id = ?job.last_id, "reconcile job cancelled");
          return Ok(ReconcileReport { job, faulted, corrections });
        }

        let anomaly = if stream_type == StreamType::Wallet {
          let r = self.reconcile_wallet(id).await?;
          if r.correction.is_some() {
            corrections += 1;
          }
          r.anomaly
        } else {
          self.rebuild(StreamId::new(stream_type, id)).await?.anomaly
        };

        match anomaly {
          Some(a) => {
            job.failed += 1;
            faulted.push(a);
          }
          None => job.rebuilt += 1,
        }
        job.last_id = Some(id);
        job.updated_at = Utc::now();
        self.store.save_job(job.clone()).await?;
      }
    }

    job.updated_at = Utc::now();
    self.store.save_job(job.clone()).await?;
    info!(
      job = %job.job_name,
      rebuilt = job.rebuilt,
      failed = job.failed,
      corrections,
      "reconcile job completed"
    );
    Ok(ReconcileReport { job, faulted, corrections })
  }

  /// `reconcile_all` over every stream type, stopping early if cancelled.
  pub async fn rebuild_all(
    &self,
    cancel: &AtomicBool,
  ) -> Result<Vec<ReconcileReport>, S::Error> {
    let mut reports = Vec::new();
    for stream_type in StreamType::ALL {
      let report = self
        .reconcile_all(stream_type, job_name("rebuild", stream_type), cancel)
        .await?;
      let done = report.is_complete();
      reports.push(report);
      if !done {
        break;
      }
    }
    Ok(reports)
  }

  pub async fn reconcile_all_wallets(
    &self,
    cancel: &AtomicBool,
  ) -> Result<ReconcileReport, S::Error> {
    self
      .reconcile_all(
        StreamType::Wallet,
        job_name("reconcile", StreamType::Wallet),
        cancel,
      )
      .await
  }
}
