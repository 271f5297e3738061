//! The projection engine: tails the global log and folds each event into its
//! aggregate's projection row.
//!
//! Progress is a single checkpoint (the last handled sequence) saved after
//! every event. Rows carry their own watermark, so replaying from an older
//! checkpoint is harmless.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use covenant_core::{
  event::{DomainEvent, LogEntry, UndecodableEvent},
  projection::Fault,
  store::{ApplyOutcome, EventStore, ProjectionStore},
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{error::Result, pause, posting::LedgerPoster};

/// Checkpoint name of the live projector.
pub const CHECKPOINT: &str = "projector";

/// Counts from one pass over the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
  pub applied:     u64,
  pub skipped:     u64,
  pub faulted:     u64,
  pub quarantined: u64,
  /// Ledger credits appended for payments in this batch.
  pub posted:      u64,
  /// Last sequence handled.
  pub checkpoint:  u64,
}

impl BatchReport {
  pub fn handled(&self) -> u64 {
    self.applied + self.skipped + self.faulted + self.quarantined
  }

  fn absorb(&mut self, other: BatchReport) {
    self.applied += other.applied;
    self.skipped += other.skipped;
    self.faulted += other.faulted;
    self.quarantined += other.quarantined;
    self.posted += other.posted;
    self.checkpoint = other.checkpoint;
  }
}

pub struct Projector<S> {
  store:      Arc<S>,
  poster:     LedgerPoster<S>,
  batch_size: usize,
}

impl<S: EventStore + ProjectionStore> Projector<S> {
  pub fn new(store: Arc<S>, poster: LedgerPoster<S>, batch_size: usize) -> Self {
    Self { store, poster, batch_size: batch_size.max(1) }
  }

  /// Fold the next batch after the checkpoint.
  ///
  /// A payment is credited only once its fold is applied. If posting fails
  /// the batch stops before advancing past that payment, so the next pass
  /// retries it. A row that no longer decodes quarantines its stream and
  /// is passed over.
  pub async fn run_once(&self) -> Result<BatchReport, S::Error> {
    let from = self.store.load_checkpoint(CHECKPOINT).await?;
    let entries = self.store.read_log(from, self.batch_size).await?;
    let mut report = BatchReport { checkpoint: from, ..BatchReport::default() };

    for entry in entries {
      let sequence = entry.sequence();
      let record = match entry {
        LogEntry::Event(record) => record,
        LogEntry::Undecodable(raw) => {
          self.quarantine_undecodable(raw).await?;
          report.faulted += 1;
          self.store.save_checkpoint(CHECKPOINT, sequence).await?;
          report.checkpoint = sequence;
          continue;
        }
      };
      let stream = record.stream;

      let folded = match self.store.apply_event(record.clone()).await? {
        ApplyOutcome::Applied(_) => {
          report.applied += 1;
          true
        }
        ApplyOutcome::Skipped { .. } => {
          report.skipped += 1;
          true
        }
        ApplyOutcome::Faulted(anomaly) => {
          warn!(
            stream = %stream,
            sequence,
            stream_version = anomaly.stream_version,
            reason = %anomaly.reason,
            "projection fault, aggregate quarantined"
          );
          report.faulted += 1;
          false
        }
        ApplyOutcome::Quarantined => {
          debug!(stream = %stream, sequence, "skipping quarantined aggregate");
          report.quarantined += 1;
          false
        }
      };

      if folded && matches!(record.event, DomainEvent::PaymentSucceeded(_)) {
        match self.poster.post_credit(&record).await {
          Ok(Some(p)) if p.is_accepted() => report.posted += 1,
          Ok(_) => {}
          Err(e) => {
            error!(sequence, error = %e, "ledger posting failed");
            return Err(e);
          }
        }
      }

      self.store.save_checkpoint(CHECKPOINT, sequence).await?;
      report.checkpoint = sequence;
    }

    Ok(report)
  }

  async fn quarantine_undecodable(
    &self,
    raw: UndecodableEvent,
  ) -> Result<(), S::Error> {
    let Some(stream) = raw.stream else {
      error!(
        sequence = raw.sequence,
        reason = %raw.reason,
        "undecodable event on an unreadable stream, passing over it"
      );
      return Ok(());
    };
    let anomaly = Fault::undecodable(&raw).detected(stream, Utc::now());
    warn!(
      stream = %stream,
      sequence = raw.sequence,
      event_type = %raw.event_type,
      reason = %raw.reason,
      "undecodable event, aggregate quarantined"
    );
    self.store.quarantine(anomaly).await?;
    Ok(())
  }

  /// Run batches until a pass finds nothing new. Credits appended while
  /// draining are folded before this returns.
  pub async fn catch_up(&self) -> Result<BatchReport, S::Error> {
    let mut total = BatchReport::default();
    loop {
      let batch = self.run_once().await?;
      if batch.handled() == 0 {
        total.checkpoint = batch.checkpoint;
        return Ok(total);
      }
      total.absorb(batch);
    }
  }

  /// Tail the log until `shutdown` turns `true`, sleeping `poll` between
  /// drains. Errors are logged and retried on the next poll.
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>, poll: Duration) {
    info!(batch_size = self.batch_size, "projector started");
    while !*shutdown.borrow() {
      match self.catch_up().await {
        Ok(r) if r.handled() > 0 => info!(
          applied = r.applied,
          skipped = r.skipped,
          faulted = r.faulted,
          quarantined = r.quarantined,
          posted = r.posted,
          checkpoint = r.checkpoint,
          "projector caught up"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "projector pass failed"),
      }
      if !pause(&mut shutdown, poll).await {
        break;
      }
    }
    info!("projector stopped");
  }
}
