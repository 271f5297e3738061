//! Storage traits implemented by backends (e.g. `covenant-store-sqlite`).
//!
//! The engine and the HTTP layer depend on these abstractions only. Every
//! write that must be atomic is a single trait method, so a backend can wrap
//! it in one transaction.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error,
  delivery::{AppendRequest, DeliveryKey, DeliveryRecord, Processing},
  event::{Appended, EventRecord, LogEntry, NewEvent},
  invariant::{EvaluationScope, ProjectionSnapshot},
  ledger::LedgerEntry,
  projection::{Anomaly, ProjectionRow},
  stream::{StreamId, StreamType},
};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Backend errors expose the domain error they carry, if any, so callers can
/// tell a retryable conflict from an infrastructure failure.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  fn core(&self) -> Option<&Error>;

  fn is_conflict(&self) -> bool { self.core().is_some_and(Error::is_conflict) }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Result of [`ProjectionStore::apply_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
  /// The event was folded and the row written.
  Applied(ProjectionRow),
  /// The row's watermark already covers this event.
  Skipped { watermark: u64 },
  /// The event could not be folded. The row keeps its last good state and
  /// the anomaly is recorded.
  Faulted(Anomaly),
  /// The aggregate has an unresolved anomaly; nothing is applied until it is
  /// rebuilt.
  Quarantined,
}

/// Result of rebuilding one aggregate from its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
  pub stream:   StreamId,
  pub previous: Option<ProjectionRow>,
  pub current:  Option<ProjectionRow>,
  pub replayed: u64,
  /// Set when replay halted at a defect.
  pub anomaly:  Option<Anomaly>,
}

impl RebuildOutcome {
  pub fn is_faulted(&self) -> bool { self.anomaly.is_some() }
}

/// Audit record written whenever a reconciliation changes a wallet balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCorrection {
  pub correction_id:     Uuid,
  pub creator_id:        Uuid,
  /// `None` when no wallet row existed before the rebuild.
  pub previous_balance:  Option<i64>,
  pub corrected_balance: i64,
  pub entry_count:       u64,
  pub watermark:         u64,
  pub corrected_at:      DateTime<Utc>,
  pub reason:            String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Running,
  Completed,
  Cancelled,
}

impl JobStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
    }
  }
}

/// Persistent progress of a bulk rebuild; lets an interrupted run resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCursor {
  pub job_name:    String,
  pub stream_type: StreamType,
  /// Last aggregate id whose rebuild completed, in ascending id order.
  pub last_id:     Option<Uuid>,
  pub rebuilt:     u64,
  pub failed:      u64,
  pub status:      JobStatus,
  pub started_at:  DateTime<Utc>,
  pub updated_at:  DateTime<Utc>,
}

impl JobCursor {
  pub fn start(
    job_name: impl Into<String>,
    stream_type: StreamType,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      job_name: job_name.into(),
      stream_type,
      last_id: None,
      rebuilt: 0,
      failed: 0,
      status: JobStatus::Running,
      started_at: now,
      updated_at: now,
    }
  }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Shared base for the store traits.
pub trait Store: Send + Sync {
  type Error: StoreError;

  /// Cheap round-trip used by readiness checks.
  fn ping(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// The append-only event log and the delivery ledger.
pub trait EventStore: Store {
  /// Append `events` to `stream` if its current version equals
  /// `expected_version` (0 for a new stream). All or nothing; a mismatch
  /// fails with [`Error::ConcurrencyConflict`].
  fn append(
    &self,
    stream: StreamId,
    expected_version: u64,
    events: Vec<NewEvent>,
  ) -> impl Future<Output = Result<Appended, Self::Error>> + Send + '_;

  /// Events of one stream with `stream_version >= from_version`, ascending.
  fn read_stream(
    &self,
    stream: StreamId,
    from_version: u64,
  ) -> impl Future<Output = Result<Vec<EventRecord>, Self::Error>> + Send + '_;

  /// Events with `sequence > after`, ascending, at most `limit`.
  fn read_all(
    &self,
    after: u64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<EventRecord>, Self::Error>> + Send + '_;

  /// Like [`EventStore::read_all`], but a row that fails to decode is
  /// returned as [`LogEntry::Undecodable`] instead of failing the batch.
  fn read_log(
    &self,
    after: u64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<LogEntry>, Self::Error>> + Send + '_;

  fn read_event(
    &self,
    sequence: u64,
  ) -> impl Future<Output = Result<Option<EventRecord>, Self::Error>> + Send + '_;

  /// Current version of `stream`; 0 if it has no events.
  fn stream_version(
    &self,
    stream: StreamId,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Highest assigned sequence; 0 for an empty log.
  fn head_sequence(
    &self,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Ids of streams of `stream_type` greater than `after`, ascending.
  fn list_streams(
    &self,
    stream_type: StreamType,
    after: Option<Uuid>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<Uuid>, Self::Error>> + Send + '_;

  /// Atomically check the delivery key, append the request's events and
  /// record the delivery. A key already present yields
  /// [`Processing::AlreadyProcessed`] with the stored record and appends
  /// nothing.
  fn begin_processing(
    &self,
    key: DeliveryKey,
    request: AppendRequest,
  ) -> impl Future<Output = Result<Processing, Self::Error>> + Send + '_;

  fn find_delivery(
    &self,
    key: DeliveryKey,
  ) -> impl Future<Output = Result<Option<DeliveryRecord>, Self::Error>> + Send + '_;
}

/// Projection rows, the ledger view and reconciliation bookkeeping.
pub trait ProjectionStore: Store {
  /// Fold one event into its aggregate's row, with side tables, in one
  /// transaction.
  fn apply_event(
    &self,
    record: EventRecord,
  ) -> impl Future<Output = Result<ApplyOutcome, Self::Error>> + Send + '_;

  /// Replace an aggregate's row with a fresh replay of its stream, read and
  /// written under one transaction.
  fn rebuild_projection(
    &self,
    stream: StreamId,
  ) -> impl Future<Output = Result<RebuildOutcome, Self::Error>> + Send + '_;

  fn get_projection(
    &self,
    stream: StreamId,
  ) -> impl Future<Output = Result<Option<ProjectionRow>, Self::Error>> + Send + '_;

  fn load_checkpoint(
    &self,
    name: &'static str,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  fn save_checkpoint(
    &self,
    name: &'static str,
    sequence: u64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Everything the invariant evaluator reads, from one read transaction.
  fn snapshot(
    &self,
    scope: EvaluationScope,
  ) -> impl Future<Output = Result<ProjectionSnapshot, Self::Error>> + Send + '_;

  /// Ledger entries of one creator's wallet, ascending by sequence.
  fn ledger_entries(
    &self,
    creator_id: Uuid,
  ) -> impl Future<Output = Result<Vec<LedgerEntry>, Self::Error>> + Send + '_;

  fn record_correction(
    &self,
    correction: WalletCorrection,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn corrections(
    &self,
    creator_id: Uuid,
  ) -> impl Future<Output = Result<Vec<WalletCorrection>, Self::Error>> + Send + '_;

  /// Record `anomaly` so the aggregate is skipped until it is rebuilt.
  fn quarantine(
    &self,
    anomaly: Anomaly,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn open_anomalies(
    &self,
  ) -> impl Future<Output = Result<Vec<Anomaly>, Self::Error>> + Send + '_;

  fn load_job(
    &self,
    job_name: String,
  ) -> impl Future<Output = Result<Option<JobCursor>, Self::Error>> + Send + '_;

  fn save_job(
    &self,
    cursor: JobCursor,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
