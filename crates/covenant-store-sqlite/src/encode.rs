//! Encoding and decoding helpers between domain types and the plain-text or
//! integer representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, UUIDs are hyphenated lowercase strings,
//! and folded state is compact JSON. Sequences and versions are `u64` in the
//! domain and `INTEGER` (i64) in SQLite.

use chrono::{DateTime, Utc};
use covenant_core::{
  delivery::{DeliveryKey, DeliveryRecord},
  event::{DomainEvent, EventRecord, LogEntry, UndecodableEvent},
  invariant::PaymentRecord,
  ledger::{EntryKind, LedgerEntry},
  projection::{AggregateState, Anomaly, ProjectionRow},
  store::{JobCursor, JobStatus, WalletCorrection},
  stream::{StreamId, StreamType},
};
use rusqlite::Row;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_u64(v: u64) -> Result<i64> {
  i64::try_from(v).map_err(|_| Error::Corrupt(format!("{v} exceeds i64")))
}

pub fn decode_u64(v: i64) -> Result<u64> {
  u64::try_from(v).map_err(|_| Error::Corrupt(format!("negative counter {v}")))
}

pub fn decode_stream(stream_type: &str, stream_id: &str) -> Result<StreamId> {
  let stream_type: StreamType = stream_type.parse()?;
  Ok(StreamId::new(stream_type, decode_uuid(stream_id)?))
}

pub fn encode_entry_kind(kind: EntryKind) -> &'static str { kind.as_str() }

pub fn decode_entry_kind(s: &str) -> Result<EntryKind> {
  match s {
    "credit" => Ok(EntryKind::Credit),
    "debit" => Ok(EntryKind::Debit),
    other => Err(Error::Corrupt(format!("unknown entry kind {other:?}"))),
  }
}

pub fn decode_job_status(s: &str) -> Result<JobStatus> {
  match s {
    "running" => Ok(JobStatus::Running),
    "completed" => Ok(JobStatus::Completed),
    "cancelled" => Ok(JobStatus::Cancelled),
    other => Err(Error::Corrupt(format!("unknown job status {other:?}"))),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw column values of an `events` row.
pub struct RawEvent {
  pub sequence:       i64,
  pub event_id:       String,
  pub stream_type:    String,
  pub stream_id:      String,
  pub stream_version: i64,
  pub event_type:     String,
  pub schema_version: i64,
  pub payload_json:   String,
  pub occurred_at:    String,
  pub causation_id:   String,
  pub correlation_id: String,
}

impl RawEvent {
  pub const COLUMNS: &'static str = "sequence, event_id, stream_type, \
                                     stream_id, stream_version, event_type, \
                                     schema_version, payload_json, \
                                     occurred_at, causation_id, correlation_id";

  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sequence:       r.get(0)?,
      event_id:       r.get(1)?,
      stream_type:    r.get(2)?,
      stream_id:      r.get(3)?,
      stream_version: r.get(4)?,
      event_type:     r.get(5)?,
      schema_version: r.get(6)?,
      payload_json:   r.get(7)?,
      occurred_at:    r.get(8)?,
      causation_id:   r.get(9)?,
      correlation_id: r.get(10)?,
    })
  }

  pub fn decode(&self) -> Result<EventRecord> {
    let schema_version = u16::try_from(self.schema_version).map_err(|_| {
      Error::Corrupt(format!("schema version {}", self.schema_version))
    })?;
    let payload: serde_json::Value = serde_json::from_str(&self.payload_json)?;
    let event = DomainEvent::from_parts(&self.event_type, schema_version, payload)?;

    Ok(EventRecord {
      sequence: decode_u64(self.sequence)?,
      event_id: decode_uuid(&self.event_id)?,
      stream: decode_stream(&self.stream_type, &self.stream_id)?,
      stream_version: decode_u64(self.stream_version)?,
      schema_version,
      event,
      occurred_at: decode_dt(&self.occurred_at)?,
      causation_id: decode_uuid(&self.causation_id)?,
      correlation_id: decode_uuid(&self.correlation_id)?,
    })
  }

  /// What is still known about a row that failed to decode with `error`.
  pub fn undecodable(&self, error: &Error) -> UndecodableEvent {
    UndecodableEvent {
      sequence:       u64::try_from(self.sequence).unwrap_or_default(),
      stream:         decode_stream(&self.stream_type, &self.stream_id).ok(),
      stream_version: u64::try_from(self.stream_version).unwrap_or_default(),
      event_type:     self.event_type.clone(),
      reason:         error.to_string(),
    }
  }

  /// Decode for the global log, keeping undecodable rows as entries.
  pub fn into_entry(self) -> LogEntry {
    match self.decode() {
      Ok(record) => LogEntry::Event(record),
      Err(e) => LogEntry::Undecodable(self.undecodable(&e)),
    }
  }
}

/// Raw column values of a `projections` row.
pub struct RawProjection {
  pub stream_type: String,
  pub stream_id:   String,
  pub version:     i64,
  pub watermark:   i64,
  pub state_json:  String,
}

impl RawProjection {
  pub const COLUMNS: &'static str =
    "stream_type, stream_id, version, watermark, state_json";

  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      stream_type: r.get(0)?,
      stream_id:   r.get(1)?,
      version:     r.get(2)?,
      watermark:   r.get(3)?,
      state_json:  r.get(4)?,
    })
  }

  pub fn into_row(self) -> Result<ProjectionRow> {
    let state: AggregateState = serde_json::from_str(&self.state_json)?;
    Ok(ProjectionRow {
      stream: decode_stream(&self.stream_type, &self.stream_id)?,
      version: decode_u64(self.version)?,
      watermark: decode_u64(self.watermark)?,
      state,
    })
  }
}

pub struct RawDelivery {
  pub delivery_key:   String,
  pub stream_type:    String,
  pub stream_id:      String,
  pub stream_version: i64,
  pub sequences:      String,
  pub fingerprint:    Option<String>,
  pub processed_at:   String,
}

impl RawDelivery {
  pub const COLUMNS: &'static str = "delivery_key, stream_type, stream_id, \
                                     stream_version, sequences, fingerprint, \
                                     processed_at";

  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      delivery_key:   r.get(0)?,
      stream_type:    r.get(1)?,
      stream_id:      r.get(2)?,
      stream_version: r.get(3)?,
      sequences:      r.get(4)?,
      fingerprint:    r.get(5)?,
      processed_at:   r.get(6)?,
    })
  }

  pub fn into_record(self) -> Result<DeliveryRecord> {
    Ok(DeliveryRecord {
      delivery_key:   DeliveryKey::from_stored(self.delivery_key),
      stream:         decode_stream(&self.stream_type, &self.stream_id)?,
      stream_version: decode_u64(self.stream_version)?,
      sequences:      serde_json::from_str(&self.sequences)?,
      fingerprint:    self.fingerprint,
      processed_at:   decode_dt(&self.processed_at)?,
    })
  }
}

pub struct RawAnomaly {
  pub stream_type:    String,
  pub stream_id:      String,
  pub sequence:       i64,
  pub stream_version: i64,
  pub event_type:     String,
  pub reason:         String,
  pub detected_at:    String,
}

impl RawAnomaly {
  pub const COLUMNS: &'static str = "stream_type, stream_id, sequence, \
                                     stream_version, event_type, reason, \
                                     detected_at";

  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      stream_type:    r.get(0)?,
      stream_id:      r.get(1)?,
      sequence:       r.get(2)?,
      stream_version: r.get(3)?,
      event_type:     r.get(4)?,
      reason:         r.get(5)?,
      detected_at:    r.get(6)?,
    })
  }

  pub fn into_anomaly(self) -> Result<Anomaly> {
    Ok(Anomaly {
      stream:         decode_stream(&self.stream_type, &self.stream_id)?,
      sequence:       decode_u64(self.sequence)?,
      stream_version: decode_u64(self.stream_version)?,
      event_type:     self.event_type,
      reason:         self.reason,
      detected_at:    decode_dt(&self.detected_at)?,
    })
  }
}

pub struct RawLedgerEntry {
  pub sequence:         i64,
  pub creator_id:       String,
  pub kind:             String,
  pub amount_cents:     i64,
  pub delta_cents:      i64,
  pub payment_sequence: Option<i64>,
  pub reference:        String,
  pub recorded_at:      String,
}

impl RawLedgerEntry {
  pub const COLUMNS: &'static str = "sequence, creator_id, kind, amount_cents, \
                                     delta_cents, payment_sequence, \
                                     reference, recorded_at";

  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sequence:         r.get(0)?,
      creator_id:       r.get(1)?,
      kind:             r.get(2)?,
      amount_cents:     r.get(3)?,
      delta_cents:      r.get(4)?,
      payment_sequence: r.get(5)?,
      reference:        r.get(6)?,
      recorded_at:      r.get(7)?,
    })
  }

  pub fn into_entry(self) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
      creator_id:       decode_uuid(&self.creator_id)?,
      sequence:         decode_u64(self.sequence)?,
      kind:             decode_entry_kind(&self.kind)?,
      amount_cents:     self.amount_cents,
      delta_cents:      self.delta_cents,
      payment_sequence: self.payment_sequence.map(decode_u64).transpose()?,
      reference:        self.reference,
      recorded_at:      decode_dt(&self.recorded_at)?,
    })
  }
}

/// A `payments` row left-joined with the ledger entry that posts it.
pub struct RawPayment {
  pub sequence:        i64,
  pub subscription_id: String,
  pub creator_id:      String,
  pub payment_ref:     String,
  pub amount_cents:    i64,
  pub occurred_at:     String,
  pub ledger_sequence: Option<i64>,
}

impl RawPayment {
  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sequence:        r.get(0)?,
      subscription_id: r.get(1)?,
      creator_id:      r.get(2)?,
      payment_ref:     r.get(3)?,
      amount_cents:    r.get(4)?,
      occurred_at:     r.get(5)?,
      ledger_sequence: r.get(6)?,
    })
  }

  pub fn into_payment(self) -> Result<PaymentRecord> {
    Ok(PaymentRecord {
      sequence:        decode_u64(self.sequence)?,
      subscription_id: decode_uuid(&self.subscription_id)?,
      creator_id:      decode_uuid(&self.creator_id)?,
      payment_ref:     self.payment_ref,
      amount_cents:    self.amount_cents,
      occurred_at:     decode_dt(&self.occurred_at)?,
      ledger_sequence: self.ledger_sequence.map(decode_u64).transpose()?,
    })
  }
}

pub struct RawCorrection {
  pub correction_id:     String,
  pub creator_id:        String,
  pub previous_balance:  Option<i64>,
  pub corrected_balance: i64,
  pub entry_count:       i64,
  pub watermark:         i64,
  pub corrected_at:      String,
  pub reason:            String,
}

impl RawCorrection {
  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      correction_id:     r.get(0)?,
      creator_id:        r.get(1)?,
      previous_balance:  r.get(2)?,
      corrected_balance: r.get(3)?,
      entry_count:       r.get(4)?,
      watermark:         r.get(5)?,
      corrected_at:      r.get(6)?,
      reason:            r.get(7)?,
    })
  }

  pub fn into_correction(self) -> Result<WalletCorrection> {
    Ok(WalletCorrection {
      correction_id:     decode_uuid(&self.correction_id)?,
      creator_id:        decode_uuid(&self.creator_id)?,
      previous_balance:  self.previous_balance,
      corrected_balance: self.corrected_balance,
      entry_count:       decode_u64(self.entry_count)?,
      watermark:         decode_u64(self.watermark)?,
      corrected_at:      decode_dt(&self.corrected_at)?,
      reason:            self.reason,
    })
  }
}

pub struct RawJob {
  pub job_name:    String,
  pub stream_type: String,
  pub last_id:     Option<String>,
  pub rebuilt:     i64,
  pub failed:      i64,
  pub status:      String,
  pub started_at:  String,
  pub updated_at:  String,
}

impl RawJob {
  pub fn into_cursor(self) -> Result<JobCursor> {
    Ok(JobCursor {
      job_name:    self.job_name,
      stream_type: self.stream_type.parse()?,
      last_id:     self.last_id.as_deref().map(decode_uuid).transpose()?,
      rebuilt:     decode_u64(self.rebuilt)?,
      failed:      decode_u64(self.failed)?,
      status:      decode_job_status(&self.status)?,
      started_at:  decode_dt(&self.started_at)?,
      updated_at:  decode_dt(&self.updated_at)?,
    })
  }
}
