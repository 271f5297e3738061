//! Projection rows and the dispatching fold that maintains them.
//!
//! A projection row is the folded state of one aggregate as of a watermark.
//! It is a disposable cache: replaying the aggregate's events from version 1
//! through the watermark reproduces it exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::{EventRecord, UndecodableEvent},
  ledger::{self, WalletState},
  membership::{self, MembershipState},
  stream::{StreamId, StreamType},
  subscription::{self, SubscriptionState},
};

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Folded state for any aggregate type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum AggregateState {
  Subscription(SubscriptionState),
  Wallet(WalletState),
  Membership(MembershipState),
}

impl AggregateState {
  /// Short status label stored in the row's denormalised `status` column.
  pub fn status_label(&self) -> &'static str {
    match self {
      Self::Subscription(s) => s.status.as_str(),
      Self::Wallet(w) if w.balance_cents < 0 => "overdrawn",
      Self::Wallet(_) => "open",
      Self::Membership(m) => m.status.as_str(),
    }
  }

  /// The creator this aggregate belongs to.
  pub fn creator_id(&self) -> Uuid {
    match self {
      Self::Subscription(s) => s.creator_id,
      Self::Wallet(w) => w.creator_id,
      Self::Membership(m) => m.creator_id,
    }
  }
}

/// One aggregate's projection, as of `watermark`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionRow {
  pub stream:    StreamId,
  /// Stream version of the last folded event.
  pub version:   u64,
  /// Global sequence of the last folded event.
  pub watermark: u64,
  pub state:     AggregateState,
}

impl ProjectionRow {
  pub fn subscription(&self) -> Option<&SubscriptionState> {
    match &self.state {
      AggregateState::Subscription(s) => Some(s),
      _ => None,
    }
  }

  pub fn wallet(&self) -> Option<&WalletState> {
    match &self.state {
      AggregateState::Wallet(w) => Some(w),
      _ => None,
    }
  }

  pub fn membership(&self) -> Option<&MembershipState> {
    match &self.state {
      AggregateState::Membership(m) => Some(m),
      _ => None,
    }
  }
}

// ─── Folding ─────────────────────────────────────────────────────────────────

/// Watermark check: an event at or below the row's watermark was already
/// folded and must be a no-op.
pub fn should_apply(row: Option<&ProjectionRow>, record: &EventRecord) -> bool {
  row.is_none_or(|r| record.sequence > r.watermark)
}

/// Fold one event onto a row, dispatching to the translator for the stream
/// type. Stream versions must be contiguous.
pub fn apply(
  row: Option<ProjectionRow>,
  record: &EventRecord,
) -> Result<ProjectionRow> {
  let expected = row.as_ref().map_or(1, |r| r.version + 1);
  if record.stream_version != expected {
    return Err(Error::OutOfOrder {
      stream: record.stream,
      expected,
      found: record.stream_version,
    });
  }

  let prior = row.map(|r| r.state);
  let state = match (record.stream.stream_type, prior) {
    (StreamType::Subscription, None) => {
      AggregateState::Subscription(subscription::apply(None, record)?)
    }
    (StreamType::Subscription, Some(AggregateState::Subscription(s))) => {
      AggregateState::Subscription(subscription::apply(Some(s), record)?)
    }
    (StreamType::Wallet, None) => {
      AggregateState::Wallet(ledger::apply(None, record)?)
    }
    (StreamType::Wallet, Some(AggregateState::Wallet(w))) => {
      AggregateState::Wallet(ledger::apply(Some(w), record)?)
    }
    (StreamType::Membership, None) => {
      AggregateState::Membership(membership::apply(None, record)?)
    }
    (StreamType::Membership, Some(AggregateState::Membership(m))) => {
      AggregateState::Membership(membership::apply(Some(m), record)?)
    }
    (_, Some(_)) => {
      return Err(Error::invalid_transition(record, "foreign projection"));
    }
  };

  Ok(ProjectionRow {
    stream: record.stream,
    version: record.stream_version,
    watermark: record.sequence,
    state,
  })
}

// ─── Replay ──────────────────────────────────────────────────────────────────

/// Where and why a fold stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
  pub sequence:       u64,
  pub stream_version: u64,
  pub event_type:     String,
  pub reason:         String,
}

impl Fault {
  pub fn new(record: &EventRecord, error: &Error) -> Self {
    Self {
      sequence:       record.sequence,
      stream_version: record.stream_version,
      event_type:     record.event_type().to_owned(),
      reason:         error.to_string(),
    }
  }

  /// A fault at a row that could not be decoded.
  pub fn undecodable(event: &UndecodableEvent) -> Self {
    Self {
      sequence:       event.sequence,
      stream_version: event.stream_version,
      event_type:     event.event_type.clone(),
      reason:         event.reason.clone(),
    }
  }

  pub fn detected(self, stream: StreamId, at: DateTime<Utc>) -> Anomaly {
    Anomaly {
      stream,
      sequence: self.sequence,
      stream_version: self.stream_version,
      event_type: self.event_type,
      reason: self.reason,
      detected_at: at,
    }
  }
}

/// A recorded fold failure. An aggregate with an unresolved anomaly is
/// faulted: live projection skips it until a rebuild succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
  pub stream:         StreamId,
  pub sequence:       u64,
  pub stream_version: u64,
  pub event_type:     String,
  pub reason:         String,
  pub detected_at:    DateTime<Utc>,
}

/// The outcome of folding a whole stream from version 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
  /// State as of the last successfully folded event.
  pub row:      Option<ProjectionRow>,
  pub replayed: u64,
  /// Set when the fold halted on a defect; `row` then holds the last good
  /// state.
  pub fault:    Option<Fault>,
}

/// Fold `events` (one stream, in version order) from scratch. Halts at the
/// first fold defect; other errors cannot occur in a pure fold.
pub fn replay<'a>(events: impl IntoIterator<Item = &'a EventRecord>) -> Replay {
  let mut row = None;
  let mut replayed = 0;
  for record in events {
    match apply(row.clone(), record) {
      Ok(next) => {
        row = Some(next);
        replayed += 1;
      }
      Err(e) => {
        return Replay { row, replayed, fault: Some(Fault::new(record, &e)) };
      }
    }
  }
  Replay { row, replayed, fault: None }
}
