//! Error types for `covenant-core`.
//!
//! The variants mirror the engine's error taxonomy: append-path failures
//! (`ConcurrencyConflict`, `Validation`) are surfaced synchronously, while
//! `InvalidTransition` and `OutOfOrder` are projection-path defects that are
//! recorded per aggregate.

use thiserror::Error;

use crate::{event::EventRecord, stream::StreamId};

#[derive(Debug, Error)]
pub enum Error {
  /// The stream's current version did not match the caller's expectation.
  /// Retryable after re-reading the stream.
  #[error(
    "concurrency conflict on {stream}: expected version {expected}, found \
     {actual}"
  )]
  ConcurrencyConflict {
    stream:   StreamId,
    expected: u64,
    actual:   u64,
  },

  /// An event was malformed. Fatal to the triggering request.
  #[error("validation error: {0}")]
  Validation(String),

  /// A fold met an event that is not valid for the aggregate's state.
  #[error(
    "invalid transition on {stream} at version {version}: {event_type} is \
     not valid in state {state}"
  )]
  InvalidTransition {
    stream:     StreamId,
    version:    u64,
    event_type: &'static str,
    state:      String,
  },

  /// A fold met an event whose stream version does not follow the current
  /// projection version.
  #[error(
    "out-of-order event on {stream}: expected version {expected}, found \
     {found}"
  )]
  OutOfOrder {
    stream:   StreamId,
    expected: u64,
    found:    u64,
  },

  #[error("unknown event type: {0:?}")]
  UnknownEventType(String),

  #[error("unsupported schema version {version} for event type {event_type}")]
  UnsupportedSchemaVersion { event_type: String, version: u16 },

  #[error("unknown stream type: {0:?}")]
  UnknownStreamType(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Build an [`Error::InvalidTransition`] for `record` folded onto an
  /// aggregate described by `state`.
  pub fn invalid_transition(record: &EventRecord, state: impl ToString) -> Self {
    Self::InvalidTransition {
      stream:     record.stream,
      version:    record.stream_version,
      event_type: record.event_type(),
      state:      state.to_string(),
    }
  }

  /// `true` for the errors a caller may resolve by re-reading and retrying.
  pub fn is_conflict(&self) -> bool {
    matches!(self, Self::ConcurrencyConflict { .. })
  }

  /// `true` when stored bytes could not be read back into an event.
  pub fn is_decode_failure(&self) -> bool {
    matches!(
      self,
      Self::UnknownEventType(_)
        | Self::UnsupportedSchemaVersion { .. }
        | Self::UnknownStreamType(_)
        | Self::Serialization(_)
    )
  }

  /// `true` for fold failures that mark an aggregate as faulted.
  pub fn is_fold_defect(&self) -> bool {
    matches!(self, Self::InvalidTransition { .. } | Self::OutOfOrder { .. })
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
