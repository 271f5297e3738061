//! Idempotency records: the mapping from an external delivery key to the
//! outcome of processing it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  event::{Appended, NewEvent},
  stream::StreamId,
};

/// An external delivery identifier, e.g. `stripe:evt_1N2x...`.
///
/// Keys are namespaced by provider so two providers reusing the same event id
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryKey(String);

impl DeliveryKey {
  pub fn new(provider: &str, delivery_id: &str) -> Result<Self> {
    let provider = provider.trim();
    let delivery_id = delivery_id.trim();
    if provider.is_empty() || delivery_id.is_empty() {
      return Err(Error::Validation(
        "delivery key needs a provider and a delivery id".into(),
      ));
    }
    if provider.contains(':') {
      return Err(Error::Validation(format!(
        "provider {provider:?} must not contain ':'"
      )));
    }
    Ok(Self(format!("{provider}:{delivery_id}")))
  }

  /// Reconstruct a key read back from storage.
  pub fn from_stored(raw: String) -> Self { Self(raw) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for DeliveryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// What a delivery produced. Returned verbatim to every duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
  pub delivery_key:   DeliveryKey,
  pub stream:         StreamId,
  pub stream_version: u64,
  pub sequences:      Vec<u64>,
  /// SHA-256 of the original request body, when the caller supplied one.
  pub fingerprint:    Option<String>,
  pub processed_at:   DateTime<Utc>,
}

/// The append performed under a delivery key.
#[derive(Debug, Clone)]
pub struct AppendRequest {
  pub stream:           StreamId,
  pub expected_version: u64,
  pub events:           Vec<NewEvent>,
  pub fingerprint:      Option<String>,
}

/// Outcome of [`crate::store::EventStore::begin_processing`].
#[derive(Debug, Clone)]
pub enum Processing {
  /// This caller won the key; its events were appended in the same unit.
  Accepted {
    record:   DeliveryRecord,
    appended: Appended,
  },
  /// The key was processed before; nothing was appended.
  AlreadyProcessed(DeliveryRecord),
}

impl Processing {
  pub fn record(&self) -> &DeliveryRecord {
    match self {
      Self::Accepted { record, .. } => record,
      Self::AlreadyProcessed(record) => record,
    }
  }

  pub fn is_accepted(&self) -> bool { matches!(self, Self::Accepted { .. }) }
}
