//! Webhook ingestion through the idempotency guard.
//!
//! A delivery is validated, checked against the aggregate's current state,
//! and appended together with its idempotency record. The receipt is built
//! from the stored record alone, so every redelivery of a key gets the same
//! bytes back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use covenant_core::{
  delivery::{AppendRequest, DeliveryKey, DeliveryRecord},
  event::{DomainEvent, NewEvent},
  store::EventStore,
  stream::{StreamId, StreamType},
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
  command::check_transitions,
  error::{EngineError, Result},
  retry::{RetryPolicy, retry_on_conflict},
};

/// Hex SHA-256 of a request body.
pub fn fingerprint(body: &[u8]) -> String { hex::encode(Sha256::digest(body)) }

/// A normalised provider notification.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub provider:    String,
  pub delivery_id: String,
  pub stream:      StreamId,
  pub event:       DomainEvent,
  pub fingerprint: Option<String>,
}

/// What the caller sees for a delivery, first time or any time after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
  pub delivery_key:   DeliveryKey,
  pub stream_type:    StreamType,
  pub stream_id:      Uuid,
  pub stream_version: u64,
  pub sequences:      Vec<u64>,
  pub processed_at:   DateTime<Utc>,
}

impl From<&DeliveryRecord> for Receipt {
  fn from(r: &DeliveryRecord) -> Self {
    Self {
      delivery_key:   r.delivery_key.clone(),
      stream_type:    r.stream.stream_type,
      stream_id:      r.stream.id,
      stream_version: r.stream_version,
      sequences:      r.sequences.clone(),
      processed_at:   r.processed_at,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
  pub receipt:   Receipt,
  /// `true` when the key had already been processed.
  pub duplicate: bool,
}

pub struct WebhookIngestor<S> {
  store: Arc<S>,
  retry: RetryPolicy,
}

impl<S: EventStore> WebhookIngestor<S> {
  pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self { Self { store, retry } }

  pub async fn ingest(&self, delivery: Delivery) -> Result<Ingested, S::Error> {
    let key = DeliveryKey::new(&delivery.provider, &delivery.delivery_id)
      .map_err(EngineError::Core)?;
    delivery
      .event
      .validate(&delivery.stream)
      .map_err(EngineError::Core)?;

    if let Some(record) = self.store.find_delivery(key.clone()).await? {
      return duplicate(&key, record, delivery.fingerprint.as_deref());
    }

    let processing = retry_on_conflict(&self.retry, "webhook_append", || {
      let store = self.store.clone();
      let key = key.clone();
      let delivery = delivery.clone();
      async move {
        let history = store.read_stream(delivery.stream, 1).await?;
        let version = history.last().map_or(0, |e| e.stream_version);
        check_transitions(&history, delivery.stream, [&delivery.event])
          .map_err(EngineError::Core)?;

        let request = AppendRequest {
          stream:           delivery.stream,
          expected_version: version,
          events:           vec![NewEvent::new(delivery.event)],
          fingerprint:      delivery.fingerprint,
        };
        Ok::<_, EngineError<S::Error>>(store.begin_processing(key, request).await?)
      }
    })
    .await?;

    if !processing.is_accepted() {
      return duplicate(
        &key,
        processing.record().clone(),
        delivery.fingerprint.as_deref(),
      );
    }

    let receipt = Receipt::from(processing.record());
    info!(
      delivery_key = %key,
      stream = %delivery.stream,
      stream_version = receipt.stream_version,
      "delivery accepted"
    );
    Ok(Ingested { receipt, duplicate: false })
  }
}

fn duplicate<E: covenant_core::store::StoreError>(
  key: &DeliveryKey,
  record: DeliveryRecord,
  fingerprint: Option<&str>,
) -> Result<Ingested, E> {
  if let (Some(stored), Some(given)) = (record.fingerprint.as_deref(), fingerprint)
    && stored != given
  {
    return Err(EngineError::FingerprintMismatch { key: key.clone() });
  }
  debug!(delivery_key = %key, "duplicate delivery");
  Ok(Ingested { receipt: Receipt::from(&record), duplicate: true })
}
