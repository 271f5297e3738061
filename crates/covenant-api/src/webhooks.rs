//! `POST /webhooks/{provider}`: payment provider notifications.
//!
//! Body: `{"delivery_id": "...", "type": "<event type>", "subscription_id" |
//! "creator_id": "<uuid>", ...payload fields}`. The delivery key is
//! `<provider>:<delivery_id>`. Accepted and duplicate deliveries both answer
//! `202` with the stored receipt.

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use bytes::Bytes;
use covenant_core::{
  event::{CURRENT_SCHEMA_VERSION, DomainEvent},
  store::{EventStore, ProjectionStore},
  stream::StreamId,
};
use covenant_engine::{
  Engine,
  ingest::{Delivery, fingerprint},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;

/// Event types a provider may report against a subscription.
const SUBSCRIPTION_TYPES: [&str; 5] = [
  "payment_succeeded",
  "payment_failed",
  "payment_method_attached",
  "payment_method_detached",
  "cancellation_requested",
];

#[derive(Debug, Deserialize)]
struct Envelope {
  delivery_id:     String,
  #[serde(rename = "type")]
  event_type:      String,
  subscription_id: Option<Uuid>,
  creator_id:      Option<Uuid>,
  #[serde(flatten)]
  fields:          Map<String, Value>,
}

/// Map a provider envelope onto its stream and domain event.
fn translate(provider: String, body: &[u8]) -> Result<Delivery, ApiError> {
  let env: Envelope = serde_json::from_slice(body)
    .map_err(|e| ApiError::Validation(format!("malformed webhook body: {e}")))?;
  let mut payload = env.fields;

  let stream = if SUBSCRIPTION_TYPES.contains(&env.event_type.as_str()) {
    let id = env.subscription_id.ok_or_else(|| {
      ApiError::Validation(format!("{} requires subscription_id", env.event_type))
    })?;
    if let Some(creator_id) = env.creator_id {
      payload.insert("creator_id".into(), Value::String(creator_id.to_string()));
    }
    StreamId::subscription(id)
  } else if env.event_type == "payout_issued" {
    let creator_id = env.creator_id.ok_or_else(|| {
      ApiError::Validation("payout_issued requires creator_id".into())
    })?;
    StreamId::wallet(creator_id)
  } else {
    return Err(ApiError::Validation(format!(
      "unsupported webhook type {:?}",
      env.event_type
    )));
  };

  let event = DomainEvent::from_parts(
    &env.event_type,
    CURRENT_SCHEMA_VERSION,
    Value::Object(payload),
  )
  .map_err(|e| ApiError::Validation(e.to_string()))?;

  Ok(Delivery {
    provider,
    delivery_id: env.delivery_id,
    stream,
    event,
    fingerprint: Some(fingerprint(body)),
  })
}

/// `POST /webhooks/{provider}`
pub async fn receive<S>(
  State(engine): State<Engine<S>>,
  Path(provider): Path<String>,
  body: Bytes,
) -> Result<impl IntoResponse, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let delivery = translate(provider, &body)?;
  debug!(
    provider = %delivery.provider,
    delivery_id = %delivery.delivery_id,
    stream = %delivery.stream,
    event_type = delivery.event.event_type(),
    "webhook received"
  );
  let ingested = engine.ingestor().ingest(delivery).await?;
  Ok((StatusCode::ACCEPTED, Json(ingested.receipt)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn payment_envelope_maps_to_subscription_stream() {
    let sub = Uuid::new_v4();
    let creator = Uuid::new_v4();
    let body = serde_json::json!({
      "delivery_id": "evt_1",
      "type": "payment_succeeded",
      "subscription_id": sub,
      "creator_id": creator,
      "payment_ref": "pi_1",
      "amount_cents": 1000,
      "currency": "USD",
    })
    .to_string();

    let delivery = translate("stripe".into(), body.as_bytes()).unwrap();
    assert_eq!(delivery.stream, StreamId::subscription(sub));
    let DomainEvent::PaymentSucceeded(paid) = delivery.event else {
      panic!("expected payment_succeeded");
    };
    assert_eq!(paid.creator_id, creator);
    assert_eq!(delivery.fingerprint, Some(fingerprint(body.as_bytes())));
  }

  #[test]
  fn payout_envelope_maps_to_wallet_stream() {
    let creator = Uuid::new_v4();
    let body = serde_json::json!({
      "delivery_id": "po_1",
      "type": "payout_issued",
      "creator_id": creator,
      "payout_ref": "po_1",
      "amount_cents": 500,
    })
    .to_string();

    let delivery = translate("stripe".into(), body.as_bytes()).unwrap();
    assert_eq!(delivery.stream, StreamId::wallet(creator));
  }

  #[test]
  fn unsupported_or_incomplete_envelopes_are_rejected() {
    let internal = serde_json::json!({
      "delivery_id": "x",
      "type": "ledger_credited",
      "creator_id": Uuid::new_v4(),
    })
    .to_string();
    assert!(matches!(
      translate("stripe".into(), internal.as_bytes()),
      Err(ApiError::Validation(_))
    ));

    let missing = serde_json::json!({
      "delivery_id": "x",
      "type": "payment_failed",
      "payment_ref": "pi_1",
    })
    .to_string();
    assert!(matches!(
      translate("stripe".into(), missing.as_bytes()),
      Err(ApiError::Validation(_))
    ));
  }
}
