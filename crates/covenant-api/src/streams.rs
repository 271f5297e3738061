//! Handlers for `/streams/{type}/{id}/events`.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/streams/{type}/{id}/events` | Event metadata; optional `?from_version=` |
//! | `POST` | `/streams/{type}/{id}/events` | Body: `{"expected_version":0,"events":[...]}`; commands only |
//!
//! Reads return metadata only, never payloads.

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use covenant_core::{
  event::{EventRecord, NewEvent},
  store::{EventStore, ProjectionStore},
  stream::{StreamId, StreamType},
};
use covenant_engine::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

fn stream_id(stream_type: &str, id: Uuid) -> Result<StreamId, ApiError> {
  let stream_type: StreamType = stream_type
    .parse()
    .map_err(|e: covenant_core::Error| ApiError::Validation(e.to_string()))?;
  Ok(StreamId::new(stream_type, id))
}

// ─── Read ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReadParams {
  #[serde(default = "first_version")]
  pub from_version: u64,
}

fn first_version() -> u64 { 1 }

#[derive(Debug, Serialize)]
pub struct EventMetadata {
  pub sequence:       u64,
  pub event_id:       Uuid,
  pub stream_version: u64,
  pub schema_version: u16,
  pub event_type:     &'static str,
  pub occurred_at:    DateTime<Utc>,
  pub causation_id:   Uuid,
  pub correlation_id: Uuid,
}

impl From<&EventRecord> for EventMetadata {
  fn from(r: &EventRecord) -> Self {
    Self {
      sequence:       r.sequence,
      event_id:       r.event_id,
      stream_version: r.stream_version,
      schema_version: r.schema_version,
      event_type:     r.event_type(),
      occurred_at:    r.occurred_at,
      causation_id:   r.causation_id,
      correlation_id: r.correlation_id,
    }
  }
}

/// `GET /streams/{type}/{id}/events[?from_version=<n>]`
pub async fn list<S>(
  State(engine): State<Engine<S>>,
  Path((stream_type, id)): Path<(String, Uuid)>,
  Query(params): Query<ReadParams>,
) -> Result<Json<Vec<EventMetadata>>, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let stream = stream_id(&stream_type, id)?;
  let events = engine
    .store()
    .read_stream(stream, params.from_version)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(events.iter().map(EventMetadata::from).collect()))
}

// ─── Append ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AppendBody {
  pub expected_version: u64,
  pub events:           Vec<NewEvent>,
}

#[derive(Debug, Serialize)]
pub struct AppendResponse {
  pub stream:      StreamId,
  pub new_version: u64,
  pub sequences:   Vec<u64>,
}

/// `POST /streams/{type}/{id}/events`
///
/// Accepts first-party commands only; a payment or ledger event is a 422.
/// A stale `expected_version` or an invalid transition is a 409.
pub async fn append<S>(
  State(engine): State<Engine<S>>,
  Path((stream_type, id)): Path<(String, Uuid)>,
  Json(body): Json<AppendBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let stream = stream_id(&stream_type, id)?;
  let appended = engine
    .commands()
    .append(stream, body.expected_version, body.events)
    .await?;
  let response = AppendResponse {
    stream,
    new_version: appended.new_version,
    sequences: appended.sequences(),
  };
  Ok((StatusCode::CREATED, Json(response)))
}
