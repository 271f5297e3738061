//! Read-only projection endpoints for operators.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/subscriptions/{id}` | 404 if never projected |
//! | `GET`  | `/wallets/{creator_id}` | Row plus ledger entries |
//! | `GET`  | `/wallets/{creator_id}/corrections` | Reconciliation audit trail |
//! | `GET`  | `/memberships/{id}` | |
//! | `GET`  | `/anomalies` | Unresolved fold defects |

use axum::{
  Json,
  extract::{Path, State},
};
use covenant_core::{
  ledger::LedgerEntry,
  projection::{Anomaly, ProjectionRow},
  store::{EventStore, ProjectionStore, WalletCorrection},
  stream::StreamId,
};
use covenant_engine::Engine;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;

async fn projection<S>(
  engine: &Engine<S>,
  stream: StreamId,
) -> Result<ProjectionRow, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  engine
    .store()
    .get_projection(stream)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("{stream} not found")))
}

/// `GET /subscriptions/{id}`
pub async fn subscription<S>(
  State(engine): State<Engine<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<ProjectionRow>, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  Ok(Json(projection(&engine, StreamId::subscription(id)).await?))
}

/// `GET /memberships/{id}`
pub async fn membership<S>(
  State(engine): State<Engine<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<ProjectionRow>, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  Ok(Json(projection(&engine, StreamId::membership(id)).await?))
}

// ─── Wallets ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct WalletView {
  #[serde(flatten)]
  pub row:    ProjectionRow,
  pub ledger: Vec<LedgerEntry>,
}

/// `GET /wallets/{creator_id}`
pub async fn wallet<S>(
  State(engine): State<Engine<S>>,
  Path(creator_id): Path<Uuid>,
) -> Result<Json<WalletView>, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let row = projection(&engine, StreamId::wallet(creator_id)).await?;
  let ledger = engine
    .store()
    .ledger_entries(creator_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(WalletView { row, ledger }))
}

/// `GET /wallets/{creator_id}/corrections`
pub async fn corrections<S>(
  State(engine): State<Engine<S>>,
  Path(creator_id): Path<Uuid>,
) -> Result<Json<Vec<WalletCorrection>>, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let corrections = engine
    .store()
    .corrections(creator_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(corrections))
}

/// `GET /anomalies`
pub async fn anomalies<S>(
  State(engine): State<Engine<S>>,
) -> Result<Json<Vec<Anomaly>>, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let anomalies = engine.store().open_anomalies().await.map_err(ApiError::store)?;
  Ok(Json(anomalies))
}
