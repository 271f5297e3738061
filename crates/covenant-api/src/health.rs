//! Handlers for `/health` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/health/live` | Always 200 |
//! | `GET`  | `/health/ready` | 503 if the store does not answer |
//! | `GET`  | `/health/invariants` | 503 while any violation is open; optional `?creator_id=&category=` |

use std::collections::{BTreeMap, BTreeSet};

use axum::{
  Json,
  extract::{Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use covenant_core::{
  invariant::{EvaluationScope, ViolationCategory, ViolationRecord},
  store::{EventStore, ProjectionStore, Store},
};
use covenant_engine::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;

/// `GET /health/live`
pub async fn live() -> impl IntoResponse {
  Json(json!({
    "status": "ok",
    "service": "covenant",
    "version": env!("CARGO_PKG_VERSION"),
  }))
}

/// `GET /health/ready`
pub async fn ready<S>(State(engine): State<Engine<S>>) -> impl IntoResponse
where
  S: EventStore + ProjectionStore + 'static,
{
  match engine.store().ping().await {
    Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
    Err(e) => {
      warn!(error = %e, "readiness check failed");
      (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "unavailable" })),
      )
    }
  }
}

// ─── Invariants ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct InvariantParams {
  pub creator_id: Option<Uuid>,
  /// Restrict to a single category.
  pub category:   Option<ViolationCategory>,
}

#[derive(Debug, Serialize)]
pub struct InvariantReport {
  pub healthy:         bool,
  pub evaluated_at:    DateTime<Utc>,
  pub violation_count: usize,
  pub by_category:     BTreeMap<ViolationCategory, usize>,
  pub violations:      Vec<ViolationRecord>,
}

/// `GET /health/invariants[?creator_id=<uuid>&category=<category>]`
pub async fn invariants<S>(
  State(engine): State<Engine<S>>,
  Query(params): Query<InvariantParams>,
) -> Result<impl IntoResponse, ApiError>
where
  S: EventStore + ProjectionStore + 'static,
{
  let scope = EvaluationScope {
    categories: params.category.into_iter().collect::<BTreeSet<_>>(),
    creator_id: params.creator_id,
  };
  let eval = engine.evaluator().evaluate(scope, Utc::now()).await?;

  let status = if eval.is_healthy() {
    StatusCode::OK
  } else {
    StatusCode::SERVICE_UNAVAILABLE
  };
  let report = InvariantReport {
    healthy:         eval.is_healthy(),
    evaluated_at:    eval.evaluated_at,
    violation_count: eval.violations.len(),
    by_category:     eval.by_category(),
    violations:      eval.violations,
  };
  Ok((status, Json(report)))
}
