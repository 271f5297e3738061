//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Bodies are `{"error": "<category>", "message": "..."}`. Messages come from
//! error `Display` impls, which name streams and versions but never carry
//! event payloads.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use covenant_core::store::StoreError;
use covenant_engine::EngineError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  /// The request was malformed or failed schema validation.
  #[error("validation error: {0}")]
  Validation(String),

  /// The request collides with the current state of a stream.
  #[error("{message}")]
  Conflict {
    category: &'static str,
    message:  String,
  },

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
  /// Classify a backend error by the domain error it carries. A stored row
  /// that fails to decode is a server fault, not a bad request.
  pub fn store<E: StoreError>(e: E) -> Self {
    match e.core() {
      Some(core) if !core.is_decode_failure() => Self::from_core(core),
      _ => Self::Store(Box::new(e)),
    }
  }

  fn from_core(e: &covenant_core::Error) -> Self {
    use covenant_core::Error as E;

    let message = e.to_string();
    let category = match e {
      E::ConcurrencyConflict { .. } => "concurrency_conflict",
      E::InvalidTransition { .. } => "invalid_transition",
      E::OutOfOrder { .. } => "out_of_order",
      E::Validation(_)
      | E::UnknownEventType(_)
      | E::UnsupportedSchemaVersion { .. }
      | E::UnknownStreamType(_)
      | E::Serialization(_) => return Self::Validation(message),
    };
    Self::Conflict { category, message }
  }

  fn category(&self) -> &'static str {
    match self {
      Self::NotFound(_) => "not_found",
      Self::Validation(_) => "validation",
      Self::Conflict { category, .. } => category,
      Self::Store(_) => "store",
    }
  }
}

impl<E: StoreError> From<EngineError<E>> for ApiError {
  fn from(e: EngineError<E>) -> Self {
    match e {
      EngineError::Store(inner) | EngineError::RetriesExhausted { last: inner, .. } => {
        Self::store(inner)
      }
      EngineError::Core(core) => Self::from_core(&core),
      mismatch @ EngineError::FingerprintMismatch { .. } => Self::Conflict {
        category: "fingerprint_mismatch",
        message:  mismatch.to_string(),
      },
      other => Self::Store(Box::new(other)),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self {
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
      ApiError::Conflict { .. } => StatusCode::CONFLICT,
      ApiError::Store(e) => {
        error!(error = %e, "store failure");
        StatusCode::INTERNAL_SERVER_ERROR
      }
    };
    let body = json!({ "error": self.category(), "message": self.to_string() });
    (status, Json(body)).into_response()
  }
}
