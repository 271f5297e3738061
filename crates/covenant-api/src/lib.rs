//! JSON HTTP surface for Covenant.
//!
//! Exposes an axum [`Router`] backed by a [`covenant_engine::Engine`] over
//! any store implementing the `covenant-core` store traits. Auth and TLS are
//! the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! let app = covenant_api::api_router(engine.clone());
//! axum::serve(listener, app).await?;
//! ```

pub mod error;
pub mod health;
pub mod reads;
pub mod streams;
pub mod webhooks;

use axum::{
  Router,
  routing::{get, post},
};
use covenant_core::store::{EventStore, ProjectionStore};
use covenant_engine::Engine;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Build the full router for `engine`.
pub fn api_router<S>(engine: Engine<S>) -> Router<()>
where
  S: EventStore + ProjectionStore + 'static,
{
  Router::new()
    // Health
    .route("/health/live", get(health::live))
    .route("/health/ready", get(health::ready::<S>))
    .route("/health/invariants", get(health::invariants::<S>))
    // Ingestion
    .route("/webhooks/{provider}", post(webhooks::receive::<S>))
    // Streams
    .route(
      "/streams/{type}/{id}/events",
      get(streams::list::<S>).post(streams::append::<S>),
    )
    // Projections
    .route("/subscriptions/{id}", get(reads::subscription::<S>))
    .route("/wallets/{creator_id}", get(reads::wallet::<S>))
    .route("/wallets/{creator_id}/corrections", get(reads::corrections::<S>))
    .route("/memberships/{id}", get(reads::membership::<S>))
    .route("/anomalies", get(reads::anomalies::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(engine)
}
