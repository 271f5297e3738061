//! The Covenant consistency engine: projector and ledger poster, invariant
//! evaluator, reconciler, webhook ingestion, direct commands and the grace
//! sweep.
//!
//! Every component is generic over the store traits in `covenant-core` and
//! holds the store behind an [`Arc`], so they can be cloned into background
//! tasks and HTTP handlers alike.

use std::{sync::Arc, time::Duration};

use covenant_core::{
  invariant::InvariantPolicy,
  ledger::FeeSchedule,
  store::{EventStore, ProjectionStore},
};
use tokio::sync::watch;

pub mod command;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod posting;
pub mod projector;
pub mod reconcile;
pub mod retry;
pub mod sweeper;

pub use error::{EngineError, Result};

use crate::{
  command::CommandHandler, evaluator::InvariantEvaluator, ingest::WebhookIngestor,
  posting::LedgerPoster, projector::Projector, reconcile::Reconciler,
  retry::RetryPolicy, sweeper::GraceSweeper,
};

/// Tunables shared by the engine's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
  pub fees:       FeeSchedule,
  pub invariants: InvariantPolicy,
  pub retry:      RetryPolicy,
  /// Events per projector batch.
  pub batch_size: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      fees:       FeeSchedule::default(),
      invariants: InvariantPolicy::default(),
      retry:      RetryPolicy::default(),
      batch_size: 500,
    }
  }
}

/// Builds engine components over one shared store.
pub struct Engine<S> {
  store:  Arc<S>,
  config: EngineConfig,
}

impl<S> Clone for Engine<S> {
  fn clone(&self) -> Self {
    Self { store: self.store.clone(), config: self.config }
  }
}

impl<S: EventStore + ProjectionStore> Engine<S> {
  pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
    Self { store, config }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn config(&self) -> &EngineConfig { &self.config }

  pub fn commands(&self) -> CommandHandler<S> { CommandHandler::new(self.store.clone()) }

  pub fn poster(&self) -> LedgerPoster<S> {
    LedgerPoster::new(self.store.clone(), self.config.fees, self.config.retry)
  }

  pub fn projector(&self) -> Projector<S> {
    Projector::new(self.store.clone(), self.poster(), self.config.batch_size)
  }

  pub fn evaluator(&self) -> InvariantEvaluator<S> {
    InvariantEvaluator::new(self.store.clone(), self.config.invariants)
  }

  pub fn reconciler(&self) -> Reconciler<S> { Reconciler::new(self.store.clone()) }

  pub fn ingestor(&self) -> WebhookIngestor<S> {
    WebhookIngestor::new(self.store.clone(), self.config.retry)
  }

  pub fn sweeper(&self) -> GraceSweeper<S> {
    GraceSweeper::new(self.store.clone(), self.config.invariants.grace)
  }
}

/// Sleep for `period`, waking early when the shutdown value changes.
/// Returns `false` once the sender is gone.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
  tokio::select! {
    _ = tokio::time::sleep(period) => true,
    changed = shutdown.changed() => changed.is_ok(),
  }
}

#[cfg(test)]
mod tests;
