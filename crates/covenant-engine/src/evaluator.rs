//! Scheduled and on-demand invariant evaluation.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use covenant_core::{
  invariant::{
    self, EvaluationScope, InvariantPolicy, ViolationCategory, ViolationRecord,
  },
  store::ProjectionStore,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{error::Result, pause};

/// One evaluator run. Healthy iff `violations` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
  pub evaluated_at: DateTime<Utc>,
  pub violations:   Vec<ViolationRecord>,
}

impl Evaluation {
  pub fn is_healthy(&self) -> bool { self.violations.is_empty() }

  pub fn by_category(&self) -> BTreeMap<ViolationCategory, usize> {
    invariant::summarize(&self.violations)
  }
}

pub struct InvariantEvaluator<S> {
  store:  Arc<S>,
  policy: InvariantPolicy,
}

impl<S: ProjectionStore> InvariantEvaluator<S> {
  pub fn new(store: Arc<S>, policy: InvariantPolicy) -> Self {
    Self { store, policy }
  }

  pub fn policy(&self) -> &InvariantPolicy { &self.policy }

  /// Read the projections once and run every predicate in `scope`. Never
  /// writes.
  pub async fn evaluate(
    &self,
    scope: EvaluationScope,
    now: DateTime<Utc>,
  ) -> Result<Evaluation, S::Error> {
    let snapshot = self.store.snapshot(scope.clone()).await?;
    let violations = invariant::evaluate(&snapshot, &scope, &self.policy, now);
    Ok(Evaluation { evaluated_at: now, violations })
  }

  /// Evaluate everything every `interval` until `shutdown` turns `true`,
  /// logging one warning per violated category.
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>, interval: Duration) {
    while !*shutdown.borrow() {
      match self.evaluate(EvaluationScope::all(), Utc::now()).await {
        Ok(eval) if eval.is_healthy() => debug!("invariants hold"),
        Ok(eval) => {
          for (category, count) in eval.by_category() {
            warn!(
              category = %category,
              severity = ?category.severity(),
              count,
              "invariant violations detected"
            );
          }
        }
        Err(e) => error!(error = %e, "invariant evaluation failed"),
      }
      if !pause(&mut shutdown, interval).await {
        break;
      }
    }
    info!("evaluator stopped");
  }
}
