//! Grace sweep: expiring subscriptions whose grace period has run out.
//!
//! An explicit administrative operation. Evaluation only reports overdue
//! grace periods; this is what resolves them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use covenant_core::{
  event::{DomainEvent, GracePeriodElapsed, NewEvent},
  invariant::{EvaluationScope, GracePolicy},
  store::{EventStore, ProjectionStore, StoreError},
  stream::StreamId,
  subscription::SubscriptionStatus,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  /// Subscriptions that received `grace_period_elapsed`.
  pub expired: Vec<Uuid>,
  /// Subscriptions whose stream moved on after the projection was read.
  pub skipped: Vec<Uuid>,
}

pub struct GraceSweeper<S> {
  store:  Arc<S>,
  policy: GracePolicy,
}

impl<S: EventStore + ProjectionStore> GraceSweeper<S> {
  pub fn new(store: Arc<S>, policy: GracePolicy) -> Self { Self { store, policy } }

  /// Append `grace_period_elapsed` to every subscription in grace since at
  /// least the configured period before `now`. Uses the projection's version
  /// as the expected version and skips on conflict.
  pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, S::Error> {
    let snapshot = self.store.snapshot(EvaluationScope::all()).await?;
    let mut report = SweepReport::default();

    for sub in snapshot.subscriptions {
      if sub.status != SubscriptionStatus::GracePeriod {
        continue;
      }
      let Some(started) = sub.grace_started_at else { continue };
      if self.policy.expires_at(started) > now {
        continue;
      }

      let stream = StreamId::subscription(sub.subscription_id);
      let Some(row) = self.store.get_projection(stream).await? else {
        continue;
      };
      let event = NewEvent::new(DomainEvent::GracePeriodElapsed(
        GracePeriodElapsed { grace_started_at: started },
      ));

      match self.store.append(stream, row.version, vec![event]).await {
        Ok(appended) => {
          info!(
            stream = %stream,
            stream_version = appended.new_version,
            grace_started_at = %started,
            "grace period elapsed"
          );
          report.expired.push(sub.subscription_id);
        }
        Err(e) if e.is_conflict() => {
          debug!(stream = %stream, "subscription changed during sweep, skipped");
          report.skipped.push(sub.subscription_id);
        }
        Err(e) => return Err(e.into()),
      }
    }

    Ok(report)
  }
}
