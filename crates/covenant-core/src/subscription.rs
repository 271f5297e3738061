//! Subscription lifecycle translator.
//!
//! ```text
//! Created ──payment_succeeded──▶ Active ──payment_failed──▶ GracePeriod
//!                                  ▲                          │  │
//!                                  └────payment_succeeded─────┘  │
//!                                                                ▼
//! Active | GracePeriod ──cancellation_requested──▶ Cancelled   Expired
//!                                               (grace_period_elapsed)
//! ```
//!
//! `Cancelled` and `Expired` are terminal. Two self-loops are also accepted
//! because real billing produces them: a renewal `payment_succeeded` while
//! `Active`, and a retried `payment_failed` while already in `GracePeriod`
//! (which does not restart the grace clock).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::{DomainEvent, EventRecord},
};

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
  Created,
  Active,
  GracePeriod,
  Cancelled,
  Expired,
}

impl SubscriptionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Created => "created",
      Self::Active => "active",
      Self::GracePeriod => "grace_period",
      Self::Cancelled => "cancelled",
      Self::Expired => "expired",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Cancelled | Self::Expired)
  }

  /// Statuses that entitle the fan to access. A grace period keeps access
  /// while the provider retries the charge.
  pub fn grants_access(&self) -> bool {
    matches!(self, Self::Active | Self::GracePeriod)
  }
}

impl fmt::Display for SubscriptionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Folded state of one subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
  pub subscription_id:    Uuid,
  pub creator_id:         Uuid,
  pub fan_id:             Uuid,
  pub tier:               String,
  pub price_cents:        i64,
  pub currency:           String,
  pub status:             SubscriptionStatus,
  /// The payment method on file, if any.
  pub payment_method:     Option<String>,
  /// Set on entering `GracePeriod`; cleared on recovery.
  pub grace_started_at:   Option<DateTime<Utc>>,
  pub last_payment_at:    Option<DateTime<Utc>>,
  pub payments_succeeded: u32,
  pub payments_failed:    u32,
  /// Set on entering a terminal status.
  pub ended_at:           Option<DateTime<Utc>>,
}

/// Fold `record` onto `state`.
///
/// `state` is `None` before the stream's first event; the only valid first
/// event is `subscription_created`.
pub fn apply(
  state: Option<SubscriptionState>,
  record: &EventRecord,
) -> Result<SubscriptionState> {
  use SubscriptionStatus::*;

  let Some(mut s) = state else {
    return match &record.event {
      DomainEvent::SubscriptionCreated(e) => Ok(SubscriptionState {
        subscription_id:    record.stream.id,
        creator_id:         e.creator_id,
        fan_id:             e.fan_id,
        tier:               e.tier.clone(),
        price_cents:        e.price_cents,
        currency:           e.currency.clone(),
        status:             Created,
        payment_method:     None,
        grace_started_at:   None,
        last_payment_at:    None,
        payments_succeeded: 0,
        payments_failed:    0,
        ended_at:           None,
      }),
      _ => Err(Error::invalid_transition(record, "uninitialised")),
    };
  };

  if s.status.is_terminal() {
    return Err(Error::invalid_transition(record, s.status));
  }

  match (&record.event, s.status) {
    (DomainEvent::PaymentMethodAttached(e), _) => {
      s.payment_method = Some(e.method_ref.clone());
    }
    (DomainEvent::PaymentMethodDetached(e), _) => {
      if s.payment_method.as_deref() != Some(e.method_ref.as_str()) {
        return Err(Error::invalid_transition(
          record,
          format!("{} without method {}", s.status, e.method_ref),
        ));
      }
      s.payment_method = None;
    }
    (DomainEvent::PaymentSucceeded(_), Created | Active | GracePeriod) => {
      s.status = Active;
      s.grace_started_at = None;
      s.last_payment_at = Some(record.occurred_at);
      s.payments_succeeded += 1;
    }
    (DomainEvent::PaymentFailed(_), Active) => {
      s.status = GracePeriod;
      s.grace_started_at = Some(record.occurred_at);
      s.payments_failed += 1;
    }
    (DomainEvent::PaymentFailed(_), GracePeriod) => {
      s.payments_failed += 1;
    }
    (DomainEvent::GracePeriodElapsed(_), GracePeriod) => {
      s.status = Expired;
      s.ended_at = Some(record.occurred_at);
    }
    (DomainEvent::CancellationRequested(_), Active | GracePeriod) => {
      s.status = Cancelled;
      s.grace_started_at = None;
      s.ended_at = Some(record.occurred_at);
    }
    _ => return Err(Error::invalid_transition(record, s.status)),
  }

  Ok(s)
}
