//! Ledger posting: turning `payment_succeeded` events into `ledger_credited`
//! events on the creator's wallet stream.
//!
//! Every credit goes through the idempotency guard under the key
//! `ledger-credit:<payment sequence>`, so a payment is credited at most once
//! no matter how many times the projector or a repair run sees it.

use std::sync::Arc;

use covenant_core::{
  delivery::{AppendRequest, DeliveryKey, Processing},
  event::{DomainEvent, EventRecord, NewEvent},
  invariant::EvaluationScope,
  ledger::FeeSchedule,
  store::{EventStore, ProjectionStore},
  stream::StreamId,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  error::{EngineError, Result},
  retry::{RetryPolicy, retry_on_conflict},
};

/// Provider namespace of ledger-posting delivery keys.
pub const LEDGER_CREDIT_PROVIDER: &str = "ledger-credit";

pub fn credit_key(payment_sequence: u64) -> DeliveryKey {
  DeliveryKey::from_stored(format!(
    "{LEDGER_CREDIT_PROVIDER}:{payment_sequence}"
  ))
}

pub struct LedgerPoster<S> {
  store: Arc<S>,
  fees:  FeeSchedule,
  retry: RetryPolicy,
}

impl<S> Clone for LedgerPoster<S> {
  fn clone(&self) -> Self {
    Self { store: self.store.clone(), fees: self.fees, retry: self.retry }
  }
}

impl<S: EventStore + ProjectionStore> LedgerPoster<S> {
  pub fn new(store: Arc<S>, fees: FeeSchedule, retry: RetryPolicy) -> Self {
    Self { store, fees, retry }
  }

  /// Credit the creator for `payment`. Returns `None` when `payment` is not a
  /// `payment_succeeded` event.
  pub async fn post_credit(
    &self,
    payment: &EventRecord,
  ) -> Result<Option<Processing>, S::Error> {
    let DomainEvent::PaymentSucceeded(paid) = &payment.event else {
      return Ok(None);
    };
    let key = credit_key(payment.sequence);
    if let Some(record) = self.store.find_delivery(key.clone()).await? {
      return Ok(Some(Processing::AlreadyProcessed(record)));
    }

    let wallet = StreamId::wallet(paid.creator_id);
    let credit = self.fees.credit_for(payment, paid);
    let outcome = retry_on_conflict(&self.retry, "ledger_credit", || {
      let store = self.store.clone();
      let key = key.clone();
      let event = NewEvent::new(DomainEvent::LedgerCredited(credit.clone()))
        .caused_by(payment);
      async move {
        let expected_version = store.stream_version(wallet).await?;
        let request = AppendRequest {
          stream: wallet,
          expected_version,
          events: vec![event],
          fingerprint: None,
        };
        Ok::<_, EngineError<S::Error>>(
          store.begin_processing(key, request).await?,
        )
      }
    })
    .await?;

    if outcome.is_accepted() {
      info!(
        payment_sequence = payment.sequence,
        creator_id = %paid.creator_id,
        gross_cents = credit.gross_cents,
        fee_cents = credit.fee_cents,
        net_cents = credit.net_cents,
        "ledger credit posted"
      );
    }
    Ok(Some(outcome))
  }

  /// Re-post credits for payments that have no ledger entry. Returns the
  /// number of credits actually appended.
  pub async fn repair(&self, creator_id: Option<Uuid>) -> Result<u64, S::Error> {
    let scope = EvaluationScope { creator_id, ..EvaluationScope::default() };
    let snapshot = self.store.snapshot(scope).await?;

    let mut posted = 0;
    for payment in snapshot.payments.iter().filter(|p| p.ledger_sequence.is_none()) {
      let Some(record) = self.store.read_event(payment.sequence).await? else {
        warn!(sequence = payment.sequence, "payment row without event");
        continue;
      };
      match self.post_credit(&record).await {
        Ok(Some(p)) if p.is_accepted() => posted += 1,
        Ok(_) => {}
        Err(EngineError::RetriesExhausted { .. }) => {
          warn!(sequence = payment.sequence, "ledger repair gave up on payment");
        }
        Err(e) => return Err(e),
      }
    }
    info!(posted, "ledger repair finished");
    Ok(posted)
  }
}
