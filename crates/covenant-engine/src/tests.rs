//! End-to-end engine tests against an in-memory `SqliteStore`.

use std::sync::{Arc, atomic::AtomicBool};

use chrono::{DateTime, Duration, Utc};
use covenant_core::{
  event::{
    CancellationRequested, DomainEvent, GracePeriodElapsed, NewEvent,
    PaymentFailed, PaymentMethodAttached, PaymentSucceeded, PayoutIssued,
    SubscriptionCreated,
  },
  invariant::{EvaluationScope, ViolationCategory},
  store::{EventStore, JobStatus, ProjectionStore, StoreError},
  stream::{StreamId, StreamType},
  subscription::{SubscriptionState, SubscriptionStatus},
};
use covenant_store_sqlite::SqliteStore;
use uuid::Uuid;

use crate::{
  Engine, EngineConfig, EngineError,
  ingest::{Delivery, fingerprint},
};

async fn engine() -> Engine<SqliteStore> {
  let store = SqliteStore::open_in_memory()
    .await
    .expect("in-memory store");
  Engine::new(Arc::new(store), EngineConfig::default())
}

fn created(creator_id: Uuid) -> NewEvent {
  NewEvent::new(DomainEvent::SubscriptionCreated(SubscriptionCreated {
    creator_id,
    fan_id: Uuid::new_v4(),
    tier: "gold".into(),
    price_cents: 1000,
    currency: "USD".into(),
  }))
}

fn attached() -> NewEvent {
  NewEvent::new(DomainEvent::PaymentMethodAttached(PaymentMethodAttached {
    method_ref: "pm_card".into(),
  }))
}

fn payment(creator_id: Uuid, payment_ref: &str) -> DomainEvent {
  DomainEvent::PaymentSucceeded(PaymentSucceeded {
    payment_ref: payment_ref.into(),
    creator_id,
    amount_cents: 1000,
    currency: "USD".into(),
  })
}

fn failure(payment_ref: &str) -> DomainEvent {
  DomainEvent::PaymentFailed(PaymentFailed {
    payment_ref: payment_ref.into(),
    reason:      Some("card_declined".into()),
  })
}

fn delivery(id: &str, stream: StreamId, event: DomainEvent) -> Delivery {
  Delivery {
    provider: "stripe".into(),
    delivery_id: id.into(),
    stream,
    event,
    fingerprint: Some(fingerprint(id.as_bytes())),
  }
}

/// A `Created` subscription with a payment method, projected.
async fn new_subscription(e: &Engine<SqliteStore>, creator: Uuid) -> StreamId {
  let stream = StreamId::subscription(Uuid::new_v4());
  e.store()
    .append(stream, 0, vec![created(creator), attached()])
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();
  stream
}

async fn subscription_state(
  e: &Engine<SqliteStore>,
  stream: StreamId,
) -> SubscriptionState {
  e.store()
    .get_projection(stream)
    .await
    .unwrap()
    .and_then(|r| r.subscription().cloned())
    .expect("subscription projection")
}

async fn wallet_balance(e: &Engine<SqliteStore>, creator: Uuid) -> i64 {
  e.store()
    .get_projection(StreamId::wallet(creator))
    .await
    .unwrap()
    .and_then(|r| r.wallet().map(|w| w.balance_cents))
    .unwrap_or(0)
}

async fn categories(
  e: &Engine<SqliteStore>,
  now: DateTime<Utc>,
) -> Vec<ViolationCategory> {
  e.evaluator()
    .evaluate(EvaluationScope::all(), now)
    .await
    .unwrap()
    .violations
    .into_iter()
    .map(|v| v.category)
    .collect()
}

// ─── Webhook → projection → ledger ───────────────────────────────────────────

#[tokio::test]
async fn payment_webhook_activates_and_credits_once() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;

  let first = e
    .ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  assert!(!first.duplicate);
  assert_eq!(first.receipt.stream_version, 3);
  assert_eq!(first.receipt.sequences.len(), 1);

  e.projector().catch_up().await.unwrap();
  assert_eq!(subscription_state(&e, s1).await.status, SubscriptionStatus::Active);
  assert_eq!(wallet_balance(&e, creator).await, 920);

  let again = e
    .ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  assert!(again.duplicate);
  assert_eq!(again.receipt, first.receipt);

  e.projector().catch_up().await.unwrap();
  assert_eq!(e.store().stream_version(s1).await.unwrap(), 3);
  assert_eq!(wallet_balance(&e, creator).await, 920);
  assert_eq!(e.store().ledger_entries(creator).await.unwrap().len(), 1);
  assert!(categories(&e, Utc::now() + Duration::minutes(5)).await.is_empty());
}

#[tokio::test]
async fn first_payment_on_a_bare_subscription_lands_at_version_two() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  e.store().append(stream, 0, vec![created(creator)]).await.unwrap();

  let ingested = e
    .ingestor()
    .ingest(delivery("evt_1", stream, payment(creator, "pi_1")))
    .await
    .unwrap();
  assert_eq!(ingested.receipt.stream_version, 2);
  assert_eq!(ingested.receipt.sequences, vec![2]);

  e.projector().catch_up().await.unwrap();
  assert_eq!(subscription_state(&e, stream).await.status, SubscriptionStatus::Active);
  assert_eq!(wallet_balance(&e, creator).await, 920);
}

#[tokio::test]
async fn payment_folded_as_a_fault_is_never_credited() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  let ingestor = e.ingestor();
  ingestor
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  let cancel =
    DomainEvent::CancellationRequested(CancellationRequested { reason: None });
  ingestor
    .ingest(delivery("evt_cancel", s1, cancel))
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();
  assert_eq!(subscription_state(&e, s1).await.status, SubscriptionStatus::Cancelled);
  assert_eq!(wallet_balance(&e, creator).await, 920);

  // Written straight to the log, past every append-side transition check.
  e.store()
    .append(s1, 4, vec![NewEvent::new(payment(creator, "pi_2"))])
    .await
    .unwrap();
  let report = e.projector().catch_up().await.unwrap();
  assert_eq!(report.faulted, 1);
  assert_eq!(report.posted, 0);
  assert_eq!(wallet_balance(&e, creator).await, 920);
  assert_eq!(e.store().ledger_entries(creator).await.unwrap().len(), 1);

  assert_eq!(e.poster().repair(Some(creator)).await.unwrap(), 0);
  let later = Utc::now() + Duration::minutes(5);
  let cats = categories(&e, later).await;
  assert!(cats.contains(&ViolationCategory::StreamAnomaly));
  assert!(!cats.contains(&ViolationCategory::PaymentWithoutLedgerEntry));
}

#[tokio::test]
async fn commands_refuse_payments_and_invalid_transitions() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  let commands = e.commands();

  let err = commands
    .append(s1, 2, vec![NewEvent::new(payment(creator, "pi_forged"))])
    .await
    .unwrap_err();
  assert!(matches!(err.core(), Some(covenant_core::Error::Validation(_))));

  let cancel = || {
    NewEvent::new(DomainEvent::CancellationRequested(CancellationRequested {
      reason: Some("changed my mind".into()),
    }))
  };
  let err = commands.append(s1, 2, vec![cancel()]).await.unwrap_err();
  assert!(matches!(
    err.core(),
    Some(covenant_core::Error::InvalidTransition { version: 3, .. })
  ));

  let err = commands.append(s1, 1, vec![attached()]).await.unwrap_err();
  assert!(err.is_conflict());
  assert_eq!(e.store().stream_version(s1).await.unwrap(), 2);

  e.ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  let appended = commands.append(s1, 3, vec![cancel()]).await.unwrap();
  assert_eq!(appended.new_version, 4);
}

#[tokio::test]
async fn oversized_payout_is_rejected_before_it_reaches_the_log() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let wallet = StreamId::wallet(creator);
  let payout = |payout_ref: &str| {
    DomainEvent::PayoutIssued(PayoutIssued {
      payout_ref:   payout_ref.into(),
      amount_cents: i64::MAX,
    })
  };

  let err = e
    .ingestor()
    .ingest(delivery("po_1", wallet, payout("po_1")))
    .await
    .unwrap_err();
  assert!(matches!(err.core(), Some(covenant_core::Error::Validation(_))));

  let err = e
    .store()
    .append(wallet, 0, vec![NewEvent::new(payout("po_2"))])
    .await
    .unwrap_err();
  assert!(matches!(err.core(), Some(covenant_core::Error::Validation(_))));
  assert_eq!(e.store().stream_version(wallet).await.unwrap(), 0);
}

#[tokio::test]
async fn ledger_credit_is_chained_to_its_payment() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  e.ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();

  let paid = e.store().read_stream(s1, 3).await.unwrap().remove(0);
  let credit = e
    .store()
    .read_stream(StreamId::wallet(creator), 1)
    .await
    .unwrap()
    .remove(0);
  assert_eq!(credit.causation_id, paid.event_id);
  assert_eq!(credit.correlation_id, paid.correlation_id);
}

#[tokio::test]
async fn concurrent_redeliveries_are_accepted_once() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  let ingestor = Arc::new(e.ingestor());

  let handles: Vec<_> = (0..8)
    .map(|_| {
      let ingestor = ingestor.clone();
      tokio::spawn(async move {
        ingestor
          .ingest(delivery("evt_dup", s1, payment(creator, "pi_1")))
          .await
      })
    })
    .collect();

  let mut fresh = 0;
  let mut receipts = Vec::new();
  for h in handles {
    let ingested = h.await.unwrap().unwrap();
    if !ingested.duplicate {
      fresh += 1;
    }
    receipts.push(ingested.receipt);
  }
  assert_eq!(fresh, 1);
  assert!(receipts.windows(2).all(|w| w[0] == w[1]));
  assert_eq!(e.store().stream_version(s1).await.unwrap(), 3);
}

#[tokio::test]
async fn invalid_transition_is_refused_without_consuming_the_key() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;

  let err = e
    .ingestor()
    .ingest(delivery("evt_fail", s1, failure("pi_0")))
    .await
    .unwrap_err();
  assert!(matches!(
    err.core(),
    Some(covenant_core::Error::InvalidTransition { .. })
  ));
  assert_eq!(e.store().stream_version(s1).await.unwrap(), 2);

  let key = covenant_core::delivery::DeliveryKey::new("stripe", "evt_fail").unwrap();
  assert!(e.store().find_delivery(key).await.unwrap().is_none());
}

#[tokio::test]
async fn redelivery_with_different_body_is_rejected() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  e.ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();

  let mut tampered = delivery("evt_1", s1, payment(creator, "pi_1"));
  tampered.fingerprint = Some(fingerprint(b"something else"));
  let err = e.ingestor().ingest(tampered).await.unwrap_err();
  assert!(matches!(err, EngineError::FingerprintMismatch { .. }));
}

#[tokio::test]
async fn concurrent_appends_with_same_expected_version() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;

  let store = e.store().clone();
  let (a, b) = tokio::join!(
    store.append(s1, 2, vec![NewEvent::new(payment(creator, "pi_a"))]),
    store.append(s1, 2, vec![NewEvent::new(payment(creator, "pi_b"))]),
  );
  let (ok, conflict): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(Result::is_ok);
  assert_eq!(ok.len(), 1);
  assert_eq!(conflict.len(), 1);
  assert!(conflict[0].as_ref().unwrap_err().is_conflict());
}

// ─── Grace periods ───────────────────────────────────────────────────────────

async fn in_grace(e: &Engine<SqliteStore>, creator: Uuid) -> (StreamId, DateTime<Utc>) {
  let s2 = new_subscription(e, creator).await;
  let ingestor = e.ingestor();
  ingestor
    .ingest(delivery("evt_paid", s2, payment(creator, "pi_1")))
    .await
    .unwrap();
  ingestor
    .ingest(delivery("evt_failed", s2, failure("pi_2")))
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();

  let state = subscription_state(e, s2).await;
  assert_eq!(state.status, SubscriptionStatus::GracePeriod);
  (s2, state.grace_started_at.expect("grace start"))
}

#[tokio::test]
async fn grace_sla_breach_is_flagged_after_slack() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let (s2, started) = in_grace(&e, creator).await;
  let deadline = started + Duration::hours(72 + 4);

  let breached = |cats: Vec<ViolationCategory>| {
    cats.contains(&ViolationCategory::GracePeriodSlaBreached)
  };
  assert!(!breached(categories(&e, deadline - Duration::minutes(1)).await));
  assert!(!breached(categories(&e, deadline).await));
  assert!(breached(categories(&e, deadline + Duration::seconds(1)).await));

  let before = subscription_state(&e, s2).await;
  let outcome = e.reconciler().rebuild(s2).await.unwrap();
  assert!(!outcome.is_faulted());
  assert_eq!(outcome.current.unwrap().subscription(), Some(&before));
}

#[tokio::test]
async fn sweep_expires_only_overdue_grace_periods() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let (s2, started) = in_grace(&e, creator).await;
  let sweeper = e.sweeper();

  let early = sweeper.sweep(started + Duration::hours(71)).await.unwrap();
  assert!(early.expired.is_empty());

  let due = sweeper.sweep(started + Duration::hours(72)).await.unwrap();
  assert_eq!(due.expired, vec![s2.id]);
  e.projector().catch_up().await.unwrap();
  assert_eq!(subscription_state(&e, s2).await.status, SubscriptionStatus::Expired);

  let again = sweeper.sweep(started + Duration::hours(80)).await.unwrap();
  assert!(again.expired.is_empty() && again.skipped.is_empty());
}

// ─── Reconciliation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reconcile_wallet_corrects_drift() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  let ingestor = e.ingestor();
  ingestor
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  ingestor
    .ingest(delivery("evt_2", s1, payment(creator, "pi_2")))
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();
  assert_eq!(wallet_balance(&e, creator).await, 1840);

  e.store().set_wallet_balance(creator, -5).await.unwrap();
  let cats = categories(&e, Utc::now()).await;
  assert!(cats.contains(&ViolationCategory::WalletDrift));
  assert!(cats.contains(&ViolationCategory::NegativeWalletBalance));

  let reconciler = e.reconciler();
  let result = reconciler.reconcile_wallet(creator).await.unwrap();
  assert_eq!(result.previous_balance, Some(-5));
  assert_eq!(result.balance_cents, 1840);
  let correction = result.correction.expect("audit record");
  assert_eq!(correction.corrected_balance, 1840);
  assert_eq!(correction.entry_count, 2);

  let ledger_sum: i64 = e
    .store()
    .ledger_entries(creator)
    .await
    .unwrap()
    .iter()
    .map(|l| l.delta_cents)
    .sum();
  assert_eq!(wallet_balance(&e, creator).await, ledger_sum);
  assert!(categories(&e, Utc::now()).await.is_empty());

  let unchanged = reconciler.reconcile_wallet(creator).await.unwrap();
  assert!(unchanged.correction.is_none());
  assert_eq!(e.store().corrections(creator).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reconcile_wallet_restores_a_missing_row() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  e.ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();

  e.store().drop_projection(StreamId::wallet(creator)).await.unwrap();
  let result = e.reconciler().reconcile_wallet(creator).await.unwrap();
  assert_eq!(result.previous_balance, None);
  assert_eq!(result.balance_cents, 920);
  assert!(result.correction.is_some());
}

#[tokio::test]
async fn reconcile_all_isolates_a_corrupted_stream() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let mut healthy = Vec::new();
  for _ in 0..3 {
    healthy.push(new_subscription(&e, creator).await);
  }

  let corrupted = StreamId::subscription(Uuid::new_v4());
  let elapsed = NewEvent::new(DomainEvent::GracePeriodElapsed(GracePeriodElapsed {
    grace_started_at: Utc::now(),
  }));
  e.store()
    .append(corrupted, 0, vec![created(creator), elapsed])
    .await
    .unwrap();

  let cancel = AtomicBool::new(false);
  let report = e
    .reconciler()
    .reconcile_all(StreamType::Subscription, "test:subs".into(), &cancel)
    .await
    .unwrap();
  assert!(report.is_complete());
  assert_eq!(report.job.rebuilt, 3);
  assert_eq!(report.job.failed, 1);
  assert_eq!(report.faulted.len(), 1);
  assert_eq!(report.faulted[0].stream, corrupted);

  for stream in healthy {
    assert_eq!(subscription_state(&e, stream).await.status, SubscriptionStatus::Created);
  }
  assert!(
    categories(&e, Utc::now())
      .await
      .contains(&ViolationCategory::StreamAnomaly)
  );
}

#[tokio::test]
async fn undecodable_event_quarantines_only_its_stream() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let store = e.store();

  let corrupted = StreamId::subscription(Uuid::new_v4());
  store
    .append(corrupted, 0, vec![created(creator), attached()])
    .await
    .unwrap();
  let bad = store
    .insert_raw_event(
      corrupted,
      "payment_failed",
      2,
      r#"{"payment_ref":"pi_0","reason":null}"#,
    )
    .await
    .unwrap();
  let mut healthy = Vec::new();
  for _ in 0..3 {
    let stream = StreamId::subscription(Uuid::new_v4());
    store
      .append(stream, 0, vec![created(creator), attached()])
      .await
      .unwrap();
    healthy.push(stream);
  }

  let report = e.projector().catch_up().await.unwrap();
  assert_eq!(report.faulted, 1);
  assert_eq!(report.applied, 8);
  assert_eq!(report.checkpoint, store.head_sequence().await.unwrap());
  let anomalies = store.open_anomalies().await.unwrap();
  assert_eq!(anomalies.len(), 1);
  assert_eq!((anomalies[0].stream, anomalies[0].sequence), (corrupted, bad));

  // Later events on the faulted stream are held back.
  store
    .append(corrupted, 3, vec![NewEvent::new(payment(creator, "pi_1"))])
    .await
    .unwrap();
  let report = e.projector().catch_up().await.unwrap();
  assert_eq!((report.quarantined, report.posted), (1, 0));

  let cancel = AtomicBool::new(false);
  let report = e
    .reconciler()
    .reconcile_all(StreamType::Subscription, "test:undecodable".into(), &cancel)
    .await
    .unwrap();
  assert!(report.is_complete());
  assert_eq!(report.job.rebuilt, 3);
  assert_eq!(report.job.failed, 1);
  assert_eq!(report.faulted[0].sequence, bad);

  for stream in healthy {
    assert_eq!(subscription_state(&e, stream).await.status, SubscriptionStatus::Created);
  }
  assert_eq!(subscription_state(&e, corrupted).await.status, SubscriptionStatus::Created);
  assert!(
    categories(&e, Utc::now())
      .await
      .contains(&ViolationCategory::StreamAnomaly)
  );
}

#[tokio::test]
async fn cancelled_reconcile_resumes_from_its_cursor() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  for _ in 0..3 {
    new_subscription(&e, creator).await;
  }
  let reconciler = e.reconciler();

  let cancel = AtomicBool::new(true);
  let stopped = reconciler
    .reconcile_all(StreamType::Subscription, "test:resume".into(), &cancel)
    .await
    .unwrap();
  assert_eq!(stopped.job.status, JobStatus::Cancelled);
  assert_eq!(stopped.job.rebuilt, 0);

  let cancel = AtomicBool::new(false);
  let finished = reconciler
    .reconcile_all(StreamType::Subscription, "test:resume".into(), &cancel)
    .await
    .unwrap();
  assert!(finished.is_complete());
  assert_eq!(finished.job.rebuilt, 3);
  assert_eq!(finished.job.started_at, stopped.job.started_at);

  let stored = e.store().load_job("test:resume".into()).await.unwrap().unwrap();
  assert_eq!(stored.status, JobStatus::Completed);
}

#[tokio::test]
async fn rebuild_all_covers_every_stream_type() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  e.ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  e.projector().catch_up().await.unwrap();

  let reports = e.reconciler().rebuild_all(&AtomicBool::new(false)).await.unwrap();
  assert_eq!(reports.len(), StreamType::ALL.len());
  assert!(reports.iter().all(|r| r.is_complete()));
  assert_eq!(reports[0].job.rebuilt, 1);
  assert_eq!(reports[1].job.rebuilt, 1);
}

#[tokio::test]
async fn repair_posts_missing_credits_once() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  e.store()
    .append(
      stream,
      0,
      vec![created(creator), attached(), NewEvent::new(payment(creator, "pi_1"))],
    )
    .await
    .unwrap();
  // Fold without the projector, so nothing posts the credit.
  for record in e.store().read_all(0, 100).await.unwrap() {
    e.store().apply_event(record).await.unwrap();
  }

  let later = Utc::now() + Duration::minutes(5);
  assert!(
    categories(&e, later)
      .await
      .contains(&ViolationCategory::PaymentWithoutLedgerEntry)
  );

  let poster = e.poster();
  assert_eq!(poster.repair(Some(creator)).await.unwrap(), 1);
  assert_eq!(poster.repair(Some(creator)).await.unwrap(), 0);

  e.projector().catch_up().await.unwrap();
  assert_eq!(wallet_balance(&e, creator).await, 920);
  assert!(categories(&e, later).await.is_empty());
}

#[tokio::test]
async fn projector_is_idempotent_from_an_old_checkpoint() {
  let e = engine().await;
  let creator = Uuid::new_v4();
  let s1 = new_subscription(&e, creator).await;
  e.ingestor()
    .ingest(delivery("evt_1", s1, payment(creator, "pi_1")))
    .await
    .unwrap();
  let projector = e.projector();
  projector.catch_up().await.unwrap();
  let before = e.store().get_projection(s1).await.unwrap();

  e.store().save_checkpoint(crate::projector::CHECKPOINT, 0).await.unwrap();
  let replayed = projector.catch_up().await.unwrap();
  assert_eq!(replayed.applied, 0);
  assert!(replayed.skipped > 0);
  assert_eq!(replayed.posted, 0);
  assert_eq!(e.store().get_projection(s1).await.unwrap(), before);
  assert_eq!(wallet_balance(&e, creator).await, 920);
}

// ─── Background loops ────────────────────────────────────────────────────────

#[tokio::test]
async fn background_loops_stop_promptly_on_shutdown() {
  let e = engine().await;
  let hour = std::time::Duration::from_secs(3600);
  let (stop, shutdown) = tokio::sync::watch::channel(false);

  let projector = e.projector();
  let projector_task = {
    let shutdown = shutdown.clone();
    tokio::spawn(async move { projector.run(shutdown, hour).await })
  };
  let evaluator = e.evaluator();
  let evaluator_task =
    tokio::spawn(async move { evaluator.run(shutdown, hour).await });

  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  stop.send_replace(true);

  let limit = std::time::Duration::from_secs(5);
  tokio::time::timeout(limit, projector_task)
    .await
    .expect("projector stopped")
    .unwrap();
  tokio::time::timeout(limit, evaluator_task)
    .await
    .expect("evaluator stopped")
    .unwrap();
}
