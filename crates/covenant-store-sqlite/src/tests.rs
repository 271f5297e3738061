//! Integration tests for `SqliteStore` against an in-memory database.

use covenant_core::{
  delivery::{AppendRequest, DeliveryKey, Processing},
  event::{
    DomainEvent, GracePeriodElapsed, LedgerCredited, LogEntry, NewEvent,
    PaymentSucceeded, PayoutIssued, SubscriptionCreated,
  },
  invariant::EvaluationScope,
  projection,
  store::{ApplyOutcome, EventStore, JobCursor, JobStatus, ProjectionStore, StoreError},
  stream::{StreamId, StreamType},
  subscription::SubscriptionStatus,
};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
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

fn paid(creator_id: Uuid, payment_ref: &str) -> NewEvent {
  NewEvent::new(DomainEvent::PaymentSucceeded(PaymentSucceeded {
    payment_ref: payment_ref.into(),
    creator_id,
    amount_cents: 1000,
    currency: "USD".into(),
  }))
}

fn credited(payment_sequence: u64, net_cents: i64) -> NewEvent {
  NewEvent::new(DomainEvent::LedgerCredited(LedgerCredited {
    payment_sequence,
    subscription_id: Uuid::new_v4(),
    payment_ref: format!("pi_{payment_sequence}"),
    gross_cents: net_cents + 80,
    fee_cents: 80,
    net_cents,
  }))
}

/// Apply every event in the log, in order.
async fn project_all(s: &SqliteStore) {
  for record in s.read_all(0, 1000).await.unwrap() {
    s.apply_event(record).await.unwrap();
  }
}

// ─── Append ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn append_assigns_versions_and_sequences() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());

  let first = s.append(stream, 0, vec![created(creator)]).await.unwrap();
  assert_eq!(first.new_version, 1);

  let second = s
    .append(stream, 1, vec![paid(creator, "pi_1"), paid(creator, "pi_2")])
    .await
    .unwrap();
  assert_eq!(second.new_version, 3);
  assert_eq!(
    second.events.iter().map(|e| e.stream_version).collect::<Vec<_>>(),
    vec![2, 3]
  );
  assert!(second.sequences().windows(2).all(|w| w[0] < w[1]));

  let events = s.read_stream(stream, 1).await.unwrap();
  assert_eq!(events.len(), 3);
  assert_eq!(events[1..], second.events[..]);
  assert_eq!(s.stream_version(stream).await.unwrap(), 3);
  assert_eq!(s.head_sequence().await.unwrap(), events[2].sequence);
}

#[tokio::test]
async fn stale_expected_version_conflicts_and_appends_nothing() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  s.append(stream, 0, vec![created(creator)]).await.unwrap();

  let err = s.append(stream, 0, vec![paid(creator, "pi_1")]).await.unwrap_err();
  assert!(err.is_conflict());
  assert_eq!(s.stream_version(stream).await.unwrap(), 1);
}

#[tokio::test]
async fn append_rejects_foreign_and_empty_batches() {
  let s = store().await;
  let stream = StreamId::wallet(Uuid::new_v4());

  let err = s.append(stream, 0, vec![created(Uuid::new_v4())]).await.unwrap_err();
  assert!(!err.is_conflict());
  assert!(matches!(
    err.core(),
    Some(covenant_core::Error::Validation(_))
  ));

  assert!(s.append(stream, 0, vec![]).await.is_err());
  assert_eq!(s.head_sequence().await.unwrap(), 0);
}

#[tokio::test]
async fn causation_and_correlation_default_to_event_id() {
  let s = store().await;
  let stream = StreamId::subscription(Uuid::new_v4());
  let appended = s.append(stream, 0, vec![created(Uuid::new_v4())]).await.unwrap();
  let root = &appended.events[0];
  assert_eq!(root.causation_id, root.event_id);
  assert_eq!(root.correlation_id, root.event_id);

  let wallet = StreamId::wallet(Uuid::new_v4());
  let child = s
    .append(wallet, 0, vec![credited(root.sequence, 100).caused_by(root)])
    .await
    .unwrap();
  assert_eq!(child.events[0].causation_id, root.event_id);
  assert_eq!(child.events[0].correlation_id, root.correlation_id);
}

#[tokio::test]
async fn read_all_pages_by_sequence() {
  let s = store().await;
  for _ in 0..5 {
    let stream = StreamId::subscription(Uuid::new_v4());
    s.append(stream, 0, vec![created(Uuid::new_v4())]).await.unwrap();
  }
  let page = s.read_all(0, 2).await.unwrap();
  assert_eq!(page.len(), 2);
  let rest = s.read_all(page[1].sequence, 10).await.unwrap();
  assert_eq!(rest.len(), 3);
  assert!(rest[0].sequence > page[1].sequence);

  let one = s.read_event(rest[0].sequence).await.unwrap();
  assert_eq!(one.as_ref(), Some(&rest[0]));
  assert!(s.read_event(9999).await.unwrap().is_none());
}

#[tokio::test]
async fn list_streams_is_ordered_and_resumable() {
  let s = store().await;
  let mut ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
  for id in &ids {
    s.append(StreamId::subscription(*id), 0, vec![created(Uuid::new_v4())])
      .await
      .unwrap();
  }
  ids.sort();

  let first = s.list_streams(StreamType::Subscription, None, 2).await.unwrap();
  assert_eq!(first, ids[..2]);
  let rest = s
    .list_streams(StreamType::Subscription, Some(first[1]), 10)
    .await
    .unwrap();
  assert_eq!(rest, ids[2..]);
  assert!(s.list_streams(StreamType::Wallet, None, 10).await.unwrap().is_empty());
}

// ─── Deliveries ──────────────────────────────────────────────────────────────

fn request(stream: StreamId, creator: Uuid) -> AppendRequest {
  AppendRequest {
    stream,
    expected_version: 0,
    events: vec![created(creator)],
    fingerprint: Some("abc".into()),
  }
}

#[tokio::test]
async fn duplicate_delivery_returns_stored_record() {
  let s = store().await;
  let stream = StreamId::subscription(Uuid::new_v4());
  let key = DeliveryKey::new("stripe", "evt_1").unwrap();

  let first = s
    .begin_processing(key.clone(), request(stream, Uuid::new_v4()))
    .await
    .unwrap();
  assert!(first.is_accepted());

  let second = s
    .begin_processing(key.clone(), request(stream, Uuid::new_v4()))
    .await
    .unwrap();
  assert!(matches!(second, Processing::AlreadyProcessed(_)));
  assert_eq!(second.record(), first.record());
  assert_eq!(s.stream_version(stream).await.unwrap(), 1);

  let found = s.find_delivery(key).await.unwrap();
  assert_eq!(found.as_ref(), Some(first.record()));
}

#[tokio::test]
async fn concurrent_deliveries_accept_exactly_once() {
  let s = store().await;
  let stream = StreamId::subscription(Uuid::new_v4());
  let creator = Uuid::new_v4();
  let key = DeliveryKey::new("stripe", "evt_race").unwrap();

  let handles: Vec<_> = (0..16)
    .map(|_| {
      let s = s.clone();
      let key = key.clone();
      tokio::spawn(async move {
        s.begin_processing(key, request(stream, creator)).await
      })
    })
    .collect();

  let mut accepted = 0;
  let mut records = Vec::new();
  for h in handles {
    let outcome = h.await.unwrap().unwrap();
    if outcome.is_accepted() {
      accepted += 1;
    }
    records.push(outcome.record().clone());
  }
  assert_eq!(accepted, 1);
  assert!(records.windows(2).all(|w| w[0] == w[1]));
  assert_eq!(s.read_stream(stream, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_delivery_leaves_no_record() {
  let s = store().await;
  let stream = StreamId::subscription(Uuid::new_v4());
  s.append(stream, 0, vec![created(Uuid::new_v4())]).await.unwrap();
  let key = DeliveryKey::new("stripe", "evt_late").unwrap();

  let err = s
    .begin_processing(key.clone(), request(stream, Uuid::new_v4()))
    .await
    .unwrap_err();
  assert!(err.is_conflict());
  assert!(s.find_delivery(key).await.unwrap().is_none());
}

// ─── Projections ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn apply_event_is_idempotent_per_watermark() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  let appended = s
    .append(stream, 0, vec![created(creator), paid(creator, "pi_1")])
    .await
    .unwrap();

  for record in &appended.events {
    let outcome = s.apply_event(record.clone()).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Applied(_)));
  }
  let again = s.apply_event(appended.events[0].clone()).await.unwrap();
  assert_eq!(again, ApplyOutcome::Skipped { watermark: appended.events[1].sequence });

  let row = s.get_projection(stream).await.unwrap().unwrap();
  assert_eq!(row.version, 2);
  assert_eq!(row.subscription().unwrap().status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn rebuild_matches_incremental_projection() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  s.append(stream, 0, vec![created(creator), paid(creator, "pi_1")])
    .await
    .unwrap();
  project_all(&s).await;
  let incremental = s.get_projection(stream).await.unwrap();

  let outcome = s.rebuild_projection(stream).await.unwrap();
  assert_eq!(outcome.previous, incremental);
  assert_eq!(outcome.current, incremental);
  assert_eq!(outcome.replayed, 2);

  let events = s.read_stream(stream, 1).await.unwrap();
  assert_eq!(projection::replay(&events).row, incremental);
}

#[tokio::test]
async fn invalid_transition_faults_and_quarantines_aggregate() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  let elapsed = NewEvent::new(DomainEvent::GracePeriodElapsed(GracePeriodElapsed {
    grace_started_at: chrono::Utc::now(),
  }));
  s.append(
    stream,
    0,
    vec![created(creator), paid(creator, "pi_1"), elapsed, paid(creator, "pi_2")],
  )
  .await
  .unwrap();

  let events = s.read_stream(stream, 1).await.unwrap();
  let outcomes = {
    let mut out = Vec::new();
    for record in &events {
      out.push(s.apply_event(record.clone()).await.unwrap());
    }
    out
  };
  assert!(matches!(outcomes[2], ApplyOutcome::Faulted(_)));
  assert_eq!(outcomes[3], ApplyOutcome::Quarantined);

  let row = s.get_projection(stream).await.unwrap().unwrap();
  assert_eq!(row.version, 2);
  let anomalies = s.open_anomalies().await.unwrap();
  assert_eq!(anomalies.len(), 1);
  assert_eq!(anomalies[0].stream, stream);
  assert_eq!(anomalies[0].stream_version, 3);

  let rebuilt = s.rebuild_projection(stream).await.unwrap();
  assert!(rebuilt.is_faulted());
  assert_eq!(rebuilt.current.as_ref().map(|r| r.version), Some(2));
  assert_eq!(s.open_anomalies().await.unwrap().len(), 1);

  // Only the payment folded before the fault is in the payments view.
  let snapshot = s.snapshot(EvaluationScope::all()).await.unwrap();
  let refs: Vec<_> = snapshot.payments.iter().map(|p| p.payment_ref.as_str()).collect();
  assert_eq!(refs, ["pi_1"]);
}

#[tokio::test]
async fn undecodable_rows_fault_their_stream_only() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let healthy = StreamId::subscription(Uuid::new_v4());
  let broken = StreamId::subscription(Uuid::new_v4());
  s.append(broken, 0, vec![created(creator)]).await.unwrap();
  let bad = s
    .insert_raw_event(
      broken,
      "payment_failed",
      2,
      r#"{"payment_ref":"pi_x","reason":null,"retry_at":"soon"}"#,
    )
    .await
    .unwrap();
  s.append(healthy, 0, vec![created(creator)]).await.unwrap();

  let err = s.read_all(0, 100).await.unwrap_err();
  assert!(err.core().is_some_and(|e| e.is_decode_failure()));
  assert!(s.read_stream(broken, 1).await.is_err());
  assert_eq!(s.read_stream(healthy, 1).await.unwrap().len(), 1);

  let log = s.read_log(0, 100).await.unwrap();
  assert_eq!(log.len(), 3);
  let LogEntry::Undecodable(entry) = &log[1] else {
    panic!("expected an undecodable entry, got {:?}", log[1]);
  };
  assert_eq!(entry.sequence, bad);
  assert_eq!(entry.stream, Some(broken));
  assert_eq!(entry.stream_version, 2);
  assert_eq!(entry.event_type, "payment_failed");
  assert!(matches!(log[2], LogEntry::Event(_)));

  let rebuilt = s.rebuild_projection(broken).await.unwrap();
  assert_eq!(rebuilt.replayed, 1);
  assert_eq!(rebuilt.current.as_ref().map(|r| r.version), Some(1));
  let anomaly = rebuilt.anomaly.unwrap();
  assert_eq!((anomaly.sequence, anomaly.stream_version), (bad, 2));
  assert!(anomaly.reason.contains("schema version 2"));
  assert_eq!(s.open_anomalies().await.unwrap(), vec![anomaly]);

  let rebuilt = s.rebuild_projection(healthy).await.unwrap();
  assert!(!rebuilt.is_faulted());
}

#[tokio::test]
async fn wallet_rebuild_repairs_drift_and_ledger_view() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let wallet = StreamId::wallet(creator);
  let payout = NewEvent::new(DomainEvent::PayoutIssued(PayoutIssued {
    payout_ref: "po_1".into(),
    amount_cents: 300,
  }));
  s.append(wallet, 0, vec![credited(1, 920), credited(2, 920), payout])
    .await
    .unwrap();
  project_all(&s).await;

  let entries = s.ledger_entries(creator).await.unwrap();
  assert_eq!(entries.iter().map(|e| e.delta_cents).sum::<i64>(), 1540);

  s.set_wallet_balance(creator, 7).await.unwrap();
  let snapshot = s.snapshot(EvaluationScope::for_creator(creator)).await.unwrap();
  assert_eq!(snapshot.wallets[0].wallet.balance_cents, 7);
  assert_eq!(snapshot.wallets[0].ledger_sum_cents, 1540);

  let outcome = s.rebuild_projection(wallet).await.unwrap();
  assert_eq!(outcome.previous.unwrap().wallet().unwrap().balance_cents, 7);
  assert_eq!(outcome.current.unwrap().wallet().unwrap().balance_cents, 1540);
  assert_eq!(s.ledger_entries(creator).await.unwrap(), entries);
}

#[tokio::test]
async fn snapshot_marks_unposted_payments() {
  let s = store().await;
  let creator = Uuid::new_v4();
  let stream = StreamId::subscription(Uuid::new_v4());
  let appended = s
    .append(stream, 0, vec![created(creator), paid(creator, "pi_1"), paid(creator, "pi_2")])
    .await
    .unwrap();
  let first_payment = appended.events[1].sequence;
  s.append(StreamId::wallet(creator), 0, vec![credited(first_payment, 920)])
    .await
    .unwrap();
  project_all(&s).await;

  let snapshot = s.snapshot(EvaluationScope::all()).await.unwrap();
  assert_eq!(snapshot.payments.len(), 2);
  assert!(snapshot.payments[0].ledger_sequence.is_some());
  assert!(snapshot.payments[1].ledger_sequence.is_none());
  assert_eq!(snapshot.subscriptions.len(), 1);
  assert_eq!(snapshot.wallets.len(), 1);

  let other = s.snapshot(EvaluationScope::for_creator(Uuid::new_v4())).await.unwrap();
  assert!(other.payments.is_empty() && other.subscriptions.is_empty());
}

// ─── Bookkeeping ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn checkpoints_default_to_zero() {
  let s = store().await;
  assert_eq!(s.load_checkpoint("main").await.unwrap(), 0);
  s.save_checkpoint("main", 42).await.unwrap();
  s.save_checkpoint("main", 43).await.unwrap();
  assert_eq!(s.load_checkpoint("main").await.unwrap(), 43);
}

#[tokio::test]
async fn job_cursor_round_trips() {
  let s = store().await;
  assert!(s.load_job("rebuild:wallet".into()).await.unwrap().is_none());

  let mut cursor =
    JobCursor::start("rebuild:wallet", StreamType::Wallet, chrono::Utc::now());
  cursor.last_id = Some(Uuid::new_v4());
  cursor.rebuilt = 3;
  s.save_job(cursor.clone()).await.unwrap();

  cursor.status = JobStatus::Completed;
  s.save_job(cursor.clone()).await.unwrap();
  let loaded = s.load_job("rebuild:wallet".into()).await.unwrap().unwrap();
  assert_eq!(loaded.status, JobStatus::Completed);
  assert_eq!(loaded.last_id, cursor.last_id);
  assert_eq!(loaded.rebuilt, 3);
}
