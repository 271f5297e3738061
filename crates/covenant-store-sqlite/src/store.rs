//! [`SqliteStore`], the SQLite implementation of [`EventStore`] and
//! [`ProjectionStore`].

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Utc};
use covenant_core::{
  delivery::{AppendRequest, DeliveryKey, DeliveryRecord, Processing},
  event::{Appended, DomainEvent, EventRecord, LogEntry, NewEvent},
  invariant::{EvaluationScope, PaymentRecord, ProjectionSnapshot, WalletSummary},
  ledger::LedgerEntry,
  projection::{self, AggregateState, Anomaly, Fault, ProjectionRow},
  store::{
    ApplyOutcome, EventStore, JobCursor, ProjectionStore, RebuildOutcome, Store,
    WalletCorrection,
  },
  stream::{StreamId, StreamType},
};
use rusqlite::{
  Connection, OptionalExtension as _, Transaction, TransactionBehavior, params,
};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    RawAnomaly, RawCorrection, RawDelivery, RawEvent, RawJob, RawLedgerEntry,
    RawPayment, RawProjection, decode_u64, decode_uuid, encode_dt, encode_entry_kind,
    encode_u64, encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// An event store and projection cache backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. All calls are
/// serialised on the connection's thread.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Overwrite a wallet's cached balance without touching its ledger, to
  /// simulate projection drift.
  #[cfg(any(test, feature = "test-support"))]
  pub async fn set_wallet_balance(
    &self,
    creator_id: Uuid,
    balance_cents: i64,
  ) -> Result<()> {
    let stream = StreamId::wallet(creator_id);
    self
      .conn
      .call(move |conn| {
        write_tx(conn, |tx| {
          let Some(mut row) = load_projection(tx, stream)? else {
            return Err(Error::Corrupt(format!("no projection for {stream}")));
          };
          if let AggregateState::Wallet(w) = &mut row.state {
            w.balance_cents = balance_cents;
          }
          write_projection(tx, &row, Utc::now())
        })
      })
      .await?
  }

  /// Append a row as-is at the stream's next version, bypassing validation,
  /// to simulate an event written by a build with a newer schema. Returns
  /// its sequence.
  #[cfg(any(test, feature = "test-support"))]
  pub async fn insert_raw_event(
    &self,
    stream: StreamId,
    event_type: &str,
    schema_version: i64,
    payload_json: &str,
  ) -> Result<u64> {
    let event_type = event_type.to_owned();
    let payload_json = payload_json.to_owned();
    self
      .conn
      .call(move |conn| {
        write_tx(conn, |tx| {
          let version = current_version(tx, stream)? + 1;
          let event_id = encode_uuid(Uuid::new_v4());
          tx.execute(
            "INSERT INTO events (
               event_id, stream_type, stream_id, stream_version, event_type,
               schema_version, payload_json, occurred_at, causation_id,
               correlation_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?1, ?1)",
            params![
              event_id,
              stream.stream_type.as_str(),
              encode_uuid(stream.id),
              encode_u64(version)?,
              event_type,
              schema_version,
              payload_json,
              encode_dt(Utc::now()),
            ],
          )?;
          decode_u64(tx.last_insert_rowid())
        })
      })
      .await?
  }

  /// Delete an aggregate's projection row, as if it had never been built.
  #[cfg(any(test, feature = "test-support"))]
  pub async fn drop_projection(&self, stream: StreamId) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM projections WHERE stream_type = ?1 AND stream_id = ?2",
          params![stream.stream_type.as_str(), encode_uuid(stream.id)],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Transaction plumbing ────────────────────────────────────────────────────

/// Run `f` inside `BEGIN IMMEDIATE`, committing only if it returns `Ok`.
///
/// Domain errors come back in the inner `Result` so the connection-level
/// error stays reserved for SQLite failures.
fn write_tx<T>(
  conn: &mut Connection,
  f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> tokio_rusqlite::Result<Result<T>> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  match f(&tx) {
    Ok(value) => {
      tx.commit()?;
      Ok(Ok(value))
    }
    Err(e) => Ok(Err(e)),
  }
}

/// Run `f` inside a deferred transaction, giving it one consistent view.
fn read_tx<T>(
  conn: &mut Connection,
  f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> tokio_rusqlite::Result<Result<T>> {
  let tx = conn.transaction()?;
  let out = f(&tx);
  tx.finish()?;
  Ok(out)
}

// ─── Events ──────────────────────────────────────────────────────────────────

fn current_version(conn: &Connection, stream: StreamId) -> Result<u64> {
  let version: i64 = conn.query_row(
    "SELECT COALESCE(MAX(stream_version), 0) FROM events
     WHERE stream_type = ?1 AND stream_id = ?2",
    params![stream.stream_type.as_str(), encode_uuid(stream.id)],
    |r| r.get(0),
  )?;
  decode_u64(version)
}

fn insert_events(
  conn: &Connection,
  stream: StreamId,
  expected_version: u64,
  events: Vec<NewEvent>,
  now: DateTime<Utc>,
) -> Result<Appended> {
  if events.is_empty() {
    return Err(covenant_core::Error::Validation("nothing to append".into()).into());
  }
  for new in &events {
    new.event.validate(&stream)?;
  }

  let actual = current_version(conn, stream)?;
  if actual != expected_version {
    return Err(
      covenant_core::Error::ConcurrencyConflict {
        stream,
        expected: expected_version,
        actual,
      }
      .into(),
    );
  }

  let mut stmt = conn.prepare_cached(
    "INSERT INTO events (
       event_id, stream_type, stream_id, stream_version, event_type,
       schema_version, payload_json, occurred_at, causation_id, correlation_id
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
  )?;

  let mut records = Vec::with_capacity(events.len());
  for (offset, new) in events.into_iter().enumerate() {
    let event_id = Uuid::new_v4();
    let causation_id = new.causation_id.unwrap_or(event_id);
    let correlation_id = new.correlation_id.unwrap_or(causation_id);
    let stream_version = expected_version + offset as u64 + 1;
    let schema_version = covenant_core::event::CURRENT_SCHEMA_VERSION;

    stmt.execute(params![
      encode_uuid(event_id),
      stream.stream_type.as_str(),
      encode_uuid(stream.id),
      encode_u64(stream_version)?,
      new.event.event_type(),
      schema_version,
      new.event.to_json()?.to_string(),
      encode_dt(now),
      encode_uuid(causation_id),
      encode_uuid(correlation_id),
    ])?;

    records.push(EventRecord {
      sequence: decode_u64(conn.last_insert_rowid())?,
      event_id,
      stream,
      stream_version,
      schema_version,
      event: new.event,
      occurred_at: now,
      causation_id,
      correlation_id,
    });
  }

  Ok(Appended {
    stream,
    new_version: expected_version + records.len() as u64,
    events: records,
  })
}

fn query_stream(
  conn: &Connection,
  stream: StreamId,
  from_version: u64,
) -> Result<Vec<RawEvent>> {
  let sql = format!(
    "SELECT {} FROM events
     WHERE stream_type = ?1 AND stream_id = ?2 AND stream_version >= ?3
     ORDER BY stream_version",
    RawEvent::COLUMNS
  );
  let mut stmt = conn.prepare_cached(&sql)?;
  let rows = stmt
    .query_map(
      params![
        stream.stream_type.as_str(),
        encode_uuid(stream.id),
        encode_u64(from_version)?
      ],
      RawEvent::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

fn query_log(conn: &Connection, after: u64, limit: usize) -> Result<Vec<RawEvent>> {
  let sql = format!(
    "SELECT {} FROM events WHERE sequence > ?1 ORDER BY sequence LIMIT ?2",
    RawEvent::COLUMNS
  );
  let mut stmt = conn.prepare_cached(&sql)?;
  let rows = stmt
    .query_map(
      params![encode_u64(after)?, encode_u64(limit as u64)?],
      RawEvent::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

fn decode_events(raws: Vec<RawEvent>) -> Result<Vec<EventRecord>> {
  raws.iter().map(RawEvent::decode).collect()
}

/// Decode a stream's rows up to the first one that fails, which comes back
/// as the fault to halt the fold at.
fn decode_prefix(raws: Vec<RawEvent>) -> (Vec<EventRecord>, Option<Fault>) {
  let mut events = Vec::with_capacity(raws.len());
  for raw in &raws {
    match raw.decode() {
      Ok(record) => events.push(record),
      Err(e) => return (events, Some(Fault::undecodable(&raw.undecodable(&e)))),
    }
  }
  (events, None)
}

// ─── Deliveries ──────────────────────────────────────────────────────────────

fn query_delivery(conn: &Connection, key: &str) -> Result<Option<RawDelivery>> {
  let sql = format!(
    "SELECT {} FROM deliveries WHERE delivery_key = ?1",
    RawDelivery::COLUMNS
  );
  Ok(
    conn
      .query_row(&sql, params![key], RawDelivery::from_row)
      .optional()?,
  )
}

fn insert_delivery(conn: &Connection, record: &DeliveryRecord) -> Result<()> {
  conn.execute(
    "INSERT INTO deliveries (
       delivery_key, stream_type, stream_id, stream_version, sequences,
       fingerprint, processed_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    params![
      record.delivery_key.as_str(),
      record.stream.stream_type.as_str(),
      encode_uuid(record.stream.id),
      encode_u64(record.stream_version)?,
      serde_json::to_string(&record.sequences)?,
      record.fingerprint,
      encode_dt(record.processed_at),
    ],
  )?;
  Ok(())
}

fn process_delivery(
  conn: &Connection,
  key: DeliveryKey,
  request: AppendRequest,
  now: DateTime<Utc>,
) -> Result<Processing> {
  if let Some(raw) = query_delivery(conn, key.as_str())? {
    return Ok(Processing::AlreadyProcessed(raw.into_record()?));
  }

  let appended = insert_events(
    conn,
    request.stream,
    request.expected_version,
    request.events,
    now,
  )?;
  let record = DeliveryRecord {
    delivery_key:   key,
    stream:         appended.stream,
    stream_version: appended.new_version,
    sequences:      appended.sequences(),
    fingerprint:    request.fingerprint,
    processed_at:   now,
  };
  insert_delivery(conn, &record)?;

  Ok(Processing::Accepted { record, appended })
}

// ─── Projections ─────────────────────────────────────────────────────────────

fn load_projection(
  conn: &Connection,
  stream: StreamId,
) -> Result<Option<ProjectionRow>> {
  let sql = format!(
    "SELECT {} FROM projections WHERE stream_type = ?1 AND stream_id = ?2",
    RawProjection::COLUMNS
  );
  conn
    .query_row(
      &sql,
      params![stream.stream_type.as_str(), encode_uuid(stream.id)],
      RawProjection::from_row,
    )
    .optional()?
    .map(RawProjection::into_row)
    .transpose()
}

fn write_projection(
  conn: &Connection,
  row: &ProjectionRow,
  now: DateTime<Utc>,
) -> Result<()> {
  conn.execute(
    "INSERT INTO projections (
       stream_type, stream_id, version, watermark, state_json, status,
       creator_id, updated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT (stream_type, stream_id) DO UPDATE SET
       version    = excluded.version,
       watermark  = excluded.watermark,
       state_json = excluded.state_json,
       status     = excluded.status,
       creator_id = excluded.creator_id,
       updated_at = excluded.updated_at",
    params![
      row.stream.stream_type.as_str(),
      encode_uuid(row.stream.id),
      encode_u64(row.version)?,
      encode_u64(row.watermark)?,
      serde_json::to_string(&row.state)?,
      row.state.status_label(),
      encode_uuid(row.state.creator_id()),
      encode_dt(now),
    ],
  )?;
  Ok(())
}

fn delete_projection(conn: &Connection, stream: StreamId) -> Result<()> {
  conn.execute(
    "DELETE FROM projections WHERE stream_type = ?1 AND stream_id = ?2",
    params![stream.stream_type.as_str(), encode_uuid(stream.id)],
  )?;
  Ok(())
}

fn has_open_anomaly(conn: &Connection, stream: StreamId) -> Result<bool> {
  let open: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM projection_anomalies
       WHERE stream_type = ?1 AND stream_id = ?2 AND resolved_at IS NULL
       LIMIT 1",
      params![stream.stream_type.as_str(), encode_uuid(stream.id)],
      |r| r.get(0),
    )
    .optional()?;
  Ok(open.is_some())
}

fn record_anomaly(conn: &Connection, anomaly: &Anomaly) -> Result<()> {
  conn.execute(
    "INSERT INTO projection_anomalies (
       stream_type, stream_id, sequence, stream_version, event_type, reason,
       detected_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT (stream_type, stream_id, sequence) DO UPDATE SET
       reason      = excluded.reason,
       resolved_at = NULL",
    params![
      anomaly.stream.stream_type.as_str(),
      encode_uuid(anomaly.stream.id),
      encode_u64(anomaly.sequence)?,
      encode_u64(anomaly.stream_version)?,
      anomaly.event_type,
      anomaly.reason,
      encode_dt(anomaly.detected_at),
    ],
  )?;
  Ok(())
}

fn resolve_anomalies(
  conn: &Connection,
  stream: StreamId,
  now: DateTime<Utc>,
) -> Result<()> {
  conn.execute(
    "UPDATE projection_anomalies SET resolved_at = ?3
     WHERE stream_type = ?1 AND stream_id = ?2 AND resolved_at IS NULL",
    params![
      stream.stream_type.as_str(),
      encode_uuid(stream.id),
      encode_dt(now)
    ],
  )?;
  Ok(())
}

/// Record a folded `payment_succeeded` event in the payments view.
/// Idempotent.
fn insert_payment(conn: &Connection, record: &EventRecord) -> Result<()> {
  let DomainEvent::PaymentSucceeded(payment) = &record.event else {
    return Ok(());
  };
  conn.execute(
    "INSERT OR IGNORE INTO payments (
       sequence, subscription_id, creator_id, payment_ref, amount_cents,
       currency, occurred_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    params![
      encode_u64(record.sequence)?,
      encode_uuid(record.stream.id),
      encode_uuid(payment.creator_id),
      payment.payment_ref,
      payment.amount_cents,
      payment.currency,
      encode_dt(record.occurred_at),
    ],
  )?;
  Ok(())
}

/// Record the ledger entry carried by a wallet event. Idempotent.
fn insert_ledger_entry(conn: &Connection, record: &EventRecord) -> Result<()> {
  let Some(entry) = LedgerEntry::from_record(record) else {
    return Ok(());
  };
  conn.execute(
    "INSERT OR IGNORE INTO ledger_entries (
       sequence, creator_id, kind, amount_cents, delta_cents,
       payment_sequence, reference, recorded_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    params![
      encode_u64(entry.sequence)?,
      encode_uuid(entry.creator_id),
      encode_entry_kind(entry.kind),
      entry.amount_cents,
      entry.delta_cents,
      entry.payment_sequence.map(encode_u64).transpose()?,
      entry.reference,
      encode_dt(entry.recorded_at),
    ],
  )?;
  Ok(())
}

fn apply_in_tx(
  conn: &Connection,
  record: &EventRecord,
  now: DateTime<Utc>,
) -> Result<ApplyOutcome> {
  let stream = record.stream;
  let row = load_projection(conn, stream)?;
  if !projection::should_apply(row.as_ref(), record) {
    let watermark = row.map_or(0, |r| r.watermark);
    return Ok(ApplyOutcome::Skipped { watermark });
  }
  if has_open_anomaly(conn, stream)? {
    return Ok(ApplyOutcome::Quarantined);
  }

  match projection::apply(row, record) {
    Ok(next) => {
      write_projection(conn, &next, now)?;
      insert_payment(conn, record)?;
      insert_ledger_entry(conn, record)?;
      Ok(ApplyOutcome::Applied(next))
    }
    Err(e) if e.is_fold_defect() => {
      let anomaly = Fault::new(record, &e).detected(stream, now);
      record_anomaly(conn, &anomaly)?;
      Ok(ApplyOutcome::Faulted(anomaly))
    }
    Err(e) => Err(e.into()),
  }
}

fn rebuild_in_tx(
  conn: &Connection,
  stream: StreamId,
  now: DateTime<Utc>,
) -> Result<RebuildOutcome> {
  let previous = load_projection(conn, stream)?;
  let (events, undecodable) = decode_prefix(query_stream(conn, stream, 1)?);
  let mut replay = projection::replay(&events);
  if replay.fault.is_none() {
    replay.fault = undecodable;
  }

  match &replay.row {
    Some(row) => write_projection(conn, row, now)?,
    None => delete_projection(conn, stream)?,
  }

  let folded = &events[..replay.replayed as usize];
  match stream.stream_type {
    StreamType::Wallet => {
      conn.execute(
        "DELETE FROM ledger_entries WHERE creator_id = ?1",
        params![encode_uuid(stream.id)],
      )?;
      for record in folded {
        insert_ledger_entry(conn, record)?;
      }
    }
    StreamType::Subscription => {
      conn.execute(
        "DELETE FROM payments WHERE subscription_id = ?1",
        params![encode_uuid(stream.id)],
      )?;
      for record in folded {
        insert_payment(conn, record)?;
      }
    }
    StreamType::Membership => {}
  }

  resolve_anomalies(conn, stream, now)?;
  let anomaly = replay.fault.map(|f| f.detected(stream, now));
  if let Some(anomaly) = &anomaly {
    record_anomaly(conn, anomaly)?;
  }

  Ok(RebuildOutcome {
    stream,
    previous,
    current: replay.row,
    replayed: replay.replayed,
    anomaly,
  })
}

fn snapshot_in_tx(
  conn: &Connection,
  creator_id: Option<Uuid>,
) -> Result<ProjectionSnapshot> {
  let creator = creator_id.map(encode_uuid);

  let sql = format!(
    "SELECT {} FROM projections
     WHERE ?1 IS NULL OR creator_id = ?1
     ORDER BY stream_type, stream_id",
    RawProjection::COLUMNS
  );
  let rows = conn
    .prepare(&sql)?
    .query_map(params![creator], RawProjection::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut sums: HashMap<String, (i64, i64)> = HashMap::new();
  {
    let mut stmt = conn.prepare(
      "SELECT creator_id, COALESCE(SUM(delta_cents), 0), COUNT(*)
       FROM ledger_entries
       WHERE ?1 IS NULL OR creator_id = ?1
       GROUP BY creator_id",
    )?;
    let mut q = stmt.query(params![creator])?;
    while let Some(r) = q.next()? {
      sums.insert(r.get(0)?, (r.get(1)?, r.get(2)?));
    }
  }

  let mut snapshot = ProjectionSnapshot::default();
  for raw in rows {
    match raw.into_row()?.state {
      AggregateState::Subscription(s) => snapshot.subscriptions.push(s),
      AggregateState::Membership(m) => snapshot.memberships.push(m),
      AggregateState::Wallet(w) => {
        let (sum, count) =
          sums.get(&encode_uuid(w.creator_id)).copied().unwrap_or((0, 0));
        snapshot.wallets.push(WalletSummary {
          wallet:           w,
          ledger_sum_cents: sum,
          ledger_entries:   decode_u64(count)?,
        });
      }
    }
  }

  snapshot.payments = conn
    .prepare(
      "SELECT p.sequence, p.subscription_id, p.creator_id, p.payment_ref,
              p.amount_cents, p.occurred_at,
              (SELECT MIN(l.sequence) FROM ledger_entries l
               WHERE l.payment_sequence = p.sequence)
       FROM payments p
       WHERE ?1 IS NULL OR p.creator_id = ?1
       ORDER BY p.sequence",
    )?
    .query_map(params![creator], RawPayment::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawPayment::into_payment)
    .collect::<Result<Vec<PaymentRecord>>>()?;

  snapshot.anomalies = query_open_anomalies(conn)?;
  Ok(snapshot)
}

fn query_open_anomalies(conn: &Connection) -> Result<Vec<Anomaly>> {
  let sql = format!(
    "SELECT {} FROM projection_anomalies
     WHERE resolved_at IS NULL
     ORDER BY sequence",
    RawAnomaly::COLUMNS
  );
  conn
    .prepare(&sql)?
    .query_map([], RawAnomaly::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawAnomaly::into_anomaly)
    .collect()
}

// ─── Trait impls ─────────────────────────────────────────────────────────────

impl Store for SqliteStore {
  type Error = Error;

  async fn ping(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

impl EventStore for SqliteStore {
  async fn append(
    &self,
    stream: StreamId,
    expected_version: u64,
    events: Vec<NewEvent>,
  ) -> Result<Appended> {
    let now = Utc::now();
    self
      .conn
      .call(move |conn| {
        write_tx(conn, |tx| {
          insert_events(tx, stream, expected_version, events, now)
        })
      })
      .await?
  }

  async fn read_stream(
    &self,
    stream: StreamId,
    from_version: u64,
  ) -> Result<Vec<EventRecord>> {
    let raws = self
      .conn
      .call(move |conn| Ok(query_stream(conn, stream, from_version)))
      .await??;
    decode_events(raws)
  }

  async fn read_all(&self, after: u64, limit: usize) -> Result<Vec<EventRecord>> {
    let raws = self
      .conn
      .call(move |conn| Ok(query_log(conn, after, limit)))
      .await??;
    decode_events(raws)
  }

  async fn read_log(&self, after: u64, limit: usize) -> Result<Vec<LogEntry>> {
    let raws = self
      .conn
      .call(move |conn| Ok(query_log(conn, after, limit)))
      .await??;
    Ok(raws.into_iter().map(RawEvent::into_entry).collect())
  }

  async fn read_event(&self, sequence: u64) -> Result<Option<EventRecord>> {
    let sequence = encode_u64(sequence)?;
    let raw: Option<RawEvent> = self
      .conn
      .call(move |conn| {
        let sql =
          format!("SELECT {} FROM events WHERE sequence = ?1", RawEvent::COLUMNS);
        Ok(
          conn
            .query_row(&sql, params![sequence], RawEvent::from_row)
            .optional()?,
        )
      })
      .await?;
    raw.as_ref().map(RawEvent::decode).transpose()
  }

  async fn stream_version(&self, stream: StreamId) -> Result<u64> {
    self
      .conn
      .call(move |conn| Ok(current_version(conn, stream)))
      .await?
  }

  async fn head_sequence(&self) -> Result<u64> {
    let head: i64 = self
      .conn
      .call(|conn| {
        Ok(conn.query_row(
          "SELECT COALESCE(MAX(sequence), 0) FROM events",
          [],
          |r| r.get(0),
        )?)
      })
      .await?;
    decode_u64(head)
  }

  async fn list_streams(
    &self,
    stream_type: StreamType,
    after: Option<Uuid>,
    limit: usize,
  ) -> Result<Vec<Uuid>> {
    // Hyphenated lowercase hex sorts in the same order as `Uuid`.
    let after = after.map(encode_uuid).unwrap_or_default();
    let limit = encode_u64(limit as u64)?;
    let ids: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT DISTINCT stream_id FROM events
           WHERE stream_type = ?1 AND stream_id > ?2
           ORDER BY stream_id
           LIMIT ?3",
        )?;
        let rows = stmt
          .query_map(params![stream_type.as_str(), after, limit], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    ids.iter().map(|s| decode_uuid(s)).collect()
  }

  async fn begin_processing(
    &self,
    key: DeliveryKey,
    request: AppendRequest,
  ) -> Result<Processing> {
    let now = Utc::now();
    self
      .conn
      .call(move |conn| {
        write_tx(conn, |tx| process_delivery(tx, key, request, now))
      })
      .await?
  }

  async fn find_delivery(&self, key: DeliveryKey) -> Result<Option<DeliveryRecord>> {
    let raw = self
      .conn
      .call(move |conn| Ok(query_delivery(conn, key.as_str())))
      .await??;
    raw.map(RawDelivery::into_record).transpose()
  }
}

impl ProjectionStore for SqliteStore {
  async fn apply_event(&self, record: EventRecord) -> Result<ApplyOutcome> {
    let now = Utc::now();
    self
      .conn
      .call(move |conn| write_tx(conn, |tx| apply_in_tx(tx, &record, now)))
      .await?
  }

  async fn rebuild_projection(&self, stream: StreamId) -> Result<RebuildOutcome> {
    let now = Utc::now();
    self
      .conn
      .call(move |conn| write_tx(conn, |tx| rebuild_in_tx(tx, stream, now)))
      .await?
  }

  async fn get_projection(&self, stream: StreamId) -> Result<Option<ProjectionRow>> {
    self
      .conn
      .call(move |conn| Ok(load_projection(conn, stream)))
      .await?
  }

  async fn load_checkpoint(&self, name: &'static str) -> Result<u64> {
    let sequence: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT sequence FROM projection_checkpoints WHERE name = ?1",
              params![name],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    sequence.map_or(Ok(0), decode_u64)
  }

  async fn save_checkpoint(&self, name: &'static str, sequence: u64) -> Result<()> {
    let sequence = encode_u64(sequence)?;
    let at = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO projection_checkpoints (name, sequence, updated_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT (name) DO UPDATE SET
             sequence   = excluded.sequence,
             updated_at = excluded.updated_at",
          params![name, sequence, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn snapshot(&self, scope: EvaluationScope) -> Result<ProjectionSnapshot> {
    self
      .conn
      .call(move |conn| {
        read_tx(conn, |tx| snapshot_in_tx(tx, scope.creator_id))
      })
      .await?
  }

  async fn ledger_entries(&self, creator_id: Uuid) -> Result<Vec<LedgerEntry>> {
    let id_str = encode_uuid(creator_id);
    let raws: Vec<RawLedgerEntry> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {} FROM ledger_entries WHERE creator_id = ?1 ORDER BY sequence",
          RawLedgerEntry::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(params![id_str], RawLedgerEntry::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawLedgerEntry::into_entry).collect()
  }

  async fn record_correction(&self, correction: WalletCorrection) -> Result<()> {
    let entry_count = encode_u64(correction.entry_count)?;
    let watermark = encode_u64(correction.watermark)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO wallet_corrections (
             correction_id, creator_id, previous_balance, corrected_balance,
             entry_count, watermark, corrected_at, reason
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          params![
            encode_uuid(correction.correction_id),
            encode_uuid(correction.creator_id),
            correction.previous_balance,
            correction.corrected_balance,
            entry_count,
            watermark,
            encode_dt(correction.corrected_at),
            correction.reason,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn corrections(&self, creator_id: Uuid) -> Result<Vec<WalletCorrection>> {
    let id_str = encode_uuid(creator_id);
    let raws: Vec<RawCorrection> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT correction_id, creator_id, previous_balance,
                  corrected_balance, entry_count, watermark, corrected_at,
                  reason
           FROM wallet_corrections
           WHERE creator_id = ?1
           ORDER BY corrected_at, rowid",
        )?;
        let rows = stmt
          .query_map(params![id_str], RawCorrection::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawCorrection::into_correction).collect()
  }

  async fn quarantine(&self, anomaly: Anomaly) -> Result<()> {
    self
      .conn
      .call(move |conn| write_tx(conn, |tx| record_anomaly(tx, &anomaly)))
      .await?
  }

  async fn open_anomalies(&self) -> Result<Vec<Anomaly>> {
    self
      .conn
      .call(|conn| Ok(query_open_anomalies(conn)))
      .await?
  }

  async fn load_job(&self, job_name: String) -> Result<Option<JobCursor>> {
    let raw: Option<RawJob> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT job_name, stream_type, last_id, rebuilt, failed, status,
                      started_at, updated_at
               FROM reconcile_jobs WHERE job_name = ?1",
              params![job_name],
              |r| {
                Ok(RawJob {
                  job_name:    r.get(0)?,
                  stream_type: r.get(1)?,
                  last_id:     r.get(2)?,
                  rebuilt:     r.get(3)?,
                  failed:      r.get(4)?,
                  status:      r.get(5)?,
                  started_at:  r.get(6)?,
                  updated_at:  r.get(7)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawJob::into_cursor).transpose()
  }

  async fn save_job(&self, cursor: JobCursor) -> Result<()> {
    let rebuilt = encode_u64(cursor.rebuilt)?;
    let failed = encode_u64(cursor.failed)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO reconcile_jobs (
             job_name, stream_type, last_id, rebuilt, failed, status,
             started_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
           ON CONFLICT (job_name) DO UPDATE SET
             stream_type = excluded.stream_type,
             last_id     = excluded.last_id,
             rebuilt     = excluded.rebuilt,
             failed      = excluded.failed,
             status      = excluded.status,
             started_at  = excluded.started_at,
             updated_at  = excluded.updated_at",
          params![
            cursor.job_name,
            cursor.stream_type.as_str(),
            cursor.last_id.map(encode_uuid),
            rebuilt,
            failed,
            cursor.status.as_str(),
            encode_dt(cursor.started_at),
            encode_dt(cursor.updated_at),
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
