//! Direct appends of first-party commands.
//!
//! Only event types that move no money may be appended this way. Payments
//! arrive through webhook ingestion, ledger credits through the poster and
//! grace expiry through the sweeper. Every accepted batch is folded onto the
//! aggregate's current state before it is written.

use std::sync::Arc;

use chrono::Utc;
use covenant_core::{
  Error,
  event::{Appended, CURRENT_SCHEMA_VERSION, DomainEvent, EventRecord, NewEvent},
  projection,
  store::EventStore,
  stream::StreamId,
};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Event types accepted by [`CommandHandler::append`].
pub const COMMAND_TYPES: &[&str] = &[
  "subscription_created",
  "payment_method_attached",
  "payment_method_detached",
  "cancellation_requested",
  "wallet_opened",
  "entitlement_granted",
  "entitlement_revoked",
];

pub struct CommandHandler<S> {
  store: Arc<S>,
}

impl<S: EventStore> CommandHandler<S> {
  pub fn new(store: Arc<S>) -> Self { Self { store } }

  /// Append `events` to `stream` at `expected_version`, refusing event types
  /// outside [`COMMAND_TYPES`] and any event the aggregate would reject.
  pub async fn append(
    &self,
    stream: StreamId,
    expected_version: u64,
    events: Vec<NewEvent>,
  ) -> Result<Appended, S::Error> {
    for new in &events {
      let event_type = new.event.event_type();
      if !COMMAND_TYPES.contains(&event_type) {
        return Err(EngineError::Core(Error::Validation(format!(
          "{event_type} cannot be appended directly"
        ))));
      }
      new.event.validate(&stream).map_err(EngineError::Core)?;
    }

    let history = self.store.read_stream(stream, 1).await?;
    let actual = history.last().map_or(0, |e| e.stream_version);
    if actual != expected_version {
      return Err(EngineError::Core(Error::ConcurrencyConflict {
        stream,
        expected: expected_version,
        actual,
      }));
    }
    check_transitions(&history, stream, events.iter().map(|n| &n.event))
      .map_err(EngineError::Core)?;

    let appended = self.store.append(stream, expected_version, events).await?;
    info!(
      stream = %stream,
      new_version = appended.new_version,
      count = appended.events.len(),
      "command appended"
    );
    Ok(appended)
  }
}

/// Fold `history` and then `events` as if they were appended now, so an
/// invalid transition is refused before anything is written.
pub(crate) fn check_transitions<'a>(
  history: &[EventRecord],
  stream: StreamId,
  events: impl IntoIterator<Item = &'a DomainEvent>,
) -> covenant_core::Result<()> {
  let replay = projection::replay(history);
  let mut row = replay.row;
  let mut version = history.last().map_or(0, |e| e.stream_version);

  for event in events {
    version += 1;
    let provisional = EventRecord {
      sequence: 0,
      event_id: Uuid::nil(),
      stream,
      stream_version: version,
      schema_version: CURRENT_SCHEMA_VERSION,
      event: event.clone(),
      occurred_at: Utc::now(),
      causation_id: Uuid::nil(),
      correlation_id: Uuid::nil(),
    };
    if replay.fault.is_some() {
      return Err(Error::invalid_transition(&provisional, "faulted"));
    }
    row = Some(projection::apply(row, &provisional)?);
  }
  Ok(())
}
