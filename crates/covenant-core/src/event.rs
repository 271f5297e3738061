//! Domain events: the immutable facts the whole platform is derived from.
//!
//! An event is never updated or deleted. The variant name of [`DomainEvent`]
//! is the past-tense event type stored in the `event_type` column; its inner
//! struct is the schema-versioned payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  stream::{StreamId, StreamType},
};

/// Payload schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

/// Largest amount any single event may carry: ten billion in major units.
pub const MAX_AMOUNT_CENTS: i64 = 1_000_000_000_000;

// ─── Subscription payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCreated {
  pub creator_id:  Uuid,
  pub fan_id:      Uuid,
  pub tier:        String,
  pub price_cents: i64,
  pub currency:    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodAttached {
  /// Opaque provider reference; card data never enters the log.
  pub method_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodDetached {
  pub method_ref: String,
}

/// A charge settled with the payment provider.
///
/// `creator_id` is the payee at the time of payment; the ledger poster uses
/// it to locate the wallet stream without consulting projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
  pub payment_ref:  String,
  pub creator_id:   Uuid,
  pub amount_cents: i64,
  pub currency:     String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
  pub payment_ref: String,
  pub reason:      Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GracePeriodElapsed {
  /// When the grace period being closed began.
  pub grace_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRequested {
  pub reason: Option<String>,
}

// ─── Wallet payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOpened {
  pub creator_id: Uuid,
  pub currency:   String,
}

/// A credit ledger entry. The fee is frozen at posting time so replay never
/// depends on the current fee configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCredited {
  /// Global sequence of the `payment_succeeded` event that caused this entry.
  pub payment_sequence: u64,
  pub subscription_id:  Uuid,
  pub payment_ref:      String,
  pub gross_cents:      i64,
  pub fee_cents:        i64,
  pub net_cents:        i64,
}

/// A debit ledger entry: money paid out to the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutIssued {
  pub payout_ref:   String,
  pub amount_cents: i64,
}

// ─── Membership payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementGranted {
  pub fan_id:          Uuid,
  pub creator_id:      Uuid,
  /// The subscription that backs this entitlement; a one-directional
  /// reference resolved through the subscription projection.
  pub subscription_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRevoked {
  pub reason: Option<String>,
}

// ─── DomainEvent ─────────────────────────────────────────────────────────────

/// Every fact the platform records. Translators match on this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum DomainEvent {
  // ── Subscription ────────────────────────────────────────────────────────
  SubscriptionCreated(SubscriptionCreated),
  PaymentMethodAttached(PaymentMethodAttached),
  PaymentMethodDetached(PaymentMethodDetached),
  PaymentSucceeded(PaymentSucceeded),
  PaymentFailed(PaymentFailed),
  GracePeriodElapsed(GracePeriodElapsed),
  CancellationRequested(CancellationRequested),

  // ── Wallet ──────────────────────────────────────────────────────────────
  WalletOpened(WalletOpened),
  LedgerCredited(LedgerCredited),
  PayoutIssued(PayoutIssued),

  // ── Membership ──────────────────────────────────────────────────────────
  EntitlementGranted(EntitlementGranted),
  EntitlementRevoked(EntitlementRevoked),
}

impl DomainEvent {
  /// All discriminants this build understands.
  pub const EVENT_TYPES: [&'static str; 12] = [
    "subscription_created",
    "payment_method_attached",
    "payment_method_detached",
    "payment_succeeded",
    "payment_failed",
    "grace_period_elapsed",
    "cancellation_requested",
    "wallet_opened",
    "ledger_credited",
    "payout_issued",
    "entitlement_granted",
    "entitlement_revoked",
  ];

  /// The discriminant stored in the `event_type` column.
  /// Must match the `rename_all = "snake_case"` serde tags above.
  pub fn event_type(&self) -> &'static str {
    match self {
      Self::SubscriptionCreated(_) => "subscription_created",
      Self::PaymentMethodAttached(_) => "payment_method_attached",
      Self::PaymentMethodDetached(_) => "payment_method_detached",
      Self::PaymentSucceeded(_) => "payment_succeeded",
      Self::PaymentFailed(_) => "payment_failed",
      Self::GracePeriodElapsed(_) => "grace_period_elapsed",
      Self::CancellationRequested(_) => "cancellation_requested",
      Self::WalletOpened(_) => "wallet_opened",
      Self::LedgerCredited(_) => "ledger_credited",
      Self::PayoutIssued(_) => "payout_issued",
      Self::EntitlementGranted(_) => "entitlement_granted",
      Self::EntitlementRevoked(_) => "entitlement_revoked",
    }
  }

  /// The only stream type this event may be appended to.
  pub fn stream_type(&self) -> StreamType {
    match self {
      Self::SubscriptionCreated(_)
      | Self::PaymentMethodAttached(_)
      | Self::PaymentMethodDetached(_)
      | Self::PaymentSucceeded(_)
      | Self::PaymentFailed(_)
      | Self::GracePeriodElapsed(_)
      | Self::CancellationRequested(_) => StreamType::Subscription,
      Self::WalletOpened(_) | Self::LedgerCredited(_) | Self::PayoutIssued(_) => {
        StreamType::Wallet
      }
      Self::EntitlementGranted(_) | Self::EntitlementRevoked(_) => {
        StreamType::Membership
      }
    }
  }

  /// Serialise the inner payload (without the type tag) for the
  /// `payload_json` column.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    let full = serde_json::to_value(self)?;
    Ok(full.get("payload").cloned().unwrap_or(serde_json::Value::Null))
  }

  /// Deserialise from the stored discriminant, schema version and payload.
  pub fn from_parts(
    event_type: &str,
    schema_version: u16,
    payload: serde_json::Value,
  ) -> Result<Self> {
    if !Self::EVENT_TYPES.contains(&event_type) {
      return Err(Error::UnknownEventType(event_type.to_owned()));
    }
    if schema_version != CURRENT_SCHEMA_VERSION {
      return Err(Error::UnsupportedSchemaVersion {
        event_type: event_type.to_owned(),
        version:    schema_version,
      });
    }
    let wrapped =
      serde_json::json!({ "event_type": event_type, "payload": payload });
    Ok(serde_json::from_value(wrapped)?)
  }

  /// Schema validation run on the append path. Checks that the event belongs
  /// to `stream`'s type and that its payload is well formed; it does not
  /// consult aggregate state.
  pub fn validate(&self, stream: &StreamId) -> Result<()> {
    if self.stream_type() != stream.stream_type {
      return Err(Error::Validation(format!(
        "{} does not belong to a {} stream",
        self.event_type(),
        stream.stream_type
      )));
    }

    match self {
      Self::SubscriptionCreated(e) => {
        not_nil("creator_id", e.creator_id)?;
        not_nil("fan_id", e.fan_id)?;
        not_blank("tier", &e.tier)?;
        positive("price_cents", e.price_cents)?;
        currency(&e.currency)
      }
      Self::PaymentMethodAttached(e) => not_blank("method_ref", &e.method_ref),
      Self::PaymentMethodDetached(e) => not_blank("method_ref", &e.method_ref),
      Self::PaymentSucceeded(e) => {
        not_blank("payment_ref", &e.payment_ref)?;
        not_nil("creator_id", e.creator_id)?;
        positive("amount_cents", e.amount_cents)?;
        currency(&e.currency)
      }
      Self::PaymentFailed(e) => not_blank("payment_ref", &e.payment_ref),
      Self::GracePeriodElapsed(_) | Self::CancellationRequested(_) => Ok(()),
      Self::WalletOpened(e) => {
        not_nil("creator_id", e.creator_id)?;
        if e.creator_id != stream.id {
          return Err(Error::Validation(format!(
            "creator_id {} does not match wallet {}",
            e.creator_id, stream.id
          )));
        }
        currency(&e.currency)
      }
      Self::LedgerCredited(e) => {
        not_blank("payment_ref", &e.payment_ref)?;
        not_nil("subscription_id", e.subscription_id)?;
        positive("gross_cents", e.gross_cents)?;
        if e.fee_cents < 0 || e.fee_cents > e.gross_cents {
          return Err(Error::Validation(format!(
            "fee_cents {} outside 0..={}",
            e.fee_cents, e.gross_cents
          )));
        }
        if e.net_cents != e.gross_cents - e.fee_cents {
          return Err(Error::Validation(
            "net_cents must equal gross_cents - fee_cents".into(),
          ));
        }
        Ok(())
      }
      Self::PayoutIssued(e) => {
        not_blank("payout_ref", &e.payout_ref)?;
        positive("amount_cents", e.amount_cents)
      }
      Self::EntitlementGranted(e) => {
        not_nil("fan_id", e.fan_id)?;
        not_nil("creator_id", e.creator_id)?;
        not_nil("subscription_id", e.subscription_id)
      }
      Self::EntitlementRevoked(_) => Ok(()),
    }
  }
}

fn not_blank(field: &str, value: &str) -> Result<()> {
  if value.trim().is_empty() {
    return Err(Error::Validation(format!("{field} must not be blank")));
  }
  Ok(())
}

fn not_nil(field: &str, value: Uuid) -> Result<()> {
  if value.is_nil() {
    return Err(Error::Validation(format!("{field} must not be the nil uuid")));
  }
  Ok(())
}

fn positive(field: &str, value: i64) -> Result<()> {
  if value <= 0 {
    return Err(Error::Validation(format!(
      "{field} must be positive, got {value}"
    )));
  }
  if value > MAX_AMOUNT_CENTS {
    return Err(Error::Validation(format!(
      "{field} exceeds {MAX_AMOUNT_CENTS}, got {value}"
    )));
  }
  Ok(())
}

/// ISO 4217 shape check: three uppercase ASCII letters.
fn currency(code: &str) -> Result<()> {
  if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
    return Err(Error::Validation(format!("invalid currency code {code:?}")));
  }
  Ok(())
}

// ─── EventRecord ─────────────────────────────────────────────────────────────

/// A persisted event. Once written, no field is ever updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
  /// Global, strictly increasing position in the log.
  pub sequence:       u64,
  pub event_id:       Uuid,
  #[serde(flatten)]
  pub stream:         StreamId,
  /// Stream-local version; gapless, starting at 1.
  pub stream_version: u64,
  pub schema_version: u16,
  #[serde(flatten)]
  pub event:          DomainEvent,
  /// Server-assigned at append time.
  pub occurred_at:    DateTime<Utc>,
  /// The event (or delivery) that directly caused this one.
  pub causation_id:   Uuid,
  /// Shared by every event in one webhook → event → side-effect chain.
  pub correlation_id: Uuid,
}

impl EventRecord {
  pub fn event_type(&self) -> &'static str { self.event.event_type() }
}

// ─── NewEvent ────────────────────────────────────────────────────────────────

/// Input to [`crate::store::EventStore::append`]. `sequence`, `stream_version`
/// and `occurred_at` are always set by the store.
///
/// When no causation id is given the store uses the event's own id; when no
/// correlation id is given it uses the causation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
  #[serde(flatten)]
  pub event:          DomainEvent,
  #[serde(default)]
  pub causation_id:   Option<Uuid>,
  #[serde(default)]
  pub correlation_id: Option<Uuid>,
}

impl NewEvent {
  pub fn new(event: DomainEvent) -> Self {
    Self { event, causation_id: None, correlation_id: None }
  }

  /// Chain this event to `cause`, inheriting its correlation id.
  pub fn caused_by(mut self, cause: &EventRecord) -> Self {
    self.causation_id = Some(cause.event_id);
    self.correlation_id = Some(cause.correlation_id);
    self
  }

  pub fn correlated(mut self, causation_id: Uuid, correlation_id: Uuid) -> Self {
    self.causation_id = Some(causation_id);
    self.correlation_id = Some(correlation_id);
    self
  }
}

// ─── Log entries ─────────────────────────────────────────────────────────────

/// A stored row that no longer decodes into an [`EventRecord`], e.g. an
/// event type or schema version this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndecodableEvent {
  pub sequence:       u64,
  /// `None` when the stream columns themselves are unreadable.
  pub stream:         Option<StreamId>,
  pub stream_version: u64,
  pub event_type:     String,
  pub reason:         String,
}

/// One row of the global log as the projector sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
  Event(EventRecord),
  Undecodable(UndecodableEvent),
}

impl LogEntry {
  pub fn sequence(&self) -> u64 {
    match self {
      Self::Event(e) => e.sequence,
      Self::Undecodable(u) => u.sequence,
    }
  }
}

/// The result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appended {
  pub stream:      StreamId,
  pub new_version: u64,
  pub events:      Vec<EventRecord>,
}

impl Appended {
  pub fn sequences(&self) -> Vec<u64> {
    self.events.iter().map(|e| e.sequence).collect()
  }
}
