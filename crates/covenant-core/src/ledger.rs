//! Ledger translator: wallet balances folded from credit and debit entries.
//!
//! A wallet stream (keyed by creator id) holds only ledger facts:
//! `ledger_credited` entries posted for each successful payment, net of the
//! platform fee, and `payout_issued` debits. The balance is the running sum
//! and is never mutated any other way. A balance that goes negative is not
//! rejected, since the payout already happened, but is reported by the invariant
//! evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::{DomainEvent, EventRecord, LedgerCredited, PaymentSucceeded},
};

// ─── Fees ────────────────────────────────────────────────────────────────────

/// Deterministic platform fee: a basis-point share plus a fixed amount,
/// capped at the gross amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
  /// Percentage fee in basis points (1/100th of a percent).
  pub platform_bps: u32,
  /// Flat fee per payment, in minor units.
  pub fixed_cents:  i64,
}

impl Default for FeeSchedule {
  fn default() -> Self { Self { platform_bps: 500, fixed_cents: 30 } }
}

impl FeeSchedule {
  /// `round_half_up(gross × bps / 10000) + fixed`, clamped to `0..=gross`.
  pub fn fee_for(&self, gross_cents: i64) -> i64 {
    let share = (i128::from(gross_cents) * i128::from(self.platform_bps)
      + 5_000)
      / 10_000;
    let fee = share + i128::from(self.fixed_cents);
    fee.clamp(0, i128::from(gross_cents.max(0))) as i64
  }

  /// The credit entry to post for `payment`, which was appended to the log
  /// as `payment_record`.
  pub fn credit_for(
    &self,
    payment_record: &EventRecord,
    payment: &PaymentSucceeded,
  ) -> LedgerCredited {
    let fee_cents = self.fee_for(payment.amount_cents);
    LedgerCredited {
      payment_sequence: payment_record.sequence,
      subscription_id: payment_record.stream.id,
      payment_ref: payment.payment_ref.clone(),
      gross_cents: payment.amount_cents,
      fee_cents,
      net_cents: payment.amount_cents - fee_cents,
    }
  }
}

// ─── Ledger entries ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
  Credit,
  Debit,
}

impl EntryKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Credit => "credit",
      Self::Debit => "debit",
    }
  }
}

/// A read-model view of one ledger fact in a wallet stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
  pub creator_id:       Uuid,
  /// Global sequence of the wallet event that recorded this entry.
  pub sequence:         u64,
  pub kind:             EntryKind,
  /// Magnitude of the entry; always positive.
  pub amount_cents:     i64,
  /// Signed effect on the balance.
  pub delta_cents:      i64,
  /// The payment this credit traces back to; `None` for payouts.
  pub payment_sequence: Option<u64>,
  /// Provider reference of the payment or payout.
  pub reference:        String,
  pub recorded_at:      DateTime<Utc>,
}

impl LedgerEntry {
  /// The ledger entry carried by `record`, if it is a ledger fact.
  pub fn from_record(record: &EventRecord) -> Option<Self> {
    match &record.event {
      DomainEvent::LedgerCredited(e) => Some(Self {
        creator_id:       record.stream.id,
        sequence:         record.sequence,
        kind:             EntryKind::Credit,
        amount_cents:     e.net_cents,
        delta_cents:      e.net_cents,
        payment_sequence: Some(e.payment_sequence),
        reference:        e.payment_ref.clone(),
        recorded_at:      record.occurred_at,
      }),
      DomainEvent::PayoutIssued(e) => Some(Self {
        creator_id:       record.stream.id,
        sequence:         record.sequence,
        kind:             EntryKind::Debit,
        amount_cents:     e.amount_cents,
        delta_cents:      e.amount_cents.saturating_neg(),
        payment_sequence: None,
        reference:        e.payout_ref.clone(),
        recorded_at:      record.occurred_at,
      }),
      _ => None,
    }
  }
}

// ─── Wallet state ────────────────────────────────────────────────────────────

/// Folded state of one wallet stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
  pub creator_id:          Uuid,
  /// Set by `wallet_opened`; wallets opened implicitly by a first entry
  /// carry no currency.
  pub currency:            Option<String>,
  pub balance_cents:       i64,
  pub total_credits_cents: i64,
  pub total_debits_cents:  i64,
  pub entry_count:         u64,
}

impl WalletState {
  fn empty(creator_id: Uuid) -> Self {
    Self {
      creator_id,
      currency: None,
      balance_cents: 0,
      total_credits_cents: 0,
      total_debits_cents: 0,
      entry_count: 0,
    }
  }
}

/// Fold `record` onto `state`. A first ledger entry opens the wallet
/// implicitly.
pub fn apply(
  state: Option<WalletState>,
  record: &EventRecord,
) -> Result<WalletState> {
  let opened = state.is_some();
  let mut w = state.unwrap_or_else(|| WalletState::empty(record.stream.id));

  match &record.event {
    DomainEvent::WalletOpened(e) => {
      if opened {
        return Err(Error::invalid_transition(record, "open"));
      }
      w.currency = Some(e.currency.clone());
    }
    _ => {
      let Some(entry) = LedgerEntry::from_record(record) else {
        let label = if opened { "open" } else { "uninitialised" };
        return Err(Error::invalid_transition(record, label));
      };
      let before = w.balance_cents;
      let overflow =
        || Error::invalid_transition(record, format!("balance {before} overflowing"));
      w.balance_cents =
        w.balance_cents.checked_add(entry.delta_cents).ok_or_else(overflow)?;
      let total = match entry.kind {
        EntryKind::Credit => &mut w.total_credits_cents,
        EntryKind::Debit => &mut w.total_debits_cents,
      };
      *total = total.checked_add(entry.amount_cents).ok_or_else(overflow)?;
      w.entry_count += 1;
    }
  }

  Ok(w)
}
