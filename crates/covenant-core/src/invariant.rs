//! Cross-aggregate invariants evaluated over projections.
//!
//! Evaluation is a pure function of a [`ProjectionSnapshot`], a scope, a
//! policy and the evaluation time. It never repairs anything; an empty result
//! is the definition of healthy.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap, HashSet},
  fmt,
  str::FromStr,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error,
  ledger::WalletState,
  membership::{MembershipState, MembershipStatus},
  projection::Anomaly,
  subscription::{SubscriptionState, SubscriptionStatus},
};

// ─── Categories ──────────────────────────────────────────────────────────────

/// The predicate a violation failed.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
  NegativeWalletBalance,
  PaymentWithoutLedgerEntry,
  ActiveSubscriptionWithoutPaymentMethod,
  GracePeriodSlaBreached,
  OrphanedEntitlement,
  /// Cached wallet balance differs from the sum of its ledger entries.
  WalletDrift,
  /// An aggregate is faulted by a recorded fold defect.
  StreamAnomaly,
}

impl ViolationCategory {
  pub const ALL: [ViolationCategory; 7] = [
    Self::NegativeWalletBalance,
    Self::PaymentWithoutLedgerEntry,
    Self::ActiveSubscriptionWithoutPaymentMethod,
    Self::GracePeriodSlaBreached,
    Self::OrphanedEntitlement,
    Self::WalletDrift,
    Self::StreamAnomaly,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::NegativeWalletBalance => "negative_wallet_balance",
      Self::PaymentWithoutLedgerEntry => "payment_without_ledger_entry",
      Self::ActiveSubscriptionWithoutPaymentMethod => {
        "active_subscription_without_payment_method"
      }
      Self::GracePeriodSlaBreached => "grace_period_sla_breached",
      Self::OrphanedEntitlement => "orphaned_entitlement",
      Self::WalletDrift => "wallet_drift",
      Self::StreamAnomaly => "stream_anomaly",
    }
  }

  pub fn severity(&self) -> Severity {
    match self {
      Self::NegativeWalletBalance
      | Self::PaymentWithoutLedgerEntry
      | Self::WalletDrift => Severity::Critical,
      Self::OrphanedEntitlement | Self::StreamAnomaly => Severity::Error,
      Self::ActiveSubscriptionWithoutPaymentMethod
      | Self::GracePeriodSlaBreached => Severity::Warning,
    }
  }
}

impl fmt::Display for ViolationCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ViolationCategory {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|c| c.as_str() == s)
      .ok_or_else(|| Error::Validation(format!("unknown invariant {s:?}")))
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Warning,
  Error,
  Critical,
}

/// One failed predicate. Advisory output, recomputed on every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
  pub category:    ViolationCategory,
  pub severity:    Severity,
  /// The offending aggregates; the primary entity first.
  pub entity_ids:  Vec<Uuid>,
  /// Human-readable summary. Never contains event payloads.
  pub detail:      String,
  pub detected_at: DateTime<Utc>,
}

// ─── Policy and scope ────────────────────────────────────────────────────────

/// Grace-period timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
  /// How long a subscription may stay in `GracePeriod` before it should be
  /// expired.
  pub period:    Duration,
  /// Tolerated processing delay past `period` before the overrun counts as
  /// an SLA breach.
  pub sla_slack: Duration,
}

impl Default for GracePolicy {
  fn default() -> Self {
    Self { period: Duration::hours(72), sla_slack: Duration::hours(4) }
  }
}

impl GracePolicy {
  pub fn expires_at(&self, started: DateTime<Utc>) -> DateTime<Utc> {
    started + self.period
  }

  pub fn sla_deadline(&self, started: DateTime<Utc>) -> DateTime<Utc> {
    started + self.period + self.sla_slack
  }

  /// Strictly after the deadline; a subscription sitting exactly on it is
  /// not yet in breach.
  pub fn is_breached(&self, started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now > self.sla_deadline(started)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantPolicy {
  pub grace:      GracePolicy,
  /// How long a payment may go without a ledger entry before it is flagged;
  /// covers the gap between append and ledger posting.
  pub ledger_lag: Duration,
}

impl Default for InvariantPolicy {
  fn default() -> Self {
    Self { grace: GracePolicy::default(), ledger_lag: Duration::seconds(60) }
  }
}

/// Which predicates to run and over which creator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationScope {
  /// Empty means every category.
  pub categories: BTreeSet<ViolationCategory>,
  pub creator_id: Option<Uuid>,
}

impl EvaluationScope {
  pub fn all() -> Self { Self::default() }

  pub fn for_creator(creator_id: Uuid) -> Self {
    Self { creator_id: Some(creator_id), ..Self::default() }
  }

  pub fn only(categories: impl IntoIterator<Item = ViolationCategory>) -> Self {
    Self { categories: categories.into_iter().collect(), creator_id: None }
  }

  pub fn includes(&self, category: ViolationCategory) -> bool {
    self.categories.is_empty() || self.categories.contains(&category)
  }

  fn covers(&self, creator_id: Uuid) -> bool {
    self.creator_id.is_none_or(|c| c == creator_id)
  }
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// A `payment_succeeded` event, joined with the ledger entry that credits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
  pub sequence:        u64,
  pub subscription_id: Uuid,
  pub creator_id:      Uuid,
  pub payment_ref:     String,
  pub amount_cents:    i64,
  pub occurred_at:     DateTime<Utc>,
  /// Sequence of the `ledger_credited` event, if one has been projected.
  pub ledger_sequence: Option<u64>,
}

/// A wallet row next to the independently summed ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSummary {
  pub wallet:           WalletState,
  pub ledger_sum_cents: i64,
  pub ledger_entries:   u64,
}

/// Everything the evaluator reads, loaded in one consistent pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
  pub subscriptions: Vec<SubscriptionState>,
  pub wallets:       Vec<WalletSummary>,
  pub memberships:   Vec<MembershipState>,
  pub payments:      Vec<PaymentRecord>,
  /// Unresolved anomalies only.
  pub anomalies:     Vec<Anomaly>,
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Run every predicate in `scope` over `snapshot` as of `now`. Output is
/// sorted by category, then entity ids.
pub fn evaluate(
  snapshot: &ProjectionSnapshot,
  scope: &EvaluationScope,
  policy: &InvariantPolicy,
  now: DateTime<Utc>,
) -> Vec<ViolationRecord> {
  use ViolationCategory::*;

  let mut out = Vec::new();
  let mut flag = |category: ViolationCategory, ids: Vec<Uuid>, detail: String| {
    out.push(ViolationRecord {
      category,
      severity: category.severity(),
      entity_ids: ids,
      detail,
      detected_at: now,
    });
  };

  for summary in &snapshot.wallets {
    let w = &summary.wallet;
    if !scope.covers(w.creator_id) {
      continue;
    }
    if scope.includes(NegativeWalletBalance) && w.balance_cents < 0 {
      flag(
        NegativeWalletBalance,
        vec![w.creator_id],
        format!("wallet balance is {} cents", w.balance_cents),
      );
    }
    if scope.includes(WalletDrift) && w.balance_cents != summary.ledger_sum_cents
    {
      flag(
        WalletDrift,
        vec![w.creator_id],
        format!(
          "cached balance {} cents, ledger entries sum to {} cents",
          w.balance_cents, summary.ledger_sum_cents
        ),
      );
    }
  }

  if scope.includes(PaymentWithoutLedgerEntry) {
    for p in &snapshot.payments {
      if !scope.covers(p.creator_id) || p.ledger_sequence.is_some() {
        continue;
      }
      if now - p.occurred_at > policy.ledger_lag {
        flag(
          PaymentWithoutLedgerEntry,
          vec![p.subscription_id, p.creator_id],
          format!("payment at sequence {} has no ledger credit", p.sequence),
        );
      }
    }
  }

  let subscriptions: HashMap<Uuid, &SubscriptionState> = snapshot
    .subscriptions
    .iter()
    .map(|s| (s.subscription_id, s))
    .collect();

  for s in &snapshot.subscriptions {
    if !scope.covers(s.creator_id) {
      continue;
    }
    if scope.includes(ActiveSubscriptionWithoutPaymentMethod)
      && s.status == SubscriptionStatus::Active
      && s.payment_method.is_none()
    {
      flag(
        ActiveSubscriptionWithoutPaymentMethod,
        vec![s.subscription_id],
        "active subscription has no payment method on file".into(),
      );
    }
    if scope.includes(GracePeriodSlaBreached)
      && s.status == SubscriptionStatus::GracePeriod
      && let Some(started) = s.grace_started_at
      && policy.grace.is_breached(started, now)
    {
      let overrun = now - policy.grace.expires_at(started);
      flag(
        GracePeriodSlaBreached,
        vec![s.subscription_id],
        format!(
          "grace period started {} is {} minutes past its configured length",
          started.to_rfc3339(),
          overrun.num_minutes()
        ),
      );
    }
  }

  if scope.includes(OrphanedEntitlement) {
    for m in &snapshot.memberships {
      if !scope.covers(m.creator_id) || m.status != MembershipStatus::Active {
        continue;
      }
      let backing = subscriptions.get(&m.subscription_id);
      if !backing.is_some_and(|s| s.status.grants_access()) {
        let why = match backing {
          Some(s) => format!("backing subscription is {}", s.status),
          None => "backing subscription does not exist".to_owned(),
        };
        flag(
          OrphanedEntitlement,
          vec![m.membership_id, m.subscription_id],
          format!("active entitlement: {why}"),
        );
      }
    }
  }

  if scope.includes(StreamAnomaly) {
    let creator_streams: Option<HashSet<Uuid>> = scope.creator_id.map(|c| {
      let mut ids: HashSet<Uuid> = HashSet::from([c]);
      ids.extend(
        snapshot
          .subscriptions
          .iter()
          .filter(|s| s.creator_id == c)
          .map(|s| s.subscription_id),
      );
      ids.extend(
        snapshot
          .memberships
          .iter()
          .filter(|m| m.creator_id == c)
          .map(|m| m.membership_id),
      );
      ids
    });

    for a in &snapshot.anomalies {
      if let Some(ids) = &creator_streams
        && !ids.contains(&a.stream.id)
      {
        continue;
      }
      flag(
        StreamAnomaly,
        vec![a.stream.id],
        format!(
          "{} stream faulted at version {} ({})",
          a.stream.stream_type, a.stream_version, a.event_type
        ),
      );
    }
  }

  out.sort_by(|a, b| {
    (a.category, &a.entity_ids).cmp(&(b.category, &b.entity_ids))
  });
  out
}

/// Violation counts per category.
pub fn summarize(
  violations: &[ViolationRecord],
) -> BTreeMap<ViolationCategory, usize> {
  let mut counts = BTreeMap::new();
  for v in violations {
    *counts.entry(v.category).or_insert(0) += 1;
  }
  counts
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::stream::StreamId;

  fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap() }

  fn subscription(status: SubscriptionStatus) -> SubscriptionState {
    SubscriptionState {
      subscription_id:    Uuid::new_v4(),
      creator_id:         Uuid::from_u128(1),
      fan_id:             Uuid::new_v4(),
      tier:               "gold".into(),
      price_cents:        500,
      currency:           "USD".into(),
      status,
      payment_method:     Some("pm_1".into()),
      grace_started_at:   None,
      last_payment_at:    None,
      payments_succeeded: 1,
      payments_failed:    0,
      ended_at:           None,
    }
  }

  fn wallet(balance: i64, ledger_sum: i64) -> WalletSummary {
    WalletSummary {
      wallet:           WalletState {
        creator_id:          Uuid::from_u128(1),
        currency:            None,
        balance_cents:       balance,
        total_credits_cents: 0,
        total_debits_cents:  0,
        entry_count:         0,
      },
      ledger_sum_cents: ledger_sum,
      ledger_entries:   1,
    }
  }

  fn eval(snapshot: &ProjectionSnapshot, now: DateTime<Utc>) -> Vec<ViolationRecord> {
    evaluate(snapshot, &EvaluationScope::all(), &InvariantPolicy::default(), now)
  }

  #[test]
  fn empty_snapshot_is_healthy() {
    assert!(eval(&ProjectionSnapshot::default(), t0()).is_empty());
  }

  #[test]
  fn negative_balance_and_drift() {
    let snapshot = ProjectionSnapshot {
      wallets: vec![wallet(-100, -100), wallet(50, 80)],
      ..Default::default()
    };
    let v = eval(&snapshot, t0());
    let cats: Vec<_> = v.iter().map(|v| v.category).collect();
    assert_eq!(cats, vec![
      ViolationCategory::NegativeWalletBalance,
      ViolationCategory::WalletDrift
    ]);
    assert_eq!(v[0].severity, Severity::Critical);
  }

  #[test]
  fn grace_sla_boundary() {
    let mut s = subscription(SubscriptionStatus::GracePeriod);
    s.grace_started_at = Some(t0());
    let snapshot = ProjectionSnapshot { subscriptions: vec![s], ..Default::default() };
    let deadline = t0() + Duration::hours(76);

    assert!(eval(&snapshot, deadline - Duration::minutes(1)).is_empty());
    assert!(eval(&snapshot, deadline).is_empty());
    let v = eval(&snapshot, deadline + Duration::seconds(1));
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].category, ViolationCategory::GracePeriodSlaBreached);
  }

  #[test]
  fn active_without_payment_method() {
    let mut s = subscription(SubscriptionStatus::Active);
    s.payment_method = None;
    let mut grace = subscription(SubscriptionStatus::GracePeriod);
    grace.payment_method = None;
    grace.grace_started_at = Some(t0());
    let snapshot = ProjectionSnapshot {
      subscriptions: vec![s.clone(), grace],
      ..Default::default()
    };
    let v = eval(&snapshot, t0());
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].entity_ids, vec![s.subscription_id]);
  }

  #[test]
  fn payment_without_ledger_entry_respects_lag() {
    let p = PaymentRecord {
      sequence:        9,
      subscription_id: Uuid::new_v4(),
      creator_id:      Uuid::from_u128(1),
      payment_ref:     "pi_1".into(),
      amount_cents:    500,
      occurred_at:     t0(),
      ledger_sequence: None,
    };
    let snapshot = ProjectionSnapshot { payments: vec![p.clone()], ..Default::default() };
    assert!(eval(&snapshot, t0() + Duration::seconds(30)).is_empty());
    assert_eq!(eval(&snapshot, t0() + Duration::minutes(5)).len(), 1);

    let posted = PaymentRecord { ledger_sequence: Some(10), ..p };
    let snapshot = ProjectionSnapshot { payments: vec![posted], ..Default::default() };
    assert!(eval(&snapshot, t0() + Duration::minutes(5)).is_empty());
  }

  #[test]
  fn orphaned_entitlements() {
    let active = subscription(SubscriptionStatus::Active);
    let cancelled = subscription(SubscriptionStatus::Cancelled);
    let membership = |subscription_id| MembershipState {
      membership_id: Uuid::new_v4(),
      fan_id: Uuid::new_v4(),
      creator_id: Uuid::from_u128(1),
      subscription_id,
      status: MembershipStatus::Active,
      granted_at: t0(),
      revoked_at: None,
    };
    let snapshot = ProjectionSnapshot {
      subscriptions: vec![active.clone(), cancelled.clone()],
      memberships: vec![
        membership(active.subscription_id),
        membership(cancelled.subscription_id),
        membership(Uuid::new_v4()),
      ],
      ..Default::default()
    };
    let v = eval(&snapshot, t0());
    assert_eq!(v.len(), 2);
    assert!(v.iter().all(|v| v.category == ViolationCategory::OrphanedEntitlement));
  }

  #[test]
  fn scope_filters_categories_and_creator() {
    let other = WalletSummary {
      wallet: WalletState { creator_id: Uuid::from_u128(2), ..wallet(-1, -1).wallet },
      ..wallet(-1, -1)
    };
    let snapshot = ProjectionSnapshot {
      wallets: vec![wallet(-5, 0), other],
      anomalies: vec![Anomaly {
        stream:         StreamId::subscription(Uuid::new_v4()),
        sequence:       3,
        stream_version: 2,
        event_type:     "grace_period_elapsed".into(),
        reason:         "invalid".into(),
        detected_at:    t0(),
      }],
      ..Default::default()
    };
    let policy = InvariantPolicy::default();

    let only_drift = EvaluationScope::only([ViolationCategory::WalletDrift]);
    let v = evaluate(&snapshot, &only_drift, &policy, t0());
    assert_eq!(v.len(), 1);

    let creator = EvaluationScope::for_creator(Uuid::from_u128(2));
    let v = evaluate(&snapshot, &creator, &policy, t0());
    assert_eq!(v.len(), 1);
    assert_eq!(v[0].entity_ids, vec![Uuid::from_u128(2)]);

    let all = evaluate(&snapshot, &EvaluationScope::all(), &policy, t0());
    assert_eq!(summarize(&all)[&ViolationCategory::StreamAnomaly], 1);
  }

  #[test]
  fn category_names_round_trip() {
    for c in ViolationCategory::ALL {
      assert_eq!(c.as_str().parse::<ViolationCategory>().unwrap(), c);
    }
  }
}
