//! Membership translator: the access entitlement a fan holds for a
//! creator's content.
//!
//! An entitlement references its backing subscription by id only; whether
//! that subscription still grants access is resolved through the
//! subscription projection by the invariant evaluator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::{DomainEvent, EventRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
  Active,
  Revoked,
}

impl MembershipStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::Revoked => "revoked",
    }
  }
}

/// Folded state of one membership stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
  pub membership_id:   Uuid,
  pub fan_id:          Uuid,
  pub creator_id:      Uuid,
  pub subscription_id: Uuid,
  pub status:          MembershipStatus,
  pub granted_at:      DateTime<Utc>,
  pub revoked_at:      Option<DateTime<Utc>>,
}

/// Fold `record` onto `state`. A revoked entitlement may be granted again,
/// possibly backed by a different subscription.
pub fn apply(
  state: Option<MembershipState>,
  record: &EventRecord,
) -> Result<MembershipState> {
  match (state, &record.event) {
    (None, DomainEvent::EntitlementGranted(e)) => Ok(MembershipState {
      membership_id:   record.stream.id,
      fan_id:          e.fan_id,
      creator_id:      e.creator_id,
      subscription_id: e.subscription_id,
      status:          MembershipStatus::Active,
      granted_at:      record.occurred_at,
      revoked_at:      None,
    }),
    (Some(mut m), DomainEvent::EntitlementGranted(e))
      if m.status == MembershipStatus::Revoked =>
    {
      m.fan_id = e.fan_id;
      m.creator_id = e.creator_id;
      m.subscription_id = e.subscription_id;
      m.status = MembershipStatus::Active;
      m.granted_at = record.occurred_at;
      m.revoked_at = None;
      Ok(m)
    }
    (Some(mut m), DomainEvent::EntitlementRevoked(_))
      if m.status == MembershipStatus::Active =>
    {
      m.status = MembershipStatus::Revoked;
      m.revoked_at = Some(record.occurred_at);
      Ok(m)
    }
    (None, _) => Err(Error::invalid_transition(record, "uninitialised")),
    (Some(m), _) => Err(Error::invalid_transition(record, m.status.as_str())),
  }
}
