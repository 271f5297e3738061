//! Stream identity: the aggregate type plus aggregate id that every event
//! belongs to.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// The kind of aggregate a stream holds.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
  /// One fan's subscription to one creator; keyed by subscription id.
  Subscription,
  /// A creator's earnings ledger; keyed by creator id.
  Wallet,
  /// An access entitlement; keyed by membership id.
  Membership,
}

impl StreamType {
  pub const ALL: [StreamType; 3] =
    [Self::Subscription, Self::Wallet, Self::Membership];

  /// The string stored in the `stream_type` column.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Subscription => "subscription",
      Self::Wallet => "wallet",
      Self::Membership => "membership",
    }
  }
}

impl fmt::Display for StreamType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for StreamType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "subscription" => Ok(Self::Subscription),
      "wallet" => Ok(Self::Wallet),
      "membership" => Ok(Self::Membership),
      other => Err(Error::UnknownStreamType(other.to_owned())),
    }
  }
}

/// Identifies one aggregate's event stream.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StreamId {
  pub stream_type: StreamType,
  #[serde(rename = "stream_id")]
  pub id:          Uuid,
}

impl StreamId {
  pub fn new(stream_type: StreamType, id: Uuid) -> Self {
    Self { stream_type, id }
  }

  pub fn subscription(id: Uuid) -> Self { Self::new(StreamType::Subscription, id) }

  /// Wallet streams are keyed by the creator who owns them.
  pub fn wallet(creator_id: Uuid) -> Self {
    Self::new(StreamType::Wallet, creator_id)
  }

  pub fn membership(id: Uuid) -> Self { Self::new(StreamType::Membership, id) }
}

impl fmt::Display for StreamId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.stream_type, self.id)
  }
}
