//! Error type for `covenant-engine`.

use covenant_core::{delivery::DeliveryKey, store::StoreError};
use thiserror::Error;

/// Engine failures, generic over the backend's error type.
#[derive(Debug, Error)]
pub enum EngineError<E: StoreError> {
  #[error(transparent)]
  Store(#[from] E),

  /// A domain rule rejected the request before anything was written.
  #[error(transparent)]
  Core(covenant_core::Error),

  /// Conflicts persisted past the retry budget.
  #[error("gave up after {attempts} attempts: {last}")]
  RetriesExhausted {
    attempts: u32,
    #[source]
    last:     E,
  },

  /// A redelivered key arrived with a different body than the original.
  #[error("delivery {key} was already processed with a different body")]
  FingerprintMismatch { key: DeliveryKey },

  #[error("operation cancelled")]
  Cancelled,
}

impl<E: StoreError> EngineError<E> {
  /// The domain error behind this failure, if there is one.
  pub fn core(&self) -> Option<&covenant_core::Error> {
    match self {
      Self::Store(e) | Self::RetriesExhausted { last: e, .. } => e.core(),
      Self::Core(e) => Some(e),
      Self::FingerprintMismatch { .. } | Self::Cancelled => None,
    }
  }

  pub fn is_conflict(&self) -> bool {
    self.core().is_some_and(covenant_core::Error::is_conflict)
  }
}

pub type Result<T, E> = std::result::Result<T, EngineError<E>>;
