//! Bounded retry for optimistic-concurrency conflicts.

use std::{future::Future, time::Duration};

use covenant_core::store::StoreError;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// How hard to retry an append that lost an `expected_version` race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  /// Delay before the first retry; doubles on each further retry.
  pub base_delay:   Duration,
  pub max_delay:    Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay:   Duration::from_millis(20),
      max_delay:    Duration::from_secs(1),
    }
  }
}

impl RetryPolicy {
  /// No retries at all.
  pub fn none() -> Self { Self { max_attempts: 1, ..Self::default() } }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or the policy's attempts are used up. Each attempt must re-read whatever
/// state it depends on.
pub async fn retry_on_conflict<F, Fut, T, E>(
  policy: &RetryPolicy,
  context: &str,
  mut op: F,
) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: StoreError,
{
  let mut attempt = 0;
  let mut delay = policy.base_delay;

  loop {
    attempt += 1;
    let err = match op().await {
      Ok(value) => {
        if attempt > 1 {
          debug!(context, attempt, "succeeded after conflict retry");
        }
        return Ok(value);
      }
      Err(EngineError::Store(e)) if e.is_conflict() => e,
      Err(other) => return Err(other),
    };

    if attempt >= policy.max_attempts.max(1) {
      warn!(context, attempts = attempt, error = %err, "conflict retries exhausted");
      return Err(EngineError::RetriesExhausted { attempts: attempt, last: err });
    }

    debug!(
      context,
      attempt,
      backoff_ms = delay.as_millis() as u64,
      error = %err,
      "conflict, retrying"
    );
    sleep(delay).await;
    delay = (delay * 2).min(policy.max_delay);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  };

  use covenant_core::stream::StreamId;
  use uuid::Uuid;

  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("{0}")]
  struct FakeError(covenant_core::Error);

  impl StoreError for FakeError {
    fn core(&self) -> Option<&covenant_core::Error> { Some(&self.0) }
  }

  fn conflict() -> EngineError<FakeError> {
    EngineError::Store(FakeError(covenant_core::Error::ConcurrencyConflict {
      stream:   StreamId::wallet(Uuid::nil()),
      expected: 1,
      actual:   2,
    }))
  }

  fn fast(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(2),
    }
  }

  #[tokio::test]
  async fn succeeds_after_conflicts() {
    let calls = Arc::new(AtomicU32::new(0));
    let result = retry_on_conflict(&fast(5), "test", || {
      let calls = calls.clone();
      async move {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(conflict())
        } else {
          Ok(7)
        }
      }
    })
    .await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn exhaustion_surfaces_the_conflict() {
    let calls = Arc::new(AtomicU32::new(0));
    let result: Result<(), FakeError> = retry_on_conflict(&fast(3), "test", || {
      calls.fetch_add(1, Ordering::SeqCst);
      async { Err(conflict()) }
    })
    .await;
    let err = result.unwrap_err();
    assert!(matches!(err, EngineError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.is_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn other_errors_are_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let result: Result<(), FakeError> = retry_on_conflict(&fast(5), "test", || {
      calls.fetch_add(1, Ordering::SeqCst);
      async {
        Err(EngineError::Core(covenant_core::Error::Validation("bad".into())))
      }
    })
    .await;
    assert!(matches!(result, Err(EngineError::Core(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
