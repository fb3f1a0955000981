//! Transport-level retry for collaborator calls.
//!
//! Every call to the intelligence or version-control collaborator goes
//! through [`call_with_retry`]: each try is bounded by a timeout, transient
//! failures are retried with exponential backoff, and anything else is
//! returned immediately. This is separate from the review loop's
//! revise/abandon ceiling.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::Transient;

/// Timeout and retry bounds for one collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub timeout_secs: u64,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff_ms: u64,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            timeout_secs: 60,
            backoff_ms: 500,
        }
    }
}

impl TransportPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Run `op` under `policy`.
///
/// `operation` names the call in retry logs.
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &TransportPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let timeout = policy.timeout();
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    operation = %operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntelligenceError, VcsError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = TransportPolicy {
            backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = TransportPolicy::default();
        let c = Arc::clone(&calls);
        let result: Result<&str, IntelligenceError> =
            call_with_retry(&policy, "test", move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(IntelligenceError::QuotaExceeded("429".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = TransportPolicy::default();
        let c = Arc::clone(&calls);
        let result: Result<(), VcsError> = call_with_retry(&policy, "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(VcsError::Network("reset".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(VcsError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = TransportPolicy::default();
        let c = Arc::clone(&calls);
        let result: Result<(), VcsError> = call_with_retry(&policy, "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(VcsError::Auth("bad token".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(VcsError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = TransportPolicy {
            max_attempts: 2,
            timeout_secs: 1,
            backoff_ms: 10,
        };
        let c = Arc::clone(&calls);
        let result: Result<(), IntelligenceError> = call_with_retry(&policy, "test", move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await;
        assert!(matches!(result, Err(IntelligenceError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
