//! Retry policy: a maximum attempt count and a fixed per-attempt delay.
//!
//! Unlike the exponential-backoff-with-jitter policy this crate's policy type
//! is descended from, the engine's testable properties require a
//! deterministic elapsed time (`k * delay` for `k` failed attempts before a
//! success), so the policy here is intentionally a flat, fixed delay rather
//! than a curve.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::value::Environment;

/// Maximum attempts and a fixed delay between them. The attempt counter is
/// owned by the call to [`execute_with_retry`], not by the policy value
/// itself — it resets on every distinct invocation, including a WHILE unit's
/// repeated re-entry into the same body unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least 1 (a policy that never retries
    /// still makes one attempt).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    /// One attempt, no delay: the policy has no effect unless configured.
    fn default() -> Self {
        Self::new(1)
    }
}

/// Runs `attempt` until it succeeds or the policy's attempts are exhausted.
///
/// A failure is followed by a sleep of the policy's delay before the next
/// attempt (or before surfacing [`EngineError::RetryExhausted`], on the final
/// attempt) — this is what gives `k` failures an observable elapsed time of
/// `k * delay`. The ambient cancellation signal is checked before every
/// attempt and after every sleep; cancellation is never retried.
pub async fn execute_with_retry<F, Fut>(policy: RetryPolicy, env: &Environment, mut attempt: F) -> Result<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let mut attempts_used: u32 = 0;
    loop {
        if env.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        attempts_used += 1;
        tracing::debug!(attempt = attempts_used, "executing unit");
        match attempt().await {
            Ok(v) => {
                if attempts_used > 1 {
                    tracing::info!(attempts = attempts_used, "unit succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) => {
                tracing::warn!(attempt = attempts_used, error = %e, "unit execute failed");
                tokio::time::sleep(policy.delay).await;
                if env.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                if attempts_used >= policy.max_attempts {
                    tracing::error!(attempts = attempts_used, "retry policy exhausted");
                    return Err(EngineError::RetryExhausted { attempts: attempts_used });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn max_attempts_is_clamped_to_at_least_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn succeeds_immediately_without_sleeping() {
        let env = Environment::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3).with_delay(Duration::from_millis(5));
        let calls2 = Arc::clone(&calls);
        let result = execute_with_retry(policy, &env, move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { Ok(Value::from("ok")) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_k_failures_with_elapsed_k_times_delay() {
        let env = Environment::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5).with_delay(Duration::from_millis(5));
        let calls2 = Arc::clone(&calls);
        let start = std::time::Instant::now();
        let result = execute_with_retry(policy, &env, move || {
            let n = calls2.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Other("boom".into()))
                } else {
                    Ok(Value::from("ok"))
                }
            }
        })
        .await;
        let elapsed = start.elapsed();
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn exhaustion_surfaces_retry_exhausted() {
        let env = Environment::new();
        let policy = RetryPolicy::new(2).with_delay(Duration::from_millis(1));
        let result = execute_with_retry(policy, &env, || async { Err(EngineError::Other("boom".into())) }).await;
        assert!(matches!(result, Err(EngineError::RetryExhausted { attempts: 2 })));
    }
}
