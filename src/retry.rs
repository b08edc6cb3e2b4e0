//! Bounded fixed-interval retry.
//!
//! Every retrying operation in kindling is parameterized by one [`RetryPolicy`]:
//! a maximum attempt count and a fixed sleep between attempts. Exhausting the
//! budget is the sole timeout mechanism; the final error is surfaced verbatim
//! so operators see the real cause, not a synthetic timeout message.

use std::time::Duration;

use tracing::warn;

/// Attempt budget for an operation that may fail transiently.
///
/// The interval is fixed rather than backed off: every retry here is a coarse
/// poll of external state (provisioner output, boot-time agents, scheduler
/// convergence) at a cadence the operator chooses up front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, at least 1
    pub max_attempts: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and interval
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        debug_assert!(max_attempts >= 1, "a retry policy needs at least one attempt");
        Self {
            max_attempts,
            interval,
        }
    }

    /// A single attempt with no sleep, for gates that must already hold
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Execute an async operation until it succeeds or the policy is exhausted.
///
/// Each attempt re-runs the full operation. Sleeps `policy.interval` between
/// attempts, never after the last one. On exhaustion the last error is
/// returned unchanged.
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed, retry budget exhausted"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    interval_ms = policy.interval.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
