//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. Reconnects are bounded
//! by a count that is spent one failure at a time (not per time window), and
//! every reconnect waits the same fixed delay.

use std::future::Future;
use std::time::Duration;

/// Delay applied before every automatic reconnect unless overridden.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Policy controlling automatic reconnects after a retryable stream failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnects before the triggering failure is surfaced.
    pub max_retries: u32,
    /// Fixed delay applied before each reconnect.
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// Creates a policy allowing `max_retries` reconnects with the default delay.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Overrides the fixed reconnect delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns a fresh budget sized by this policy.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_retries)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Remaining automatic reconnects for a single connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    limit: u32,
    remaining: u32,
}

impl RetryBudget {
    /// Creates a full budget of `limit` retries.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            remaining: limit,
        }
    }

    /// Number of retries still available.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Returns `true` once every retry has been spent.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Spends one retry.
    ///
    /// Returns the 1-based attempt number that was granted, or `None` when the
    /// budget is already exhausted.
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.limit - self.remaining)
    }

    /// Restores the budget to its original size.
    pub fn reset(&mut self) {
        self.remaining = self.limit;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy, RetryBudget, DEFAULT_RECONNECT_DELAY};

    #[test]
    fn budget_is_spent_one_failure_at_a_time() {
        let mut budget = RetryBudget::new(2);
        assert_eq!(budget.try_consume(), Some(1));
        assert_eq!(budget.remaining(), 1);
        assert_eq!(budget.try_consume(), Some(2));
        assert!(budget.is_exhausted());
        assert_eq!(budget.try_consume(), None);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn zero_budget_never_grants_a_retry() {
        let mut budget = RetryBudget::new(0);
        assert!(budget.is_exhausted());
        assert_eq!(budget.try_consume(), None);
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut budget = ReconnectPolicy::new(3).budget();
        budget.try_consume();
        budget.try_consume();
        budget.reset();
        assert_eq!(budget.remaining(), 3);
        assert_eq!(budget.try_consume(), Some(1));
    }

    #[test]
    fn policy_uses_fixed_default_delay() {
        let policy = ReconnectPolicy::new(4);
        assert_eq!(policy.delay, DEFAULT_RECONNECT_DELAY);
        assert_eq!(
            policy.with_delay(Duration::from_millis(10)).delay,
            Duration::from_millis(10)
        );
    }

    #[test]
    fn with_timeout_reports_elapsed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let slow = with_timeout(
                Duration::from_millis(5),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await;
            assert!(slow.is_err());

            let fast = with_timeout(Duration::from_secs(1), async { 7 }).await;
            assert_eq!(fast.expect("completes in time"), 7);
        });
    }
}
