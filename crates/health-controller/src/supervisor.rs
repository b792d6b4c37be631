//! Restart supervision for long-running loops.
//!
//! A supervised task is an async closure that either finishes with a value or
//! fails. Failures are retried after a delay chosen by the [`BackoffPolicy`]
//! until the task succeeds, the restart bound is reached, or the scope is
//! cancelled.

use crate::metrics::MetricsRegistry;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Delay between restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay every time
    Fixed {
        delay: Duration,
        max_restarts: Option<u32>,
    },
    /// `initial * 2^n`, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        max_restarts: Option<u32>,
    },
}

impl BackoffPolicy {
    /// Unbounded fixed delay
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay,
            max_restarts: None,
        }
    }

    /// Unbounded exponential delay
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial,
            max,
            max_restarts: None,
        }
    }

    /// Give up after `restarts` restarts
    pub fn bounded(self, restarts: u32) -> Self {
        match self {
            BackoffPolicy::Fixed { delay, .. } => BackoffPolicy::Fixed {
                delay,
                max_restarts: Some(restarts),
            },
            BackoffPolicy::Exponential { initial, max, .. } => BackoffPolicy::Exponential {
                initial,
                max,
                max_restarts: Some(restarts),
            },
        }
    }

    pub fn max_restarts(&self) -> Option<u32> {
        match self {
            BackoffPolicy::Fixed { max_restarts, .. }
            | BackoffPolicy::Exponential { max_restarts, .. } => *max_restarts,
        }
    }

    /// Delay before restart number `restart` (zero-based)
    pub fn delay(&self, restart: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay, .. } => *delay,
            BackoffPolicy::Exponential { initial, max, .. } => initial
                .checked_mul(1u32.checked_shl(restart).unwrap_or(u32::MAX))
                .map_or(*max, |delay| delay.min(*max)),
        }
    }
}

/// Why a supervised task stopped without a value
#[derive(Debug, PartialEq, Eq)]
pub enum Exit<E> {
    Cancelled,
    /// Restart bound reached; carries the last failure
    Exhausted(E),
}

/// Drives one restartable task
pub struct Supervisor {
    name: &'static str,
    policy: BackoffPolicy,
    scope: CancellationToken,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Supervisor {
    pub fn new(name: &'static str, policy: BackoffPolicy, scope: CancellationToken) -> Self {
        Self {
            name,
            policy,
            scope,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRegistry>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run `task` until it succeeds, exhausts its restarts, or the scope ends
    pub async fn run<T, E, F, Fut>(&self, mut task: F) -> Result<T, Exit<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut restarts = 0u32;
        loop {
            let outcome = tokio::select! {
                _ = self.scope.cancelled() => return Err(Exit::Cancelled),
                outcome = task() => outcome,
            };

            let e = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if self.policy.max_restarts().is_some_and(|max| restarts >= max) {
                error!(task = self.name, error = %e, restarts, "Task failed, giving up");
                return Err(Exit::Exhausted(e));
            }

            let delay = self.policy.delay(restarts);
            warn!(task = self.name, error = %e, restarts, delay = ?delay, "Task failed, restarting");
            restarts += 1;
            if let Some(ref m) = self.metrics {
                m.record_restart(self.name);
            }

            tokio::select! {
                _ = self.scope.cancelled() => return Err(Exit::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_restarts_until_success() {
        let attempts = AtomicU32::new(0);
        let supervisor = Supervisor::new(
            "test",
            BackoffPolicy::fixed(Duration::from_secs(3)),
            CancellationToken::new(),
        );

        let start = Instant::now();
        let value = supervisor
            .run(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(value, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_exhausts() {
        let supervisor = Supervisor::new(
            "test",
            BackoffPolicy::fixed(Duration::from_millis(10)).bounded(2),
            CancellationToken::new(),
        );

        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = supervisor
            .run(|| async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {}", n))
            })
            .await;

        assert_eq!(result, Err(Exit::Exhausted("failure 2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let scope = CancellationToken::new();
        let supervisor = Supervisor::new(
            "test",
            BackoffPolicy::fixed(Duration::from_secs(60)),
            scope.clone(),
        );

        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let result: Result<(), Exit<&str>> = supervisor.run(|| async { Err("down") }).await;
        assert_eq!(result, Err(Exit::Cancelled));
    }
}
