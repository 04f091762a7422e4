//! Retry policy with exponential backoff and optional jitter
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add random jitter to backoff (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(660_000),
            backoff_multiplier: 5.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after `attempt` (1-based) failed, before the next one.
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_backoff(attempt), self.jitter).min(self.max_backoff)
    }

    /// True once `attempt` (1-based) has used up the attempt budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Last attempt that is followed by a backoff before the next one
    pub fn last_retry_attempt(&self) -> u32 {
        self.max_attempts.saturating_sub(1).max(1)
    }

    /// Upper bound of any delay `backoff_for` returns for attempts up to
    /// `last_retry_attempt`, jitter included
    pub fn longest_backoff(&self) -> Duration {
        let base = self.base_backoff(self.last_retry_attempt());
        if !self.jitter {
            return base;
        }
        let ms = base.as_millis() as f64 * (1.0 + MAX_JITTER);
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }

    fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64;
        let cap_ms = self.max_backoff.as_millis() as f64;
        let raw_ms = base_ms * self.backoff_multiplier.max(1.0).powi(exponent);

        Duration::from_millis(raw_ms.min(cap_ms) as u64)
    }
}

const MAX_JITTER: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Max attempts ({attempts}) exceeded: {last_error}")]
    MaxAttemptsExceeded { attempts: u32, last_error: E },
}

/// Execute a future with retry logic
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.is_exhausted(attempt) {
                    warn!(attempts = attempt, error = %e, "Max attempts reached");
                    return Err(RetryError::MaxAttemptsExceeded {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = config.backoff_for(attempt);

                warn!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt, config.max_attempts, e, delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let mut rng = rand::thread_rng();
        let jitter_factor = 1.0 + rng.gen_range(-MAX_JITTER..MAX_JITTER);
        Duration::from_millis((base.as_millis() as f64 * jitter_factor) as u64)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_schedule_grows_and_caps() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(5));
        assert_eq!(config.backoff_for(3), Duration::from_secs(25));
        assert_eq!(config.backoff_for(4), Duration::from_secs(125));
        assert_eq!(config.backoff_for(5), Duration::from_secs(625));
        // 3125s would exceed the 660s cap
        assert_eq!(config.backoff_for(6), Duration::from_secs(660));
        assert_eq!(config.backoff_for(60), Duration::from_secs(660));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let config = RetryConfig {
            jitter: true,
            ..fast_config(5)
        };

        for attempt in 1..10 {
            assert!(config.backoff_for(attempt) <= config.max_backoff);
        }
    }

    #[test]
    fn test_exhaustion_counts_first_attempt() {
        let config = fast_config(5);
        assert!(!config.is_exhausted(1));
        assert!(!config.is_exhausted(4));
        assert!(config.is_exhausted(5));
        assert!(config.is_exhausted(6));
    }

    #[test]
    fn test_longest_backoff_follows_attempt_budget() {
        let config = RetryConfig::default();
        assert_eq!(config.last_retry_attempt(), 4);
        assert_eq!(config.longest_backoff(), Duration::from_secs(125));

        let six = RetryConfig {
            max_attempts: 6,
            ..RetryConfig::default()
        };
        assert_eq!(six.longest_backoff(), Duration::from_secs(625));

        let single = RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        };
        assert_eq!(single.last_retry_attempt(), 1);
        assert_eq!(single.longest_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_longest_backoff_includes_jitter() {
        let config = RetryConfig {
            jitter: true,
            ..RetryConfig::default()
        };
        assert_eq!(config.longest_backoff(), Duration::from_millis(162_500));

        // Never above the cap
        let capped = RetryConfig {
            max_attempts: 10,
            jitter: true,
            ..RetryConfig::default()
        };
        assert_eq!(capped.longest_backoff(), Duration::from_secs(660));

        for attempt in 1..=config.last_retry_attempt() {
            assert!(config.backoff_for(attempt) <= config.longest_backoff());
        }
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err("temporary error")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_max_attempts_exceeded() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>("persistent error") }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxAttemptsExceeded {
                attempts: 3,
                last_error: "persistent error"
            })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
