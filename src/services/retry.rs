//! Retry with exponential backoff for service connections

use std::time::{Duration, SystemTime};

/// Retry policy for connecting to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (zero based)
    ///
    /// `min(base_delay * 2^attempt + jitter, max_delay)`, where the jitter
    /// is 0-25% of the delay taken from the system clock.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);

        let jitter_nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let jitter = base.mul_f64(f64::from(jitter_nanos % 250) / 1000.0);

        (base + jitter).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are used up
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        let first = policy.delay_for_attempt(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));

        let third = policy.delay_for_attempt(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .retry("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .retry("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 { Err("flaky".to_string()) } else { Ok(n) }
            })
            .await;

        assert_eq!(result, Ok(1));
    }
}
