//! Exponential backoff with jitter for fallible async operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff policy for remote calls.
///
/// Delay for attempt `i` (0-indexed) is `min(base * 2^i, max_delay)` plus a
/// jitter drawn from `[10%, 30%]` of that capped value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let raw = self.base_delay.saturating_mul(factor);
        let capped = raw.min(self.max_delay);
        let jitter = capped.mul_f64(rng.gen_range(0.1..=0.3));
        capped + jitter
    }
}

/// Run `op` until it succeeds or the policy's attempts are spent.
///
/// Returns the last error once every attempt has failed.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt, &mut rand::thread_rng());
                warn!(
                    %label,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_bounds_per_attempt() {
        let policy = RetryPolicy::new(8, Duration::from_millis(100), Duration::from_secs(600));
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..6 {
            let floor = Duration::from_millis(100) * 2u32.pow(attempt);
            for _ in 0..50 {
                let d = policy.delay_for(attempt, &mut rng);
                let slack = Duration::from_micros(1);
                assert!(d + slack >= floor.mul_f64(1.1), "attempt {attempt}: {d:?}");
                assert!(d <= floor.mul_f64(1.3) + slack, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn test_delay_is_capped_before_jitter() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5));
        let mut rng = StdRng::seed_from_u64(1);
        let d = policy.delay_for(9, &mut rng);
        assert!(d >= Duration::from_millis(5500));
        assert!(d <= Duration::from_millis(6500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));

        let result: Result<&str, String> = retry_with_backoff(&policy, "flaky", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("boom {n}"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_after_exhaustion() {
        let policy = RetryPolicy::new(4, Duration::from_millis(10), Duration::from_secs(1));

        let result: Result<(), String> =
            retry_with_backoff(&policy, "always", |attempt| async move {
                Err(format!("attempt {attempt}"))
            })
            .await;

        assert_eq!(result.unwrap_err(), "attempt 3");
    }
}
