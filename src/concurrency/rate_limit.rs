//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Grants at most `max_requests` acquisitions within any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    granted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            granted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a slot is free in the window, then record the grant.
    ///
    /// The lock is held across the sleep, so waiters are granted one at a
    /// time and the window can never be over-committed.
    pub async fn acquire(&self) {
        let mut granted = self.granted.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = granted.front() {
                if now.duration_since(oldest) >= self.window {
                    granted.pop_front();
                } else {
                    break;
                }
            }

            if granted.len() < self.max_requests {
                granted.push_back(now);
                return;
            }

            // At capacity: the front entry is the next one to leave the window.
            let oldest = granted[0];
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of grants currently inside the window.
    pub async fn in_window(&self) -> usize {
        let granted = self.granted.lock().await;
        let now = Instant::now();
        granted
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}
