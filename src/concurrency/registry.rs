//! Keyed semaphores and rate limiters, owned by whoever constructs the
//! registry and handed to the clients that need them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::rate_limit::SlidingWindowLimiter;
use super::semaphore::AdaptiveSemaphore;

#[derive(Debug)]
pub struct ConcurrencyRegistry {
    default_limit: usize,
    semaphores: Mutex<HashMap<String, AdaptiveSemaphore>>,
    limiters: Mutex<HashMap<String, Arc<SlidingWindowLimiter>>>,
}

impl Default for ConcurrencyRegistry {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ConcurrencyRegistry {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            semaphores: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Get the semaphore for `key`, creating it with `limit` (or the
    /// registry default) on first use.
    pub fn semaphore(&self, key: &str, limit: Option<usize>) -> AdaptiveSemaphore {
        let mut map = self.semaphores.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| AdaptiveSemaphore::new(key, limit.unwrap_or(self.default_limit)))
            .clone()
    }

    /// Replace the semaphore for `key`. Permits already held on the old one
    /// stay valid until dropped.
    pub fn update_limit(&self, key: &str, new_limit: usize) -> AdaptiveSemaphore {
        let sem = AdaptiveSemaphore::new(key, new_limit);
        self.semaphores
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), sem.clone());
        info!(key, new_limit, "updated concurrency limit");
        sem
    }

    pub fn register_limiter(&self, key: &str, limiter: SlidingWindowLimiter) -> Arc<SlidingWindowLimiter> {
        let limiter = Arc::new(limiter);
        self.limiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), limiter.clone());
        limiter
    }

    pub fn limiter(&self, key: &str) -> Option<Arc<SlidingWindowLimiter>> {
        self.limiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }
}
