//! Counting semaphore usable from tokio tasks and from plain OS threads.
//!
//! Inside a tokio runtime the permit is awaited natively. Outside of one
//! (a foreign executor, or a background thread calling
//! [`AdaptiveSemaphore::acquire_blocking`]) the same permit pool is reached
//! through a blocking adapter parked on a condition variable. Both paths
//! draw from one pool, so the limit holds across execution contexts.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, oneshot};
use tracing::debug;

/// Re-check interval for blocked OS threads, guards against a missed wakeup.
const BLOCKING_RECHECK: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
#[error("semaphore `{0}` is closed")]
pub struct SemaphoreClosed(pub String);

/// Which path served an acquisition. Useful for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePath {
    Native,
    Blocking,
}

struct Shared {
    name: String,
    limit: usize,
    permits: Arc<Semaphore>,
    released: Mutex<()>,
    wakeup: Condvar,
}

impl Shared {
    fn notify(&self) {
        // Take the mutex so a waiter between try_acquire and wait does not miss it.
        let _guard = self.released.lock().unwrap_or_else(|p| p.into_inner());
        self.wakeup.notify_one();
    }

    fn acquire_blocking(self: &Arc<Self>) -> Result<OwnedSemaphorePermit, SemaphoreClosed> {
        let mut guard = self.released.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => return Ok(permit),
                Err(TryAcquireError::Closed) => return Err(SemaphoreClosed(self.name.clone())),
                Err(TryAcquireError::NoPermits) => {
                    guard = self
                        .wakeup
                        .wait_timeout(guard, BLOCKING_RECHECK)
                        .map(|(g, _)| g)
                        .unwrap_or_else(|p| p.into_inner().0);
                }
            }
        }
    }
}

/// A cloneable handle to one shared permit pool.
#[derive(Clone)]
pub struct AdaptiveSemaphore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AdaptiveSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSemaphore")
            .field("name", &self.shared.name)
            .field("limit", &self.shared.limit)
            .field("available", &self.available())
            .finish()
    }
}

/// Held permit. Dropping it returns the slot and wakes one blocked thread.
pub struct AdaptivePermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
    path: AcquirePath,
}

impl AdaptivePermit {
    pub fn path(&self) -> AcquirePath {
        self.path
    }
}

impl Drop for AdaptivePermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.shared.notify();
    }
}

impl AdaptiveSemaphore {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                limit,
                permits: Arc::new(Semaphore::new(limit)),
                released: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn limit(&self) -> usize {
        self.shared.limit
    }

    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Acquire a permit, choosing the path from the calling context.
    pub async fn acquire(&self) -> Result<AdaptivePermit, SemaphoreClosed> {
        if Handle::try_current().is_ok() {
            let permit = self
                .shared
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SemaphoreClosed(self.shared.name.clone()))?;
            return Ok(self.wrap(permit, AcquirePath::Native));
        }

        debug!(semaphore = %self.shared.name, "no tokio runtime, using blocking adapter");
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            let result = shared.acquire_blocking();
            if let Err(Ok(permit)) = tx.send(result) {
                // Receiver gone: hand the slot back.
                drop(permit);
                shared.notify();
            }
        });
        let permit = rx
            .await
            .map_err(|_| SemaphoreClosed(self.shared.name.clone()))??;
        Ok(self.wrap(permit, AcquirePath::Blocking))
    }

    /// Acquire from a thread that is not driven by an async executor.
    ///
    /// Must not be called from inside a tokio worker; it parks the thread.
    pub fn acquire_blocking(&self) -> Result<AdaptivePermit, SemaphoreClosed> {
        let permit = self.shared.acquire_blocking()?;
        Ok(self.wrap(permit, AcquirePath::Blocking))
    }

    pub fn close(&self) {
        self.shared.permits.close();
        self.shared.wakeup.notify_all();
    }

    fn wrap(&self, permit: OwnedSemaphorePermit, path: AcquirePath) -> AdaptivePermit {
        AdaptivePermit {
            permit: Some(permit),
            shared: self.shared.clone(),
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_native_path_inside_runtime() {
        let sem = AdaptiveSemaphore::new("test", 2);
        let a = sem.acquire().await.unwrap();
        let b = sem.acquire().await.unwrap();
        assert_eq!(a.path(), AcquirePath::Native);
        assert_eq!(sem.available(), 0);
        drop(a);
        assert_eq!(sem.available(), 1);
        drop(b);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_blocking_path_bounds_os_threads() {
        let sem = AdaptiveSemaphore::new("threads", 2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let sem = sem.clone();
                let current = current.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    let permit = sem.acquire_blocking().unwrap();
                    assert_eq!(permit.path(), AcquirePath::Blocking);
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sem.available(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_waits_for_task_permit() {
        let sem = AdaptiveSemaphore::new("mixed", 1);
        let held = sem.acquire().await.unwrap();

        let sem2 = sem.clone();
        let waiter = std::thread::spawn(move || sem2.acquire_blocking().map(|p| p.path()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), AcquirePath::Blocking);
    }

    struct ThreadWaker(std::thread::Thread);

    impl std::task::Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    /// Minimal executor for driving a future on a thread with no runtime.
    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        use std::task::{Context, Poll, Waker};
        let mut fut = std::pin::pin!(fut);
        let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
            std::thread::park();
        }
    }

    #[test]
    fn test_async_acquire_without_runtime_shares_pool() {
        let sem = AdaptiveSemaphore::new("no-runtime", 2);
        // One slot stays taken by a blocking caller for the whole run.
        let held = sem.acquire_blocking().unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                let current = current.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    assert!(Handle::try_current().is_err());
                    let permit = block_on(sem.acquire()).unwrap();
                    assert_eq!(permit.path(), AcquirePath::Blocking);
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(sem.available(), 1);
        drop(held);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_closed_semaphore_errors() {
        let sem = AdaptiveSemaphore::new("closed", 1);
        sem.close();
        assert!(sem.acquire_blocking().is_err());
    }
}
