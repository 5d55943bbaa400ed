//! Shared concurrency primitives for outbound calls: adaptive semaphores,
//! a sliding-window limiter, backoff retry and cost accounting.

pub mod cost;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod semaphore;

pub use cost::{CostLedger, CostRecord, CostSummary, ModelUsage, Price, PriceTable};
pub use rate_limit::SlidingWindowLimiter;
pub use registry::ConcurrencyRegistry;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use semaphore::{AcquirePath, AdaptivePermit, AdaptiveSemaphore, SemaphoreClosed};
