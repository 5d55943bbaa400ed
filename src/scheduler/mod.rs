// Batch scheduling: worker leases, conflict-group locks, progress

mod layout;
mod process;
mod report;

pub use layout::{JobDescriptor, RunLayout};
pub use process::{LaunchSpec, ProcessExecutor};
pub use report::{
    ExecutionReport, ReportDetails, ReportSummary, RunConfiguration, Verdict, VerdictSummary,
    analyze_artifacts, classify_artifact,
};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
}

/// Process-level result of one job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: ExecutionStatus,
    pub elapsed: Duration,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn failed(job: &JobDescriptor, elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            status: ExecutionStatus::Failed,
            elapsed,
            log_path: None,
            exit_code: None,
            error: Some(error.into()),
        }
    }
}

/// Runs a single job to a terminal outcome within `timeout`.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &JobDescriptor, timeout: Duration) -> JobOutcome;
}

/// Mutual-exclusion locks keyed by job name. Every member of one group
/// shares the same lock.
#[derive(Debug, Default)]
pub struct ConflictGroups {
    locks: HashMap<String, (usize, Arc<tokio::sync::Mutex<()>>)>,
    groups: usize,
}

impl ConflictGroups {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        let mut locks = HashMap::new();
        let count = groups.len();
        for (idx, members) in groups.into_iter().enumerate() {
            let lock = Arc::new(tokio::sync::Mutex::new(()));
            for name in members {
                if let Some((prev, _)) = locks.insert(name.clone(), (idx, lock.clone())) {
                    warn!(job = %name, previous = prev, group = idx, "job listed in several conflict groups, last one wins");
                }
            }
        }
        info!(groups = count, jobs = locks.len(), "conflict groups loaded");
        Self { locks, groups: count }
    }

    pub fn group_of(&self, job_name: &str) -> Option<usize> {
        self.locks.get(job_name).map(|(idx, _)| *idx)
    }

    fn lock_for(&self, job_name: &str) -> Option<(usize, Arc<tokio::sync::Mutex<()>>)> {
        self.locks.get(job_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups == 0
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub per_job_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 100,
            per_job_timeout: Duration::from_secs(1800),
            progress_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    timeouts: AtomicUsize,
    running: AtomicUsize,
}

/// Point-in-time view of a batch. `failed` includes timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeouts: usize,
    pub running: usize,
    pub waiting_for_lock: usize,
    pub elapsed: Duration,
    pub workers: usize,
}

impl ProgressSnapshot {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed + self.failed)
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "completed {}/{}, failed {} (timeouts {}), running {}/{}, waiting for lock {}, remaining {}, elapsed {:.1}s",
            self.completed,
            self.total,
            self.failed,
            self.timeouts,
            self.running,
            self.workers,
            self.waiting_for_lock,
            self.remaining(),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Runs a batch of jobs with at most `worker_count` executing at once.
///
/// A job in a conflict group takes the group lock first and only then a
/// worker lease, so a job blocked on a peer never occupies a slot.
pub struct TaskScheduler<E: JobExecutor> {
    executor: Arc<E>,
    groups: Arc<ConflictGroups>,
    config: SchedulerConfig,
    leases: Arc<Semaphore>,
    waiting: Arc<Mutex<BTreeSet<String>>>,
    counters: Arc<Counters>,
    started: Mutex<Option<Instant>>,
}

impl<E: JobExecutor> TaskScheduler<E> {
    pub fn new(executor: E, groups: ConflictGroups, config: SchedulerConfig) -> Self {
        let workers = config.worker_count.max(1);
        Self {
            executor: Arc::new(executor),
            groups: Arc::new(groups),
            leases: Arc::new(Semaphore::new(workers)),
            config: SchedulerConfig {
                worker_count: workers,
                ..config
            },
            waiting: Arc::new(Mutex::new(BTreeSet::new())),
            counters: Arc::new(Counters::default()),
            started: Mutex::new(None),
        }
    }

    /// Jobs currently blocked on a conflict-group lock.
    pub fn waiting_for_lock(&self) -> Vec<String> {
        lock_set(&self.waiting).iter().cloned().collect()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let started = *self.started.lock().unwrap_or_else(|p| p.into_inner());
        snapshot(
            &self.counters,
            &self.waiting,
            started.map(|s| s.elapsed()).unwrap_or_default(),
            self.config.worker_count,
        )
    }

    /// Run every job exactly once and return its outcome keyed by job id.
    /// Duplicate ids are run once and logged.
    pub async fn run(&self, jobs: Vec<JobDescriptor>) -> BTreeMap<String, JobOutcome> {
        let jobs = dedupe_jobs(jobs);
        let started = Instant::now();
        *self.started.lock().unwrap_or_else(|p| p.into_inner()) = Some(started);
        self.counters.total.store(jobs.len(), Ordering::SeqCst);
        info!(
            jobs = jobs.len(),
            workers = self.config.worker_count,
            timeout_secs = self.config.per_job_timeout.as_secs(),
            conflict_groups = self.groups.len(),
            "starting batch"
        );

        let reporter = self.spawn_progress_reporter(started);

        let mut set = JoinSet::new();
        let mut ids = HashMap::new();
        for job in jobs {
            let ctx = JobContext {
                executor: self.executor.clone(),
                groups: self.groups.clone(),
                leases: self.leases.clone(),
                waiting: self.waiting.clone(),
                counters: self.counters.clone(),
                timeout: self.config.per_job_timeout,
            };
            let id = job.id.clone();
            let handle = set.spawn(run_job(job, ctx));
            ids.insert(handle.id(), id);
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => {
                    outcomes.insert(outcome.job_id.clone(), outcome);
                }
                Err(e) => {
                    let Some(id) = ids.get(&e.id()).cloned() else {
                        error!(error = %e, "job task failed with unknown id");
                        continue;
                    };
                    error!(job = %id, error = %e, "job task panicked");
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    let job = JobDescriptor::new(id.clone());
                    outcomes.insert(id, JobOutcome::failed(&job, Duration::ZERO, format!("job task aborted: {e}")));
                }
            }
        }

        reporter.abort();
        info!(progress = %self.progress(), "batch complete");
        for outcome in outcomes.values().filter(|o| o.status != ExecutionStatus::Success) {
            warn!(
                job = %outcome.job_id,
                status = ?outcome.status,
                error = outcome.error.as_deref().unwrap_or("N/A"),
                "job did not succeed"
            );
        }
        outcomes
    }

    fn spawn_progress_reporter(&self, started: Instant) -> tokio::task::JoinHandle<()> {
        let counters = self.counters.clone();
        let waiting = self.waiting.clone();
        let period = self.config.progress_interval.max(Duration::from_secs(1));
        let workers = self.config.worker_count;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(started + period, period);
            loop {
                ticker.tick().await;
                let snap = snapshot(&counters, &waiting, started.elapsed(), workers);
                info!(progress = %snap, "batch progress");
            }
        })
    }
}

struct JobContext<E: JobExecutor> {
    executor: Arc<E>,
    groups: Arc<ConflictGroups>,
    leases: Arc<Semaphore>,
    waiting: Arc<Mutex<BTreeSet<String>>>,
    counters: Arc<Counters>,
    timeout: Duration,
}

async fn run_job<E: JobExecutor>(job: JobDescriptor, ctx: JobContext<E>) -> JobOutcome {
    let queued = Instant::now();

    let _group: Option<OwnedMutexGuard<()>> = match ctx.groups.lock_for(job.name()) {
        Some((idx, lock)) => match lock.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                lock_set(&ctx.waiting).insert(job.id.clone());
                info!(job = %job.id, group = idx, "waiting for conflict group lock");
                let guard = lock.lock_owned().await;
                lock_set(&ctx.waiting).remove(&job.id);
                info!(job = %job.id, group = idx, "acquired conflict group lock");
                Some(guard)
            }
        },
        None => None,
    };

    // Declared after the group guard so it is released first.
    let _lease = match ctx.leases.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
            return JobOutcome::failed(&job, queued.elapsed(), "worker pool closed");
        }
    };

    let outcome = {
        let _running = RunningGuard::enter(&ctx.counters.running);
        ctx.executor.execute(&job, ctx.timeout).await
    };

    match outcome.status {
        ExecutionStatus::Success => {
            ctx.counters.completed.fetch_add(1, Ordering::SeqCst);
            info!(job = %job.id, elapsed_secs = outcome.elapsed.as_secs_f64(), "job finished");
        }
        ExecutionStatus::Timeout => {
            ctx.counters.timeouts.fetch_add(1, Ordering::SeqCst);
            ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!(job = %job.id, "job timed out");
        }
        ExecutionStatus::Failed => {
            ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!(job = %job.id, error = outcome.error.as_deref().unwrap_or("unknown"), "job failed");
        }
    }
    outcome
}

/// Counts a job as running until dropped, unwinding included.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn dedupe_jobs(jobs: Vec<JobDescriptor>) -> Vec<JobDescriptor> {
    let mut seen = BTreeSet::new();
    jobs.into_iter()
        .filter(|job| {
            let fresh = seen.insert(job.id.clone());
            if !fresh {
                warn!(job = %job.id, "duplicate job id, running it once");
            }
            fresh
        })
        .collect()
}

fn lock_set(set: &Mutex<BTreeSet<String>>) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
    set.lock().unwrap_or_else(|p| p.into_inner())
}

fn snapshot(
    counters: &Counters,
    waiting: &Mutex<BTreeSet<String>>,
    elapsed: Duration,
    workers: usize,
) -> ProgressSnapshot {
    ProgressSnapshot {
        total: counters.total.load(Ordering::SeqCst),
        completed: counters.completed.load(Ordering::SeqCst),
        failed: counters.failed.load(Ordering::SeqCst),
        timeouts: counters.timeouts.load(Ordering::SeqCst),
        running: counters.running.load(Ordering::SeqCst),
        waiting_for_lock: lock_set(waiting).len(),
        elapsed,
        workers,
    }
}
