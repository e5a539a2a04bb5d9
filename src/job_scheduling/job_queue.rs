//! Job queue with priority ordering and resource admission control
//!
//! Jobs move through three lists, always under the queue mutex:
//! `waiting` (priority order, FIFO within a priority), `ready` (resources
//! secured, FIFO except canceled jobs which jump the line) and `running`.
//! Promotion from waiting to ready happens in the worker loop, see
//! `job_queue_runner`.

use super::job_context::JobHandle;
use super::job_queue_runner::JobEngine;
use super::registry::JobRegistry;
use super::types::{JobStatus, JobType};
use crate::config::DirectorConfig;
use crate::errors::QueueError;
use crate::resources::{ClientResource, StorageResource};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Resources a job holds a concurrency slot on while it runs
#[derive(Debug, Clone)]
pub struct ResourceClaim {
    pub job_type: JobType,
    pub storage: Arc<StorageResource>,
    pub client: Arc<ClientResource>,
    /// Job definition name
    pub job: String,
    /// MaxConcurrentJobs of the job definition
    pub job_limit: u32,
}

/// Concurrency counters of every storage, client and job definition
#[derive(Debug, Default)]
pub struct AdmissionLedger {
    storage: HashMap<String, u32>,
    client: HashMap<String, u32>,
    job: HashMap<String, u32>,
}

/// Copy of the ledger's non-zero counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub storage: BTreeMap<String, u32>,
    pub client: BTreeMap<String, u32>,
    pub job: BTreeMap<String, u32>,
}

fn decrement(counters: &mut HashMap<String, u32>, name: &str) {
    if let Some(count) = counters.get_mut(name) {
        *count = count.saturating_sub(1);
    }
}

fn non_zero(counters: &HashMap<String, u32>) -> BTreeMap<String, u32> {
    counters
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(name, count)| (name.clone(), *count))
        .collect()
}

impl AdmissionLedger {
    pub fn storage_in_use(&self, name: &str) -> u32 {
        self.storage.get(name).copied().unwrap_or(0)
    }

    /// Take a slot on the storage, the client and the job definition, in that
    /// order, backing out whatever was taken if a later one is full.
    ///
    /// `pool_conflict` is only consulted when the storage already has jobs.
    /// On failure the status the job is now waiting in is returned.
    pub fn try_acquire(
        &mut self,
        claim: &ResourceClaim,
        pool_conflict: impl FnOnce() -> bool,
    ) -> Result<(), JobStatus> {
        let storage = self.storage.entry(claim.storage.name.clone()).or_insert(0);
        let storage_max = claim.storage.max_concurrent_jobs;
        if claim.job_type.needs_exclusive_storage() {
            // one read job per storage regardless of its limit
            if *storage == 0 {
                *storage = 1;
            } else {
                return Err(JobStatus::WaitStoreRes);
            }
        } else if *storage == 0 && 0 < storage_max {
            *storage = 1;
        } else if *storage < storage_max {
            if pool_conflict() {
                return Err(JobStatus::WaitStoreRes);
            }
            *storage += 1;
        } else {
            return Err(JobStatus::WaitStoreRes);
        }

        let client = self.client.entry(claim.client.name.clone()).or_insert(0);
        if *client < claim.client.max_concurrent_jobs {
            *client += 1;
        } else {
            decrement(&mut self.storage, &claim.storage.name);
            return Err(JobStatus::WaitClientRes);
        }

        let job = self.job.entry(claim.job.clone()).or_insert(0);
        if *job < claim.job_limit {
            *job += 1;
        } else {
            decrement(&mut self.storage, &claim.storage.name);
            decrement(&mut self.client, &claim.client.name);
            return Err(JobStatus::WaitJobRes);
        }
        Ok(())
    }

    pub fn release(&mut self, claim: &ResourceClaim) {
        decrement(&mut self.storage, &claim.storage.name);
        decrement(&mut self.client, &claim.client.name);
        decrement(&mut self.job, &claim.job);
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            storage: non_zero(&self.storage),
            client: non_zero(&self.client),
            job: non_zero(&self.job),
        }
    }
}

/// Worker pool and timing settings
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub start_time_recheck: Duration,
}

impl From<&DirectorConfig> for QueueSettings {
    fn from(config: &DirectorConfig) -> Self {
        Self {
            max_workers: config.max_concurrent_jobs.max(1),
            idle_timeout: config.worker_idle_timeout,
            poll_interval: config.queue_poll_interval,
            start_time_recheck: config.start_time_recheck,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&DirectorConfig::default())
    }
}

#[derive(Default)]
pub(super) struct QueueState {
    pub(super) waiting: VecDeque<JobHandle>,
    pub(super) ready: VecDeque<JobHandle>,
    pub(super) running: Vec<JobHandle>,
    pub(super) ledger: AdmissionLedger,
    pub(super) num_workers: usize,
    pub(super) idle_workers: usize,
    pub(super) quit: bool,
    /// Waiter tasks holding jobs until their start time
    pub(super) parked: usize,
    pub(super) admitted_total: u64,
    pub(super) completed_total: u64,
}

/// Queue statistics for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct JobQueueStats {
    pub waiting_jobs: usize,
    pub ready_jobs: usize,
    pub running_jobs: usize,
    pub num_workers: usize,
    pub idle_workers: usize,
    pub max_workers: usize,
    pub admitted_total: u64,
    pub completed_total: u64,
}

/// The admission control and worker pool core
pub struct JobQueue {
    pub(super) settings: QueueSettings,
    pub(super) state: Mutex<QueueState>,
    /// Work available for an idle worker
    pub(super) work: Notify,
    /// The last worker exited after a shutdown request
    pub(super) drained: Notify,
    /// Canceled on shutdown to wake start time waiters
    pub(super) stopping: CancellationToken,
    pub(super) registry: Arc<JobRegistry>,
    pub(super) engine: Arc<dyn JobEngine>,
}

impl JobQueue {
    pub fn new(
        settings: QueueSettings,
        registry: Arc<JobRegistry>,
        engine: Arc<dyn JobEngine>,
    ) -> Arc<Self> {
        debug!(
            "Creating job queue with up to {} workers",
            settings.max_workers
        );
        Arc::new(Self {
            settings,
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            drained: Notify::new(),
            stopping: CancellationToken::new(),
            registry,
            engine,
        })
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Hand a job to the queue
    ///
    /// A job scheduled in the future is parked on a waiter task that
    /// re-submits it when due. A canceled job goes to the front of `ready`
    /// so a worker reaps it promptly; anything else is inserted into
    /// `waiting` ahead of the first job with a numerically greater priority.
    /// Admission itself is decided later by the workers.
    pub fn add(self: &Arc<Self>, job: JobHandle) -> Result<(), QueueError> {
        let delay = job.sched_time() - Utc::now();
        if !job.is_canceled() && delay > chrono::TimeDelta::zero() {
            return self.park_until_start_time(job);
        }

        let mut state = self.lock();
        if state.quit {
            warn!("Job queue is shut down, dropping job {}", job.name());
            return Err(QueueError::ShutDown);
        }

        if job.is_canceled() {
            debug!("Prepended canceled job {} to ready queue", job.name());
            state.ready.push_front(job);
        } else {
            let priority = job.priority();
            let position = state
                .waiting
                .iter()
                .position(|queued| queued.priority() > priority);
            match position {
                Some(index) => {
                    debug!(
                        "Inserted job {} (priority {}) at waiting position {}",
                        job.name(),
                        priority,
                        index
                    );
                    state.waiting.insert(index, job);
                }
                None => {
                    debug!(
                        "Appended job {} (priority {}) to waiting queue",
                        job.name(),
                        priority
                    );
                    state.waiting.push_back(job);
                }
            }
        }

        self.start_server(&mut state)
    }

    fn park_until_start_time(self: &Arc<Self>, job: JobHandle) -> Result<(), QueueError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| QueueError::Spawn {
            message: e.to_string(),
        })?;
        {
            let mut state = self.lock();
            if state.quit {
                return Err(QueueError::ShutDown);
            }
            state.parked += 1;
        }
        job.mark_waiting(JobStatus::WaitStartTime);
        debug!(
            "Job {} waiting for start time {}",
            job.name(),
            job.sched_time().format("%Y-%m-%d %H:%M:%S UTC")
        );
        let queue = self.clone();
        runtime.spawn(async move { queue.wait_for_start_time(job).await });
        Ok(())
    }

    /// Sleep in bounded steps until the job is due or canceled, then re-submit it
    async fn wait_for_start_time(self: Arc<Self>, job: JobHandle) {
        loop {
            let remaining = (job.sched_time() - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break;
            }
            let nap = remaining.min(self.settings.start_time_recheck);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = job.cancellation().cancelled() => {}
                _ = self.stopping.cancelled() => {}
            }
            if job.is_canceled() {
                debug!("Job {} canceled while waiting for its start time", job.name());
                break;
            }
            if self.stopping.is_cancelled() {
                debug!("Job {} stopped waiting for its start time on shutdown", job.name());
                break;
            }
        }
        if let Err(e) = self.add(job.clone()) {
            warn!("Could not queue job {} after start time wait: {}", job.name(), e);
            self.engine.abandon(&job).await;
        }
        let mut state = self.lock();
        state.parked = state.parked.saturating_sub(1);
        if state.parked == 0 && state.num_workers == 0 {
            self.drained.notify_one();
        }
    }

    /// Fast-track a canceled job from `waiting` to the front of `ready`
    pub fn remove(self: &Arc<Self>, job: &JobHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        let Some(index) = state.waiting.iter().position(|j| j.key() == job.key()) else {
            debug!("Job {} is not in the wait queue", job.name());
            return Err(QueueError::NotWaiting { job: job.name() });
        };
        if let Some(entry) = state.waiting.remove(index) {
            state.ready.push_front(entry);
        }
        debug!("Moved job {} to the front of the ready queue", job.name());
        self.start_server(&mut state)
    }

    /// Move every admissible waiting job to `ready`
    ///
    /// Only jobs with the priority of the oldest running job (or, with nothing
    /// running, of the head of `waiting`) are considered; the first job with
    /// another priority ends the pass. A job that cannot get its resources is
    /// skipped and the pass continues behind it.
    pub(super) fn promote_waiting(&self, state: &mut QueueState) {
        if state.quit {
            return;
        }
        let Some(barrier) = state
            .running
            .first()
            .or(state.waiting.front())
            .map(|job| job.priority())
        else {
            return;
        };

        let mut index = 0;
        while index < state.waiting.len() {
            let job = state.waiting[index].clone();
            if job.priority() != barrier {
                job.mark_waiting(JobStatus::WaitPriority);
                break;
            }

            let Some(claim) = job.claim() else {
                job.fail(JobStatus::ErrorTerminated, "No storage specified for job.");
                if let Some(entry) = state.waiting.remove(index) {
                    state.ready.push_back(entry);
                }
                continue;
            };

            match state.ledger.try_acquire(&claim, || self.pool_conflict(&job)) {
                Ok(()) => {
                    job.update(|s| s.acquired_resource_locks = true);
                    if let Some(entry) = state.waiting.remove(index) {
                        state.ready.push_back(entry);
                    }
                    state.admitted_total += 1;
                    debug!("Moved job {} from wait to ready queue", job.name());
                }
                Err(status) => {
                    job.mark_waiting(status);
                    index += 1;
                }
            }
        }
    }

    /// Another live job uses the same storage with a different pool
    fn pool_conflict(&self, job: &JobHandle) -> bool {
        let Some((storage, pool)) = job.storage_and_pool() else {
            return false;
        };
        self.registry.any(|other| {
            other.key() != job.key()
                && other.job_id() != 0
                && other
                    .storage_and_pool()
                    .is_some_and(|(s, p)| s == storage && p != pool)
        })
    }

    pub fn stats(&self) -> JobQueueStats {
        let state = self.lock();
        JobQueueStats {
            waiting_jobs: state.waiting.len(),
            ready_jobs: state.ready.len(),
            running_jobs: state.running.len(),
            num_workers: state.num_workers,
            idle_workers: state.idle_workers,
            max_workers: self.settings.max_workers,
            admitted_total: state.admitted_total,
            completed_total: state.completed_total,
        }
    }

    pub fn waiting_jobs(&self) -> Vec<JobHandle> {
        self.lock().waiting.iter().cloned().collect()
    }

    pub fn ready_jobs(&self) -> Vec<JobHandle> {
        self.lock().ready.iter().cloned().collect()
    }

    pub fn running_jobs(&self) -> Vec<JobHandle> {
        self.lock().running.clone()
    }

    /// Current concurrency counters
    pub fn resource_usage(&self) -> ResourceUsage {
        self.lock().ledger.usage()
    }
}
