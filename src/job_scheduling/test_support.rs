//! Fixtures shared by the job scheduling unit tests

use super::handlers::{DaemonKind, DaemonSession};
use super::job_context::{JobContext, JobHandle};
use super::job_queue::{JobQueue, QueueSettings};
use super::job_queue_runner::JobEngine;
use super::registry::JobRegistry;
use super::types::{JobId, JobStatus, JobType};
use crate::errors::{DirectorResult, HandlerError, HandlerResult};
use crate::resources::{ClientResource, JobResource, PoolResource, StorageResource};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn client(name: &str, max_concurrent_jobs: u32) -> Arc<ClientResource> {
    Arc::new(ClientResource {
        name: name.to_string(),
        address: None,
        max_concurrent_jobs,
    })
}

pub fn storage(name: &str, max_concurrent_jobs: u32) -> Arc<StorageResource> {
    Arc::new(StorageResource {
        name: name.to_string(),
        address: None,
        media_type: Some("LTO".to_string()),
        max_concurrent_jobs,
    })
}

pub fn pool(name: &str) -> Arc<PoolResource> {
    Arc::new(PoolResource {
        name: name.to_string(),
        pool_type: "Backup".to_string(),
        storage: vec![storage("tape", 1)],
    })
}

/// Definition on client "web", pool "default" and storage "tape"
pub fn job_definition(name: &str, job_type: JobType, priority: u32) -> Arc<JobResource> {
    let mut job = JobResource::new(name, job_type, client("web", 1), pool("default"));
    job.priority = priority;
    Arc::new(job)
}

/// Engine that records the order jobs run in and finishes them instantly,
/// or, when holding, only once they are canceled
pub struct RecordingEngine {
    pub registry: Arc<JobRegistry>,
    next_id: AtomicU32,
    hold: AtomicBool,
    fail: AtomicBool,
    started: Mutex<Vec<String>>,
    finished: AtomicUsize,
    abandoned: AtomicUsize,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(JobRegistry::new()),
            next_id: AtomicU32::new(0),
            hold: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        })
    }

    pub fn holding() -> Arc<Self> {
        let engine = Self::new();
        engine.hold.store(true, Ordering::Release);
        engine
    }

    /// Every run ends in ErrorTerminated
    pub fn failing() -> Arc<Self> {
        let engine = Self::new();
        engine.fail.store(true, Ordering::Release);
        engine
    }

    pub fn queue(self: &Arc<Self>, settings: QueueSettings) -> Arc<JobQueue> {
        JobQueue::new(settings, self.registry.clone(), self.clone())
    }

    pub fn job(&self, name: &str, priority: u32, storage_name: &str, pool_name: &str) -> JobHandle {
        self.job_with_limits(name, priority, storage_name, pool_name, 1)
    }

    /// A registered job with a JobId; `limit` applies to its storage and definition
    pub fn job_with_limits(
        &self,
        name: &str,
        priority: u32,
        storage_name: &str,
        pool_name: &str,
        limit: u32,
    ) -> JobHandle {
        let mut definition =
            JobResource::new(name, JobType::Backup, client("web", 10), pool(pool_name));
        definition.priority = priority;
        definition.max_concurrent_jobs = limit;
        definition.storage = vec![storage(storage_name, limit)];
        self.adopt(Arc::new(definition))
    }

    /// New registered instance of `definition` with a JobId
    pub fn adopt(&self, definition: Arc<JobResource>) -> JobHandle {
        let job = JobContext::new(definition);
        let job_id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        job.update(|s| s.job_id = job_id);
        self.registry.register(&job);
        job
    }

    /// Definition names in the order their jobs started running
    pub fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    /// Jobs finalised without ever reaching a worker
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::Acquire)
    }

    pub async fn wait_finished(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.finished() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("jobs did not finish in time");
    }

    pub async fn wait_started(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.started().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("jobs did not start in time");
    }
}

#[async_trait]
impl JobEngine for RecordingEngine {
    async fn prepare(&self, job: &JobHandle) -> DirectorResult<JobId> {
        let job_id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        job.update(|s| {
            s.job_id = job_id;
            s.status = JobStatus::Created;
        });
        self.registry.register(job);
        Ok(job_id)
    }

    async fn run(&self, job: &JobHandle) {
        self.started
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(job.definition().name.clone());
        if self.hold.load(Ordering::Acquire) && !job.is_canceled() {
            job.set_status(JobStatus::Running);
            job.cancellation().cancelled().await;
        }
        if self.fail.load(Ordering::Acquire) {
            job.fail(JobStatus::ErrorTerminated, "simulated failure");
        } else if !job.is_canceled() {
            job.set_status(JobStatus::Terminated);
        }
    }

    async fn release(&self, job: &JobHandle) {
        self.registry.unregister(job.key());
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    async fn abandon(&self, job: &JobHandle) {
        job.update(|s| {
            if !s.status.is_terminal() {
                s.status = JobStatus::Canceled;
            }
        });
        self.abandoned.fetch_add(1, Ordering::AcqRel);
        self.release(job).await;
    }
}

/// Daemon session that remembers the cancel requests it was sent
pub struct RecordingSession {
    kind: DaemonKind,
    fail_cancel: bool,
    pub cancels: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl RecordingSession {
    pub fn new(kind: DaemonKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_cancel: false,
            cancels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn unreachable(kind: DaemonKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_cancel: true,
            cancels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DaemonSession for RecordingSession {
    fn kind(&self) -> DaemonKind {
        self.kind
    }

    async fn send_cancel(&self, job: &str) -> HandlerResult<()> {
        if self.fail_cancel {
            return Err(HandlerError::Daemon {
                daemon: self.kind.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.cancels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(format!("cancel Job={job}"));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
