//! Live execution record of one job instance

use super::handlers::DaemonSession;
use super::job_queue::ResourceClaim;
use super::types::{JobId, JobLevel, JobStatus, JobType};
use crate::catalog::{CatalogConnection, JobRecord};
use crate::resources::{ClientResource, JobResource, PoolResource, RunSpec, StorageResource};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared handle to a job context
pub type JobHandle = Arc<JobContext>;

/// Mutable part of a job context
pub struct JobState {
    pub job_id: JobId,
    /// Unique job name; the definition name until the job is set up
    pub job: String,
    pub job_type: JobType,
    pub level: JobLevel,
    pub priority: u32,
    pub status: JobStatus,
    pub client: Arc<ClientResource>,
    pub storage: Vec<Arc<StorageResource>>,
    pub pool: Arc<PoolResource>,
    pub full_pool: Option<Arc<PoolResource>>,
    pub incremental_pool: Option<Arc<PoolResource>>,
    pub differential_pool: Option<Arc<PoolResource>>,
    pub pool_source: String,
    pub run_pool_override: bool,
    pub run_full_pool_override: bool,
    pub run_incremental_pool_override: bool,
    pub run_differential_pool_override: bool,
    pub fileset: Option<String>,
    pub messages: Option<String>,
    pub spool_data: bool,
    pub sched_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reschedule_count: u32,
    pub acquired_resource_locks: bool,
    pub job_bytes: u64,
    pub job_files: u64,
    pub client_id: Option<u64>,
    pub file_daemon: Option<Arc<dyn DaemonSession>>,
    pub storage_daemon: Option<Arc<dyn DaemonSession>>,
    pub catalog: Option<Arc<dyn CatalogConnection>>,
    pending_messages: Vec<String>,
}

/// One job instance: identity, resources, status and daemon sessions
pub struct JobContext {
    key: Uuid,
    definition: Arc<JobResource>,
    state: Mutex<JobState>,
    cancel: CancellationToken,
}

impl JobContext {
    /// New instance with every default taken from its definition
    pub fn new(definition: Arc<JobResource>) -> JobHandle {
        let job_type = definition.job_type;
        let level = match job_type {
            JobType::Admin | JobType::Restore => JobLevel::None,
            _ => definition
                .level
                .unwrap_or_else(|| JobLevel::default_for(job_type)),
        };
        let state = JobState {
            job_id: 0,
            job: definition.name.clone(),
            job_type,
            level,
            priority: definition.priority,
            status: JobStatus::Created,
            client: definition.client.clone(),
            storage: definition.default_storage().to_vec(),
            pool: definition.pool.clone(),
            full_pool: definition.full_pool.clone(),
            incremental_pool: definition.incremental_pool.clone(),
            differential_pool: definition.differential_pool.clone(),
            pool_source: "Job resource".to_string(),
            run_pool_override: false,
            run_full_pool_override: false,
            run_incremental_pool_override: false,
            run_differential_pool_override: false,
            fileset: definition.fileset.clone(),
            messages: definition.messages.clone(),
            spool_data: definition.spool_data,
            sched_time: Utc::now(),
            start_time: None,
            end_time: None,
            reschedule_count: 0,
            acquired_resource_locks: false,
            job_bytes: 0,
            job_files: 0,
            client_id: None,
            file_daemon: None,
            storage_daemon: None,
            catalog: None,
            pending_messages: Vec::new(),
        };
        Arc::new(Self {
            key: Uuid::new_v4(),
            definition,
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
        })
    }

    /// Fresh instance that continues this one under a new JobId
    pub fn respawn(&self) -> JobHandle {
        let fresh = Self::new(self.definition.clone());
        {
            let old = self.state();
            let mut new = fresh.state();
            new.reschedule_count = old.reschedule_count;
            new.level = old.level;
            new.status = old.status;
            new.storage = old.storage.clone();
            new.messages = old.messages.clone();
            new.sched_time = old.sched_time;
        }
        fresh
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a closure against the mutable state
    pub fn update<R>(&self, f: impl FnOnce(&mut JobState) -> R) -> R {
        f(&mut self.state())
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn definition(&self) -> &Arc<JobResource> {
        &self.definition
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn job_id(&self) -> JobId {
        self.state().job_id
    }

    /// Unique job name
    pub fn name(&self) -> String {
        self.state().job.clone()
    }

    pub fn job_type(&self) -> JobType {
        self.state().job_type
    }

    pub fn level(&self) -> JobLevel {
        self.state().level
    }

    pub fn priority(&self) -> u32 {
        self.state().priority
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn sched_time(&self) -> DateTime<Utc> {
        self.state().sched_time
    }

    pub fn is_canceled(&self) -> bool {
        self.state().status.is_canceled()
    }

    pub fn set_status(&self, status: JobStatus) {
        self.state().status = status;
    }

    /// Record why the job is still queued; a canceled job keeps its status
    pub fn mark_waiting(&self, status: JobStatus) -> bool {
        let mut state = self.state();
        if state.status.is_canceled() {
            return false;
        }
        state.status = status;
        true
    }

    /// Mark canceled and wake anything watching the cancellation token
    pub fn mark_canceled(&self) -> JobStatus {
        let old = {
            let mut state = self.state();
            std::mem::replace(&mut state.status, JobStatus::Canceled)
        };
        self.cancel.cancel();
        old
    }

    /// Set an error status unless the job was already canceled
    pub fn fail(&self, status: JobStatus, message: impl Into<String>) {
        let mut state = self.state();
        if !state.status.is_canceled() {
            state.status = status;
        }
        state.pending_messages.push(message.into());
    }

    /// Queue a job message for delivery when the job ends
    pub fn queue_message(&self, message: impl Into<String>) {
        self.state().pending_messages.push(message.into());
    }

    pub fn take_messages(&self) -> Vec<String> {
        std::mem::take(&mut self.state().pending_messages)
    }

    /// Account data written by the job
    pub fn record_transfer(&self, bytes: u64, files: u64) {
        let mut state = self.state();
        state.job_bytes += bytes;
        state.job_files += files;
    }

    pub fn job_bytes(&self) -> u64 {
        self.state().job_bytes
    }

    pub fn attach_session(&self, session: Arc<dyn DaemonSession>) {
        use super::handlers::DaemonKind;
        let mut state = self.state();
        match session.kind() {
            DaemonKind::FileDaemon => state.file_daemon = Some(session),
            DaemonKind::StorageDaemon => state.storage_daemon = Some(session),
        }
    }

    /// Detach both daemon sessions, file daemon first
    pub fn take_sessions(&self) -> Vec<Arc<dyn DaemonSession>> {
        let mut state = self.state();
        state
            .file_daemon
            .take()
            .into_iter()
            .chain(state.storage_daemon.take())
            .collect()
    }

    pub fn catalog(&self) -> Option<Arc<dyn CatalogConnection>> {
        self.state().catalog.clone()
    }

    /// Apply the overrides of the run clause that fired this job
    pub fn apply_run_overrides(&self, run: &RunSpec) {
        let mut state = self.state();
        if let Some(level) = run.level {
            state.level = level;
        }
        if let Some(pool) = &run.pool {
            state.pool = pool.clone();
            state.run_pool_override = true;
        }
        if let Some(pool) = &run.full_pool {
            state.full_pool = Some(pool.clone());
            state.run_full_pool_override = true;
        }
        if let Some(pool) = &run.incremental_pool {
            state.incremental_pool = Some(pool.clone());
            state.run_incremental_pool_override = true;
        }
        if let Some(pool) = &run.differential_pool {
            state.differential_pool = Some(pool.clone());
            state.run_differential_pool_override = true;
        }
        if let Some(storage) = &run.storage {
            state.storage = vec![storage.clone()];
        }
        if let Some(messages) = &run.messages {
            state.messages = Some(messages.clone());
        }
        if let Some(priority) = run.priority.filter(|p| *p > 0) {
            state.priority = priority;
        }
        if let Some(spool_data) = run.spool_data {
            state.spool_data = spool_data;
        }
    }

    /// Pick the level specific pool, recording where the pool came from
    pub fn apply_pool_overrides(&self) {
        let mut state = self.state();
        if state.run_pool_override {
            state.pool_source = "Run pool override".to_string();
        }
        let (pool, run_override, label) = match state.level {
            JobLevel::Full => (
                state.full_pool.clone(),
                state.run_full_pool_override,
                "FullPool",
            ),
            JobLevel::Incremental => (
                state.incremental_pool.clone(),
                state.run_incremental_pool_override,
                "IncPool",
            ),
            JobLevel::Differential => (
                state.differential_pool.clone(),
                state.run_differential_pool_override,
                "DiffPool",
            ),
            _ => return,
        };
        if let Some(pool) = pool {
            state.pool = pool;
            state.pool_source = if run_override {
                format!("Run {label} override")
            } else {
                format!("Job {label} override")
            };
        }
    }

    /// Resources the queue must secure before the job may run
    pub fn claim(&self) -> Option<ResourceClaim> {
        let state = self.state();
        let storage = state.storage.first()?.clone();
        Some(ResourceClaim {
            job_type: state.job_type,
            storage,
            client: state.client.clone(),
            job: self.definition.name.clone(),
            job_limit: self.definition.max_concurrent_jobs,
        })
    }

    /// Storage and pool names used by the pool exclusivity check
    pub fn storage_and_pool(&self) -> Option<(String, String)> {
        let state = self.state();
        let storage = state.storage.first()?;
        Some((storage.name.clone(), state.pool.name.clone()))
    }

    pub fn record(&self) -> JobRecord {
        let state = self.state();
        JobRecord {
            job_id: state.job_id,
            job: state.job.clone(),
            name: self.definition.name.clone(),
            job_type: state.job_type,
            level: state.level,
            status: state.status,
            client_id: state.client_id,
            pool: state.pool.name.clone(),
            sched_time: state.sched_time,
            start_time: state.start_time,
            end_time: state.end_time,
            job_bytes: state.job_bytes,
            job_files: state.job_files,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            job_id: state.job_id,
            job: state.job.clone(),
            name: self.definition.name.clone(),
            job_type: state.job_type,
            level: state.level,
            priority: state.priority,
            status: state.status,
            status_code: state.status.code(),
            client: state.client.name.clone(),
            storage: state.storage.iter().map(|s| s.name.clone()).collect(),
            pool: state.pool.name.clone(),
            pool_source: state.pool_source.clone(),
            sched_time: state.sched_time,
            start_time: state.start_time,
            reschedule_count: state.reschedule_count,
            job_bytes: state.job_bytes,
            job_files: state.job_files,
        }
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("JobContext")
            .field("job_id", &state.job_id)
            .field("job", &state.job)
            .field("priority", &state.priority)
            .field("status", &state.status)
            .finish()
    }
}

/// Point in time view of a job for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub job: String,
    pub name: String,
    pub job_type: JobType,
    pub level: JobLevel,
    pub priority: u32,
    pub status: JobStatus,
    pub status_code: char,
    pub client: String,
    pub storage: Vec<String>,
    pub pool: String,
    pub pool_source: String,
    pub sched_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub reschedule_count: u32,
    pub job_bytes: u64,
    pub job_files: u64,
}

/// Sequence shared by every job created in this process
static JOB_NAME_SEQUENCE: Mutex<JobNameSequence> = Mutex::new(JobNameSequence::new());

/// Sequence suffix for unique job names, at most sixty per second
#[derive(Debug)]
pub struct JobNameSequence {
    last_start: i64,
    seq: u32,
}

impl JobNameSequence {
    pub const fn new() -> Self {
        Self {
            last_start: 0,
            seq: 0,
        }
    }

    /// Next suffix for a job created at `now`, or `None` until the clock moves on
    pub fn next(&mut self, now: i64) -> Option<u32> {
        let mut seq = self.seq + 1;
        if seq > 59 {
            if now == self.last_start {
                return None;
            }
            seq = 0;
        }
        self.seq = seq;
        self.last_start = now;
        Some(seq)
    }
}

impl Default for JobNameSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// `<name>.<YYYY-MM-DD_HH.MM>.<seq>` with spaces turned into underscores
pub fn format_job_name(base: &str, at: DateTime<Local>, seq: u32) -> String {
    let base: String = base.chars().take(100).collect();
    format!("{}.{}.{:02}", base, at.format("%Y-%m-%d_%H.%M"), seq).replace(' ', "_")
}

/// Allocate a unique job name, waiting for the next second once sixty have been used
pub async fn create_unique_job_name(base: &str) -> String {
    loop {
        let now = Local::now();
        let next = JOB_NAME_SEQUENCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next(now.timestamp());
        match next {
            Some(seq) => return format_job_name(base, now, seq),
            None => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}
