//! Registry of live job contexts
//!
//! Holds weak references so a finished job disappears even if nobody
//! unregisters it. Used by the queue's pool check, the watchdog, cancellation
//! by name and status reporting.

use super::job_context::{JobContext, JobHandle};
use super::types::JobId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, Weak};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Weak<JobContext>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: &JobHandle) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|_, weak| weak.strong_count() > 0);
        jobs.insert(job.key(), std::sync::Arc::downgrade(job));
        debug!("Registered job {} ({} live)", job.key(), jobs.len());
    }

    pub fn unregister(&self, key: Uuid) -> bool {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some()
    }

    /// Visit every live job while holding the registry's shared lock
    pub fn for_each(&self, mut f: impl FnMut(&JobHandle)) {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        for job in jobs.values().filter_map(Weak::upgrade) {
            f(&job);
        }
    }

    /// Whether any live job satisfies the predicate
    pub fn any(&self, mut f: impl FnMut(&JobHandle) -> bool) -> bool {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.values().filter_map(Weak::upgrade).any(|job| f(&job))
    }

    /// Strong handles to every live job, ordered by JobId
    pub fn snapshot(&self) -> Vec<JobHandle> {
        let mut live: Vec<JobHandle> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        live.sort_by_key(|job| job.job_id());
        live
    }

    pub fn find_by_job_id(&self, job_id: JobId) -> Option<JobHandle> {
        self.snapshot()
            .into_iter()
            .find(|job| job.job_id() == job_id)
    }

    /// Match either the unique job name or the definition name
    pub fn find_by_name(&self, name: &str) -> Option<JobHandle> {
        self.snapshot()
            .into_iter()
            .find(|job| job.name() == name || job.definition().name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
