//! Job type handlers and remote daemon sessions
//!
//! The protocol a job speaks with the file and storage daemons depends on its
//! type and lives outside the engine. The engine only needs to initialise a
//! job, run it, and cancel the daemon sessions it has open.

use super::job_context::JobHandle;
use super::types::JobType;
use crate::errors::HandlerResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::info;

/// Which remote daemon a session talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DaemonKind {
    #[strum(serialize = "File")]
    FileDaemon,
    #[strum(serialize = "Storage")]
    StorageDaemon,
}

/// An open session with a file or storage daemon
#[async_trait]
pub trait DaemonSession: Send + Sync {
    fn kind(&self) -> DaemonKind;

    /// Send `cancel Job=<job>` to the daemon
    async fn send_cancel(&self, job: &str) -> HandlerResult<()>;

    /// Signal termination and drop the connection
    async fn close(&self);
}

/// Type specific part of a job's lifecycle
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Pre-run setup such as resolving the level against the catalog
    async fn init(&self, _job: &JobHandle) -> HandlerResult<()> {
        Ok(())
    }

    /// Drive the remote daemons until the job is done
    async fn run(&self, job: &JobHandle) -> HandlerResult<()>;
}

/// Handlers keyed by job type
#[derive(Clone, Default)]
pub struct JobHandlers {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers that need no remote daemons
    pub fn builtin() -> Self {
        Self::new().with(JobType::Admin, Arc::new(AdminJobHandler))
    }

    /// Every job type simulated without touching any daemon
    pub fn dry_run(duration: Duration) -> Self {
        let handler: Arc<dyn JobHandler> = Arc::new(DryRunJobHandler { duration });
        [
            JobType::Backup,
            JobType::Verify,
            JobType::Restore,
            JobType::Admin,
            JobType::Migrate,
            JobType::Copy,
        ]
        .into_iter()
        .fold(Self::new(), |handlers, job_type| {
            handlers.with(job_type, handler.clone())
        })
    }

    pub fn with(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

/// Admin jobs only run their scripts
pub struct AdminJobHandler;

#[async_trait]
impl JobHandler for AdminJobHandler {
    async fn run(&self, job: &JobHandle) -> HandlerResult<()> {
        info!("Admin job {} has no remote work to do", job.name());
        Ok(())
    }
}

/// Pretends to run for a fixed time; returns early when the job is canceled
pub struct DryRunJobHandler {
    pub duration: Duration,
}

#[async_trait]
impl JobHandler for DryRunJobHandler {
    async fn run(&self, job: &JobHandle) -> HandlerResult<()> {
        info!(
            "Dry run of {} job {} for {:?}",
            job.job_type(),
            job.name(),
            self.duration
        );
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = job.cancellation().cancelled() => {
                info!("Dry run of {} interrupted by cancel", job.name());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_handlers_cover_admin_only() {
        let handlers = JobHandlers::builtin();
        assert!(handlers.get(JobType::Admin).is_some());
        assert!(handlers.get(JobType::Backup).is_none());
    }

    #[test]
    fn test_dry_run_covers_every_type() {
        let handlers = JobHandlers::dry_run(Duration::from_millis(1));
        assert!(handlers.get(JobType::Backup).is_some());
        assert!(handlers.get(JobType::Restore).is_some());
        assert!(handlers.get(JobType::Copy).is_some());
    }

    #[test]
    fn test_daemon_kind_display() {
        assert_eq!(DaemonKind::FileDaemon.to_string(), "File");
        assert_eq!(DaemonKind::StorageDaemon.to_string(), "Storage");
    }
}
