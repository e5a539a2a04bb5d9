//! Job setup and the per-job lifecycle run inside a queue worker

use super::handlers::JobHandlers;
use super::job_context::{JobHandle, create_unique_job_name};
use super::job_queue_runner::JobEngine;
use super::registry::JobRegistry;
use super::scripts;
use super::types::{JobEvent, JobEventKind, JobId, JobStatus};
use crate::catalog::{Catalog, CatalogConnection};
use crate::errors::{CatalogResult, DirectorError, DirectorResult, HandlerError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Sets jobs up against the catalog and drives them through their lifecycle
pub struct JobExecutor {
    director: String,
    catalog: Arc<dyn Catalog>,
    handlers: JobHandlers,
    registry: Arc<JobRegistry>,
    events: broadcast::Sender<JobEvent>,
}

impl JobExecutor {
    pub fn new(
        director: impl Into<String>,
        catalog: Arc<dyn Catalog>,
        handlers: JobHandlers,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            director: director.into(),
            catalog,
            handlers,
            registry,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Broadcast a lifecycle event; nobody listening is fine
    pub fn emit(&self, kind: JobEventKind, job: &JobHandle) {
        let event = {
            let state = job.state();
            JobEvent {
                kind,
                job_id: state.job_id,
                job: state.job.clone(),
                status: state.status,
                at: Utc::now(),
            }
        };
        let _ = self.events.send(event);
    }

    /// Prepare a fresh context for queueing
    ///
    /// Gives the job its unique name, resolves the level pool, opens its
    /// catalog connection and creates the job record, which assigns the
    /// JobId. The job is registered once it has one.
    pub async fn setup_job(&self, job: &JobHandle) -> DirectorResult<JobId> {
        if job.is_canceled() {
            return Err(DirectorError::JobCanceled { job: job.name() });
        }
        job.set_status(JobStatus::Created);
        let unique = create_unique_job_name(&job.definition().name).await;
        job.update(|s| s.job = unique);
        job.apply_pool_overrides();

        let conn = self.catalog.open(&job.name()).await?;
        let job_id = match self.create_records(job, conn.as_ref()).await {
            Ok(job_id) => job_id,
            Err(e) => {
                error!("Could not create catalog records for {}: {}", job.name(), e);
                conn.close().await;
                return Err(e.into());
            }
        };
        job.update(|s| {
            s.job_id = job_id;
            s.catalog = Some(conn);
        });
        self.registry.register(job);
        self.emit(JobEventKind::JobStart, job);
        info!(
            "Created JobId={} Job={} pool {} ({})",
            job_id,
            job.name(),
            job.update(|s| s.pool.name.clone()),
            job.update(|s| s.pool_source.clone())
        );
        Ok(job_id)
    }

    async fn create_records(
        &self,
        job: &JobHandle,
        conn: &dyn CatalogConnection,
    ) -> CatalogResult<JobId> {
        let client = job.update(|s| s.client.clone());
        let client_id = conn.get_or_create_client(&client).await?;
        job.update(|s| s.client_id = Some(client_id));
        conn.create_job_record(&job.record()).await
    }

    async fn write_start_record(&self, job: &JobHandle) {
        if let Some(conn) = job.catalog() {
            if let Err(e) = conn.update_job_start(&job.record()).await {
                job.queue_message(format!("Could not update job start record: {e}"));
            }
        }
    }

    async fn write_end_record(&self, job: &JobHandle) {
        if let Some(conn) = job.catalog() {
            if let Err(e) = conn.update_job_end(&job.record()).await {
                error!("Could not update job end record of {}: {}", job.name(), e);
            }
        }
    }

    fn handler_failed(&self, job: &JobHandle, phase: &str, e: HandlerError) {
        let status = if e.is_fatal() {
            JobStatus::FatalError
        } else {
            JobStatus::ErrorTerminated
        };
        error!("{} {} failed: {}", job.name(), phase, e);
        job.fail(status, format!("{phase} failed: {e}"));
    }

    /// Late start check; the job is canceled but still finalised
    fn check_start_delay(&self, job: &JobHandle) {
        let Some(max_delay) = job.definition().timeouts.max_start_delay else {
            return;
        };
        let (sched_time, start_time) = job.update(|s| (s.sched_time, s.start_time));
        let late = start_time
            .and_then(|start| (start - sched_time).to_std().ok())
            .is_some_and(|late| late > max_delay);
        if late {
            job.mark_canceled();
            job.queue_message("Job canceled because max start delay time exceeded.");
        }
    }

    async fn run_lifecycle(&self, job: &JobHandle) {
        job.update(|s| {
            if !s.status.is_canceled() {
                s.status = JobStatus::Running;
            }
            s.start_time = Some(Utc::now());
        });
        info!(
            "Start {} JobId {}, Job={}",
            job.job_type(),
            job.job_id(),
            job.name()
        );
        self.check_start_delay(job);

        let handler = self.handlers.get(job.job_type());
        if !job.is_canceled() {
            match &handler {
                Some(handler) => {
                    if let Err(e) = handler.init(job).await {
                        self.handler_failed(job, "init", e);
                    }
                }
                None => self.handler_failed(
                    job,
                    "init",
                    HandlerError::Unimplemented {
                        job_type: job.job_type().to_string(),
                    },
                ),
            }
        }
        self.emit(JobEventKind::JobInit, job);
        self.write_start_record(job).await;

        if !job.is_canceled() {
            if let Err(e) = scripts::run_before_scripts(job, &self.director).await {
                job.fail(JobStatus::ErrorTerminated, format!("RunBefore failed: {e}"));
            }
        }

        if !job.is_canceled() {
            // files written by the before script belong to this run
            job.update(|s| s.start_time = Some(Utc::now()));
            self.write_start_record(job).await;
            self.emit(JobEventKind::JobRun, job);
            if let Some(handler) = &handler {
                match handler.run(job).await {
                    Ok(()) => job.update(|s| {
                        if s.status == JobStatus::Running {
                            s.status = JobStatus::Terminated;
                        }
                    }),
                    Err(e) => self.handler_failed(job, "run", e),
                }
            }
            scripts::run_after_scripts(job, &self.director).await;
        }

        for message in job.take_messages() {
            warn!("{}: {}", job.name(), message);
        }

        job.update(|s| {
            if s.status == JobStatus::Running {
                s.status = JobStatus::Terminated;
            } else if !s.status.is_terminal() {
                s.status = JobStatus::ErrorTerminated;
            }
            s.end_time = Some(Utc::now());
        });
        self.write_end_record(job).await;
        self.emit(JobEventKind::JobEnd, job);
        info!(
            "{} JobId {} Job={} ended: {}",
            job.job_type(),
            job.job_id(),
            job.name(),
            job.status()
        );
    }
}

#[async_trait]
impl JobEngine for JobExecutor {
    async fn prepare(&self, job: &JobHandle) -> DirectorResult<JobId> {
        self.setup_job(job).await
    }

    async fn run(&self, job: &JobHandle) {
        self.run_lifecycle(job).await;
    }

    async fn release(&self, job: &JobHandle) {
        for session in job.take_sessions() {
            session.close().await;
        }
        if let Some(conn) = job.update(|s| s.catalog.take()) {
            conn.close().await;
        }
        self.registry.unregister(job.key());
        debug!("Released JobId={} {}", job.job_id(), job.name());
    }

    fn rescheduled(&self, job: &JobHandle) {
        self.emit(JobEventKind::Rescheduled, job);
    }

    async fn abandon(&self, job: &JobHandle) {
        job.update(|s| {
            if !s.status.is_terminal() {
                s.status = JobStatus::Canceled;
            }
            s.end_time = Some(Utc::now());
        });
        self.write_end_record(job).await;
        self.emit(JobEventKind::JobEnd, job);
        info!(
            "JobId {} Job={} not run: {}",
            job.job_id(),
            job.name(),
            job.status()
        );
        self.release(job).await;
    }
}
