//! Director facade over the scheduler, queue, executor and job monitor
//!
//! This is what the console, the binary and embedding applications talk to:
//! submit and cancel jobs, look at status, and run the daemon loop.

use super::cancel;
use super::handlers::JobHandlers;
use super::job_context::{JobContext, JobHandle, JobSnapshot};
use super::job_executor::JobExecutor;
use super::job_queue::{JobQueue, JobQueueStats, QueueSettings, ResourceUsage};
use super::job_queue_runner::JobEngine;
use super::job_scheduler::{JobScheduler, ScheduleZone, UpcomingRun};
use super::registry::JobRegistry;
use super::types::{JobEvent, JobId};
use super::watchdog::JobMonitor;
use crate::catalog::Catalog;
use crate::config::{Config, DirectorConfig};
use crate::errors::{DirectorError, DirectorResult};
use crate::resources::Resources;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Serialisable view of the director for status listings
#[derive(Debug, Clone, Serialize)]
pub struct DirectorStatus {
    pub name: String,
    pub queue: JobQueueStats,
    pub running: Vec<JobSnapshot>,
    pub waiting: Vec<JobSnapshot>,
    /// Every live job, including those parked until their start time
    pub jobs: Vec<JobSnapshot>,
    pub resource_usage: ResourceUsage,
}

pub struct Director {
    name: String,
    resources: Arc<Resources>,
    registry: Arc<JobRegistry>,
    executor: Arc<JobExecutor>,
    queue: Arc<JobQueue>,
    scheduler: JobScheduler,
    monitor: JobMonitor,
}

impl Director {
    pub fn new(
        config: &DirectorConfig,
        resources: Resources,
        catalog: Arc<dyn Catalog>,
        handlers: JobHandlers,
    ) -> DirectorResult<Self> {
        let zone = ScheduleZone::from_name(config.timezone.as_deref())?;
        let resources = Arc::new(resources);
        let registry = Arc::new(JobRegistry::new());
        let executor = Arc::new(JobExecutor::new(
            config.name.clone(),
            catalog,
            handlers,
            registry.clone(),
        ));
        let engine: Arc<dyn JobEngine> = executor.clone();
        let queue = JobQueue::new(QueueSettings::from(config), registry.clone(), engine);
        let scheduler = JobScheduler::new(resources.clone(), zone, config.scan_interval);
        let monitor = JobMonitor::new(
            registry.clone(),
            queue.clone(),
            executor.clone(),
            config.watchdog_interval,
        );
        Ok(Self {
            name: config.name.clone(),
            resources,
            registry,
            executor,
            queue,
            scheduler,
            monitor,
        })
    }

    /// Resolve the configuration's resources and build a director from them
    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        handlers: JobHandlers,
    ) -> DirectorResult<Self> {
        let resources = Resources::from_config(config)?;
        Self::new(&config.director, resources, catalog, handlers)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &JobMonitor {
        &self.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.executor.subscribe()
    }

    /// A fresh context for the named job definition
    pub fn new_job(&self, name: &str) -> DirectorResult<JobHandle> {
        let definition = self
            .resources
            .find_job(name)
            .ok_or_else(|| DirectorError::not_found("Job", name))?;
        Ok(JobContext::new(definition.clone()))
    }

    /// Set the job up against the catalog and hand it to the queue
    ///
    /// Returns as soon as the job is queued; admission happens later.
    pub async fn run_job(&self, job: JobHandle) -> DirectorResult<JobId> {
        let job_id = self.executor.setup_job(&job).await?;
        if let Err(e) = self.queue.add(job.clone()) {
            error!("Could not queue JobId={} {}: {}", job_id, job.name(), e);
            self.executor.abandon(&job).await;
            return Err(e.into());
        }
        info!("Queued JobId={} Job={}", job_id, job.name());
        Ok(job_id)
    }

    pub async fn run_job_by_name(&self, name: &str) -> DirectorResult<JobId> {
        let job = self.new_job(name)?;
        self.run_job(job).await
    }

    pub async fn cancel_job(&self, job: &JobHandle) -> bool {
        cancel::cancel_job(&self.queue, &self.executor, job).await
    }

    /// Cancel a live job by unique name, definition name or JobId
    pub async fn cancel_by_name(&self, name: &str) -> DirectorResult<bool> {
        let job = name
            .parse::<JobId>()
            .ok()
            .and_then(|job_id| self.registry.find_by_job_id(job_id))
            .or_else(|| self.registry.find_by_name(name))
            .ok_or_else(|| DirectorError::not_found("running job", name))?;
        Ok(self.cancel_job(&job).await)
    }

    pub fn set_job_enabled(&self, name: &str, enabled: bool) -> DirectorResult<()> {
        let job = self
            .resources
            .find_job(name)
            .ok_or_else(|| DirectorError::not_found("Job", name))?;
        job.set_enabled(enabled);
        info!(
            "Job {} {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Run the named job as soon as the daemon loop starts
    pub fn run_once(&self, name: &str) -> DirectorResult<()> {
        let job = self
            .resources
            .find_job(name)
            .ok_or_else(|| DirectorError::not_found("Job", name))?;
        self.scheduler.run_once(job.clone());
        Ok(())
    }

    pub fn status(&self) -> DirectorStatus {
        let snapshot = |jobs: Vec<JobHandle>| jobs.iter().map(|job| job.snapshot()).collect();
        DirectorStatus {
            name: self.name.clone(),
            queue: self.queue.stats(),
            running: snapshot(self.queue.running_jobs()),
            waiting: snapshot(self.queue.waiting_jobs()),
            jobs: snapshot(self.registry.snapshot()),
            resource_usage: self.queue.resource_usage(),
        }
    }

    pub fn upcoming(&self, now: DateTime<Utc>, hours: u32) -> Vec<UpcomingRun> {
        self.scheduler.upcoming(now, hours)
    }

    /// Daemon loop: hand scheduled jobs to the queue and run the job monitor
    /// until the token is canceled, then shut down
    pub async fn run(&self, cancellation_token: CancellationToken) -> DirectorResult<()> {
        info!(
            "Starting director {} with {} jobs",
            self.name,
            self.resources.jobs.len()
        );

        let scheduling = async {
            while let Some(job) = self.scheduler.wait_for_next_job(&cancellation_token).await {
                let name = job.definition().name.clone();
                if let Err(e) = self.run_job(job).await {
                    error!("Could not run scheduled job {}: {}", name, e);
                }
            }
            info!("Run scheduler received cancellation signal");
        };
        tokio::join!(scheduling, self.monitor.run(cancellation_token.clone()));

        self.shutdown().await;
        info!("Director {} stopped", self.name);
        Ok(())
    }

    /// Cancel every live job and wait for the queue workers to finish
    pub async fn shutdown(&self) {
        self.queue.dump_job_status();
        for job in self.registry.snapshot() {
            if !job.status().is_terminal() {
                if !self.cancel_job(&job).await {
                    warn!("Cancel of {} was not acknowledged by every daemon", job.name());
                }
            }
        }
        self.queue.shutdown().await;
    }
}
