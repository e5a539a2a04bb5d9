//! Worker pool draining the job queue
//!
//! Workers are tokio tasks started on demand up to `max_workers`. Each one
//! runs ready jobs, hands them back through `complete` and then promotes
//! whatever waiting jobs have become admissible. An idle worker exits after
//! `idle_timeout` without work.

use super::job_context::JobHandle;
use super::job_queue::{JobQueue, QueueState};
use super::types::{JobId, JobStatus};
use crate::errors::{DirectorResult, QueueError};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What the queue calls into to set up, run and tear down a job
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Give a fresh context its catalog record and JobId and register it
    async fn prepare(&self, job: &JobHandle) -> DirectorResult<JobId>;

    /// Run the job to its end status
    async fn run(&self, job: &JobHandle);

    /// Final teardown once the queue is done with the job
    async fn release(&self, job: &JobHandle);

    /// Called when a failed job has been put back for another attempt
    fn rescheduled(&self, _job: &JobHandle) {}

    /// Finalise and release a job the queue could not take, e.g. one whose
    /// start time wait ended after shutdown
    async fn abandon(&self, job: &JobHandle);
}

/// What a worker does once the queue lock is released
enum WorkerStep {
    Exit,
    /// Jobs are waiting but none could be admitted
    Poll,
    Continue { has_work: bool },
}

impl JobQueue {
    /// Wake an idle worker, or start a new one if below the limit
    pub(super) fn start_server(self: &Arc<Self>, state: &mut QueueState) -> Result<(), QueueError> {
        if state.idle_workers > 0 {
            debug!("Signaling one of {} idle workers", state.idle_workers);
            self.work.notify_one();
            return Ok(());
        }
        if state.num_workers < self.settings.max_workers {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| QueueError::Spawn {
                message: e.to_string(),
            })?;
            state.num_workers += 1;
            debug!(
                "Starting job queue worker {}/{}",
                state.num_workers, self.settings.max_workers
            );
            let queue = self.clone();
            runtime.spawn(async move { queue.serve().await });
        }
        Ok(())
    }

    async fn serve(self: Arc<Self>) {
        let mut work = true;
        let mut timed_out = false;

        loop {
            if !work {
                let quitting = {
                    let mut state = self.lock();
                    if !state.quit {
                        state.idle_workers += 1;
                    }
                    state.quit
                };
                if !quitting {
                    timed_out = timeout(self.settings.idle_timeout, self.work.notified())
                        .await
                        .is_err();
                    let mut state = self.lock();
                    state.idle_workers = state.idle_workers.saturating_sub(1);
                }
            }

            // Run everything that is ready, including canceled jobs that
            // need reaping while we are shutting down
            loop {
                let job = {
                    let mut state = self.lock();
                    let Some(job) = state.ready.pop_front() else {
                        break;
                    };
                    if !state.ready.is_empty() {
                        if let Err(e) = self.start_server(&mut state) {
                            warn!("Could not start another queue worker: {}", e);
                        }
                    }
                    state.running.push(job.clone());
                    job
                };
                debug!("Running JobId={} {}", job.job_id(), job.name());
                self.engine.run(&job).await;
                self.complete(job).await;
            }

            let next = {
                let mut state = self.lock();
                self.promote_waiting(&mut state);
                self.next_step(&mut state, timed_out)
            };
            match next {
                WorkerStep::Exit => break,
                WorkerStep::Poll => {
                    work = true;
                    // waiting jobs could not be admitted; look again shortly
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                WorkerStep::Continue { has_work } => work = has_work,
            }
        }
    }

    /// Decide what a worker does after a promotion pass
    fn next_step(&self, state: &mut QueueState, timed_out: bool) -> WorkerStep {
        if state.quit && state.ready.is_empty() {
            state.num_workers = state.num_workers.saturating_sub(1);
            debug!("Queue worker exiting on shutdown, {} left", state.num_workers);
            if state.num_workers == 0 {
                self.drained.notify_one();
            }
            return WorkerStep::Exit;
        }
        if timed_out && state.ready.is_empty() {
            state.num_workers = state.num_workers.saturating_sub(1);
            debug!("Idle queue worker exiting, {} left", state.num_workers);
            return WorkerStep::Exit;
        }
        if state.ready.is_empty() && !state.waiting.is_empty() {
            return WorkerStep::Poll;
        }
        WorkerStep::Continue {
            has_work: !state.ready.is_empty(),
        }
    }

    /// Return a finished job's resources and decide its fate
    async fn complete(self: &Arc<Self>, job: JobHandle) {
        {
            let mut state = self.lock();
            state.running.retain(|running| running.key() != job.key());
            let acquired = job.update(|s| std::mem::replace(&mut s.acquired_resource_locks, false));
            if acquired {
                if let Some(claim) = job.claim() {
                    state.ledger.release(&claim);
                }
            }
            state.completed_total += 1;
        }

        if should_reschedule(&job) {
            self.reschedule(job).await;
        } else {
            self.engine.release(&job).await;
        }
    }

    async fn reschedule(self: &Arc<Self>, job: JobHandle) {
        let definition = job.definition().clone();
        let interval = definition.reschedule.interval;
        let sched_time = Utc::now() + TimeDelta::from_std(interval).unwrap_or(TimeDelta::zero());
        let count = job.update(|s| {
            s.reschedule_count += 1;
            s.sched_time = sched_time;
            s.start_time = None;
            s.end_time = None;
            s.status = JobStatus::WaitStartTime;
            s.reschedule_count
        });
        for session in job.take_sessions() {
            session.close().await;
        }
        info!(
            "Rescheduled Job {} to re-run in {} seconds (attempt {} of {})",
            job.name(),
            interval.as_secs(),
            count,
            definition.reschedule.times
        );
        self.engine.rescheduled(&job);

        if job.job_bytes() == 0 {
            // nothing was written, the same JobId can be reused
            if let Err(e) = self.add(job.clone()) {
                error!("Could not requeue job {}: {}", job.name(), e);
                self.engine.abandon(&job).await;
            }
            return;
        }

        let fresh = job.respawn();
        match self.engine.prepare(&fresh).await {
            Ok(job_id) => {
                info!("Job {} continues as JobId={}", job.name(), job_id);
                if let Err(e) = self.add(fresh.clone()) {
                    error!("Could not queue continuation of {}: {}", job.name(), e);
                    self.engine.abandon(&fresh).await;
                }
            }
            Err(e) => error!("Could not set up continuation of {}: {}", job.name(), e),
        }
        self.engine.release(&job).await;
    }

    /// Stop accepting jobs and wait for every worker to exit
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.quit = true;
            self.stopping.cancel();
            if state.num_workers == 0 && state.parked == 0 {
                return;
            }
            info!(
                "Stopping {} job queue workers and {} start time waiters",
                state.num_workers, state.parked
            );
        }
        loop {
            self.work.notify_waiters();
            {
                let state = self.lock();
                if state.num_workers == 0 && state.parked == 0 {
                    break;
                }
            }
            let _ = timeout(Duration::from_millis(100), self.drained.notified()).await;
        }
        info!("Job queue stopped");
    }

    /// Log the queue contents for debugging
    pub fn dump_job_status(&self) {
        let stats = self.stats();
        info!("=== JOB STATUS DUMP ===");
        info!(
            "Queue Stats - Waiting: {}, Ready: {}, Running: {}, Workers: {}/{} ({} idle)",
            stats.waiting_jobs,
            stats.ready_jobs,
            stats.running_jobs,
            stats.num_workers,
            stats.max_workers,
            stats.idle_workers
        );
        let running = self.running_jobs();
        if !running.is_empty() {
            info!("Currently running jobs:");
            for job in &running {
                info!("  - JobId={} {} ({})", job.job_id(), job.name(), job.status());
            }
        }
        let waiting = self.waiting_jobs();
        if !waiting.is_empty() {
            info!("Waiting jobs:");
            for job in &waiting {
                info!(
                    "  - {} priority {} ({})",
                    job.name(),
                    job.priority(),
                    job.status()
                );
            }
        }
        info!("Resource usage: {:?}", self.resource_usage());
        info!("=== END JOB STATUS DUMP ===");
    }
}

fn should_reschedule(job: &JobHandle) -> bool {
    let policy = &job.definition().reschedule;
    let status = job.status();
    let count = job.update(|s| s.reschedule_count);
    policy.on_error
        && status != JobStatus::Terminated
        && status != JobStatus::Canceled
        && policy.times > 0
        && count < policy.times
}
