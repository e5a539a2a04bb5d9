//! Job monitor enforcing MaxWaitTime and MaxRunTime

use super::cancel::cancel_job;
use super::job_context::JobHandle;
use super::job_executor::JobExecutor;
use super::job_queue::JobQueue;
use super::registry::JobRegistry;
use super::types::{JobLevel, JobStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_WAIT_EXCEEDED: &str = "Max wait time exceeded. Job canceled.";
pub const MAX_RUN_EXCEEDED: &str = "Max run time exceeded. Job canceled.";

/// Why a job has overstayed its limits, if it has
///
/// The wait limits only apply while the job is blocked on a resource or a
/// daemon; the run limit applies to anything past Created.
pub fn timeout_reason(job: &JobHandle, now: DateTime<Utc>) -> Option<&'static str> {
    let timeouts = &job.definition().timeouts;
    let (status, level, since) =
        job.update(|s| (s.status, s.level, s.start_time.unwrap_or(s.sched_time)));
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);

    if status.is_waiting() {
        let level_limit = match level {
            JobLevel::Full => timeouts.full_max_wait_time,
            JobLevel::Differential => timeouts.differential_max_wait_time,
            JobLevel::Incremental => timeouts.incremental_max_wait_time,
            _ => None,
        };
        if [timeouts.max_wait_time, level_limit]
            .into_iter()
            .flatten()
            .any(|limit| elapsed >= limit)
        {
            return Some(MAX_WAIT_EXCEEDED);
        }
    }

    if status != JobStatus::Created
        && timeouts.max_run_time.is_some_and(|limit| elapsed >= limit)
    {
        return Some(MAX_RUN_EXCEEDED);
    }
    None
}

/// Periodically cancels jobs that exceeded their wait or run limits
pub struct JobMonitor {
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    executor: Arc<JobExecutor>,
    interval: Duration,
}

impl JobMonitor {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        executor: Arc<JobExecutor>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            executor,
            interval,
        }
    }

    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting job monitor (interval: {:?})", self.interval);
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let canceled = self.check_jobs(Utc::now()).await;
                    if canceled > 0 {
                        debug!("Job monitor canceled {} jobs", canceled);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("Job monitor received cancellation signal");
                    break;
                }
            }
        }
    }

    /// One pass over the live jobs; returns how many were canceled
    pub async fn check_jobs(&self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<(JobHandle, &'static str)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|job| job.job_id() != 0 && !job.is_canceled())
            .filter_map(|job| timeout_reason(&job, now).map(|reason| (job, reason)))
            .collect();

        for (job, reason) in &overdue {
            warn!("{}: {}", job.name(), reason);
            job.queue_message(*reason);
            cancel_job(&self.queue, &self.executor, job).await;
        }
        overdue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_scheduling::job_context::JobContext;
    use crate::job_scheduling::test_support::client;
    use crate::job_scheduling::test_support::pool;
    use crate::job_scheduling::types::JobType;
    use crate::resources::JobResource;
    use chrono::TimeDelta;
    use rstest::rstest;

    fn job_with(
        level: JobLevel,
        status: JobStatus,
        configure: impl FnOnce(&mut JobResource),
    ) -> JobHandle {
        let mut definition =
            JobResource::new("nightly", JobType::Backup, client("web", 1), pool("default"));
        configure(&mut definition);
        let job = JobContext::new(Arc::new(definition));
        job.update(|s| {
            s.level = level;
            s.status = status;
            s.start_time = Some(Utc::now() - TimeDelta::minutes(30));
        });
        job
    }

    #[rstest]
    #[case(JobStatus::WaitStoreRes, Some(MAX_WAIT_EXCEEDED))]
    #[case(JobStatus::WaitSD, Some(MAX_WAIT_EXCEEDED))]
    #[case(JobStatus::Running, None)]
    fn test_wait_limit_only_while_waiting(
        #[case] status: JobStatus,
        #[case] expected: Option<&'static str>,
    ) {
        let job = job_with(JobLevel::Incremental, status, |d| {
            d.timeouts.max_wait_time = Some(Duration::from_secs(600));
        });
        assert_eq!(timeout_reason(&job, Utc::now()), expected);
    }

    #[rstest]
    #[case(JobLevel::Full, Some(MAX_WAIT_EXCEEDED))]
    #[case(JobLevel::Incremental, None)]
    fn test_level_specific_wait_limit(
        #[case] level: JobLevel,
        #[case] expected: Option<&'static str>,
    ) {
        let job = job_with(level, JobStatus::WaitClientRes, |d| {
            d.timeouts.full_max_wait_time = Some(Duration::from_secs(60));
        });
        assert_eq!(timeout_reason(&job, Utc::now()), expected);
    }

    #[rstest]
    #[case(JobStatus::Running, Some(MAX_RUN_EXCEEDED))]
    #[case(JobStatus::WaitMedia, Some(MAX_RUN_EXCEEDED))]
    #[case(JobStatus::Created, None)]
    fn test_run_limit_regardless_of_activity(
        #[case] status: JobStatus,
        #[case] expected: Option<&'static str>,
    ) {
        let job = job_with(JobLevel::Full, status, |d| {
            d.timeouts.max_run_time = Some(Duration::from_secs(60));
        });
        assert_eq!(timeout_reason(&job, Utc::now()), expected);
    }

    #[test]
    fn test_no_limits_never_fire() {
        let job = job_with(JobLevel::Full, JobStatus::WaitStoreRes, |_| {});
        assert_eq!(timeout_reason(&job, Utc::now()), None);
    }
}
