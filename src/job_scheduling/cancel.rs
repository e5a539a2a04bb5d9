//! Job cancellation
//!
//! Marking the job Canceled is the primitive. A job that is still queued is
//! fast-tracked to the front of the ready list so a worker reaps it; a
//! running job has `cancel Job=<name>` sent to each daemon session it holds,
//! which is then closed. The job's cancellation token wakes any handler
//! waiting on it.

use super::job_context::JobHandle;
use super::job_executor::JobExecutor;
use super::job_queue::JobQueue;
use super::types::JobEventKind;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cancel a job; false if a daemon could not be told about it
pub async fn cancel_job(queue: &Arc<JobQueue>, executor: &JobExecutor, job: &JobHandle) -> bool {
    let previous = job.mark_canceled();
    let name = job.name();
    info!(
        "Canceling JobId={} Job={} (status was {})",
        job.job_id(),
        name,
        previous
    );
    executor.emit(JobEventKind::Canceled, job);

    if previous.is_queued() {
        if let Err(e) = queue.remove(job) {
            // parked on its start time or not queued yet; add() routes it to ready
            debug!("Cancel of {}: {}", name, e);
        }
        return true;
    }

    let mut delivered = true;
    for session in job.take_sessions() {
        if let Err(e) = session.send_cancel(&name).await {
            warn!(
                "Could not send cancel for {} to the {} daemon: {}",
                name,
                session.kind(),
                e
            );
            delivered = false;
        }
        session.close().await;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::job_scheduling::handlers::{DaemonKind, JobHandlers};
    use crate::job_scheduling::job_queue::QueueSettings;
    use crate::job_scheduling::registry::JobRegistry;
    use crate::job_scheduling::test_support::{RecordingEngine, RecordingSession, job_definition};
    use crate::job_scheduling::job_context::JobContext;
    use crate::job_scheduling::types::{JobStatus, JobType};

    fn executor() -> JobExecutor {
        JobExecutor::new(
            "test-director",
            Arc::new(MemoryCatalog::new()),
            JobHandlers::builtin(),
            Arc::new(JobRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_waiting_job_is_fast_tracked() {
        let engine = RecordingEngine::new();
        let queue = engine.queue(QueueSettings::default());
        let first = engine.job("first", 1, "tape", "default");
        let second = engine.job("second", 20, "tape", "default");
        queue.add(first.clone()).unwrap();
        queue.add(second.clone()).unwrap();

        assert!(cancel_job(&queue, &executor(), &second).await);
        assert_eq!(second.status(), JobStatus::Canceled);
        assert_eq!(queue.ready_jobs()[0].key(), second.key());
    }

    #[tokio::test]
    async fn test_running_job_gets_cancel_sent_to_daemons() {
        let engine = RecordingEngine::new();
        let queue = engine.queue(QueueSettings::default());
        let job = JobContext::new(job_definition("nightly", JobType::Backup, 10));
        job.update(|s| {
            s.job = "nightly.2024-01-01_00.00.01".to_string();
            s.status = JobStatus::Running;
        });
        let fd = RecordingSession::new(DaemonKind::FileDaemon);
        let sd = RecordingSession::new(DaemonKind::StorageDaemon);
        job.attach_session(fd.clone());
        job.attach_session(sd.clone());

        assert!(cancel_job(&queue, &executor(), &job).await);
        assert_eq!(fd.cancels(), ["cancel Job=nightly.2024-01-01_00.00.01"]);
        assert_eq!(sd.cancels(), ["cancel Job=nightly.2024-01-01_00.00.01"]);
        assert!(fd.is_closed() && sd.is_closed());
        assert!(job.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_unreachable_daemon_reports_failure() {
        let engine = RecordingEngine::new();
        let queue = engine.queue(QueueSettings::default());
        let job = JobContext::new(job_definition("nightly", JobType::Backup, 10));
        job.set_status(JobStatus::Running);
        let sd = RecordingSession::unreachable(DaemonKind::StorageDaemon);
        job.attach_session(sd.clone());

        assert!(!cancel_job(&queue, &executor(), &job).await);
        assert!(sd.is_closed());
        assert_eq!(job.status(), JobStatus::Canceled);
    }
}
