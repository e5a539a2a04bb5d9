//! End to end admission, cancellation and reschedule behaviour of the director
//!
//! Every test drives a real `Director` over the in-memory catalog with a stand-in
//! handler standing in for the file and storage daemons. The stand-in records
//! start order, JobIds and how many jobs share each storage at once.

use async_trait::async_trait;
use backup_director::{
    catalog::MemoryCatalog,
    config::Config,
    errors::{DirectorError, HandlerError, HandlerResult},
    job_scheduling::{
        Director, JobEventKind, JobHandle, JobHandler, JobHandlers, JobId, JobStatus, JobType,
        job_queue::ResourceUsage,
    },
};
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stand-in for the daemon protocol
///
/// Jobs named `hold*` run until canceled, `flaky*` jobs fail their first
/// attempt (`flaky-data` after writing some bytes), the rest work briefly.
struct DaemonStandIn {
    work: Duration,
    started: Mutex<Vec<(String, JobId)>>,
    active: Mutex<Vec<(String, String)>>,
    peak: Mutex<HashMap<String, usize>>,
    mixed_pools: AtomicUsize,
}

impl DaemonStandIn {
    fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            started: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            peak: Mutex::new(HashMap::new()),
            mixed_pools: AtomicUsize::new(0),
        })
    }

    fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn job_ids(&self, name: &str) -> Vec<JobId> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(started, _)| started == name)
            .map(|(_, job_id)| *job_id)
            .collect()
    }

    fn peak(&self, storage: &str) -> usize {
        self.peak.lock().unwrap().get(storage).copied().unwrap_or(0)
    }
}

#[async_trait]
impl JobHandler for DaemonStandIn {
    async fn run(&self, job: &JobHandle) -> HandlerResult<()> {
        let name = job.definition().name.clone();
        let (storage, pool) = job.storage_and_pool().unwrap_or_default();
        let attempt = {
            let mut started = self.started.lock().unwrap();
            started.push((name.clone(), job.job_id()));
            started.iter().filter(|(n, _)| *n == name).count()
        };
        {
            let mut active = self.active.lock().unwrap();
            if active.iter().any(|(s, p)| *s == storage && *p != pool) {
                self.mixed_pools.fetch_add(1, Ordering::SeqCst);
            }
            active.push((storage.clone(), pool.clone()));
            let sharing = active.iter().filter(|(s, _)| *s == storage).count();
            let mut peak = self.peak.lock().unwrap();
            let entry = peak.entry(storage.clone()).or_default();
            *entry = (*entry).max(sharing);
        }

        let result = if name.starts_with("hold") {
            job.cancellation().cancelled().await;
            Ok(())
        } else if name.starts_with("flaky") && attempt == 1 {
            if name.ends_with("data") {
                job.record_transfer(4096, 12);
            }
            Err(HandlerError::Daemon {
                daemon: "Storage".to_string(),
                message: "device busy".to_string(),
            })
        } else {
            tokio::time::sleep(self.work).await;
            Ok(())
        };

        let mut active = self.active.lock().unwrap();
        if let Some(index) = active.iter().position(|(s, p)| *s == storage && *p == pool) {
            active.remove(index);
        }
        result
    }
}

const RESOURCES: &str = r#"
    [director]
    name = "scenario-director"
    max_concurrent_jobs = 4
    worker_idle_timeout = "1s"
    queue_poll_interval = "50ms"
    start_time_recheck = "1s"

    [[client]]
    name = "web"
    max_concurrent_jobs = 10

    [[storage]]
    name = "tape"
    max_concurrent_jobs = 1

    [[storage]]
    name = "disk"
    max_concurrent_jobs = 2

    [[pool]]
    name = "weekly"
    storage = ["tape"]

    [[pool]]
    name = "archive"
    storage = ["disk"]

    [[pool]]
    name = "scratch"
    storage = ["disk"]
"#;

fn job(name: &str, pool: &str, priority: u32, extra: &str) -> String {
    format!(
        r#"
    [[job]]
    name = "{name}"
    type = "backup"
    client = "web"
    pool = "{pool}"
    priority = {priority}
    {extra}
"#
    )
}

fn director_with(jobs: &[String], handler: &Arc<DaemonStandIn>) -> (Director, MemoryCatalog) {
    let config = Config::from_toml_str(&format!("{RESOURCES}{}", jobs.concat())).unwrap();
    let catalog = MemoryCatalog::new();
    let handlers = JobHandlers::new().with(JobType::Backup, handler.clone());
    let director = Director::from_config(&config, Arc::new(catalog.clone()), handlers).unwrap();
    (director, catalog)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Wait until the director has released every job it was given
async fn wait_idle(director: &Director) {
    wait_until("all jobs to be released", || director.registry().is_empty()).await;
}

async fn status_of(catalog: &MemoryCatalog, name: &str) -> Vec<JobStatus> {
    catalog
        .jobs()
        .await
        .into_iter()
        .filter(|record| record.name == name)
        .map(|record| record.status)
        .collect()
}

#[tokio::test]
async fn test_higher_priority_job_is_admitted_before_earlier_arrivals() {
    let handler = DaemonStandIn::new(Duration::from_millis(20));
    let (director, catalog) = director_with(
        &[
            job("hold-gate", "weekly", 1, ""),
            job("a", "weekly", 10, ""),
            job("b", "weekly", 10, ""),
            job("c", "weekly", 5, ""),
        ],
        &handler,
    );

    let gate = director.new_job("hold-gate").unwrap();
    director.run_job(gate.clone()).await.unwrap();
    wait_until("the gate job to start", || handler.started() == ["hold-gate"]).await;

    for name in ["a", "b", "c"] {
        director.run_job_by_name(name).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handler.started(), ["hold-gate"]);
    assert_eq!(director.status().waiting.len(), 3);

    assert!(director.cancel_job(&gate).await);
    wait_idle(&director).await;

    assert_eq!(handler.started(), ["hold-gate", "c", "a", "b"]);
    assert_eq!(status_of(&catalog, "hold-gate").await, [JobStatus::Canceled]);
    assert_eq!(status_of(&catalog, "a").await, [JobStatus::Terminated]);
}

#[tokio::test]
async fn test_canceled_holder_frees_storage_for_waiting_job() {
    let handler = DaemonStandIn::new(Duration::from_millis(20));
    let (director, catalog) = director_with(
        &[
            job("hold-tape", "weekly", 10, ""),
            job("next", "weekly", 10, ""),
        ],
        &handler,
    );

    let holder = director.new_job("hold-tape").unwrap();
    director.run_job(holder.clone()).await.unwrap();
    wait_until("the holder to start", || handler.started() == ["hold-tape"]).await;

    director.run_job_by_name("next").await.unwrap();
    let next = director.registry().find_by_name("next").unwrap();
    wait_until("next to block on the storage", || {
        next.status() == JobStatus::WaitStoreRes
    })
    .await;

    director.cancel_job(&holder).await;
    wait_idle(&director).await;

    assert_eq!(handler.started(), ["hold-tape", "next"]);
    assert_eq!(status_of(&catalog, "next").await, [JobStatus::Terminated]);
    assert_eq!(director.status().resource_usage, ResourceUsage::default());
}

#[tokio::test]
async fn test_storage_ceiling_and_pool_exclusivity_hold_under_load() {
    let handler = DaemonStandIn::new(Duration::from_millis(60));
    let names = ["d1", "s1", "d2", "s2", "d3", "s3"];
    let jobs: Vec<String> = names
        .iter()
        .map(|name| {
            let pool = if name.starts_with('d') { "archive" } else { "scratch" };
            job(name, pool, 10, "")
        })
        .collect();
    let (director, catalog) = director_with(&jobs, &handler);

    for name in names {
        director.run_job_by_name(name).await.unwrap();
    }
    wait_idle(&director).await;

    assert_eq!(handler.started().len(), names.len());
    assert!(handler.peak("disk") <= 2);
    assert_eq!(handler.mixed_pools.load(Ordering::SeqCst), 0);
    assert_eq!(catalog.jobs().await.len(), names.len());
    assert_eq!(director.status().resource_usage, ResourceUsage::default());
}

#[tokio::test]
async fn test_storage_runs_up_to_its_limit_concurrently() {
    let handler = DaemonStandIn::new(Duration::from_millis(200));
    let (director, _catalog) = director_with(
        &[
            job("d1", "archive", 10, ""),
            job("d2", "archive", 10, ""),
            job("d3", "archive", 10, ""),
        ],
        &handler,
    );

    for name in ["d1", "d2", "d3"] {
        director.run_job_by_name(name).await.unwrap();
    }
    wait_idle(&director).await;

    assert_eq!(handler.peak("disk"), 2);
    assert_eq!(handler.started().len(), 3);
}

#[tokio::test]
async fn test_waiting_job_canceled_is_reaped_without_running() {
    let handler = DaemonStandIn::new(Duration::from_millis(20));
    let (director, catalog) = director_with(
        &[
            job("hold-gate", "weekly", 1, ""),
            job("mid", "weekly", 10, ""),
            job("low", "weekly", 20, ""),
        ],
        &handler,
    );

    let gate = director.new_job("hold-gate").unwrap();
    director.run_job(gate.clone()).await.unwrap();
    wait_until("the gate job to start", || handler.started() == ["hold-gate"]).await;
    director.run_job_by_name("mid").await.unwrap();
    director.run_job_by_name("low").await.unwrap();

    assert!(director.cancel_by_name("low").await.unwrap());
    wait_until("low to be released", || {
        director.registry().find_by_name("low").is_none()
    })
    .await;
    assert_eq!(status_of(&catalog, "low").await, [JobStatus::Canceled]);
    assert_eq!(handler.started(), ["hold-gate"]);

    director.cancel_job(&gate).await;
    wait_idle(&director).await;
    assert_eq!(handler.started(), ["hold-gate", "mid"]);
}

#[tokio::test]
async fn test_failed_job_without_data_keeps_its_job_id() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(
        &[job(
            "flaky",
            "weekly",
            10,
            r#"reschedule_on_error = true
    reschedule_interval = "1s"
    reschedule_times = 2"#,
        )],
        &handler,
    );
    let mut events = director.subscribe();

    let job_id = director.run_job_by_name("flaky").await.unwrap();
    wait_until("the second attempt", || handler.started().len() == 2).await;
    wait_idle(&director).await;

    assert_eq!(handler.job_ids("flaky"), [job_id, job_id]);
    assert_eq!(status_of(&catalog, "flaky").await, [JobStatus::Terminated]);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&JobEventKind::Rescheduled));
    assert_eq!(kinds.iter().filter(|k| **k == JobEventKind::JobStart).count(), 1);
}

#[tokio::test]
async fn test_failed_job_with_data_gets_a_new_job_id() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(
        &[job(
            "flaky-data",
            "weekly",
            10,
            r#"reschedule_on_error = true
    reschedule_interval = "1s"
    reschedule_times = 1"#,
        )],
        &handler,
    );

    let first = director.run_job_by_name("flaky-data").await.unwrap();
    wait_until("the second attempt", || handler.started().len() == 2).await;
    wait_idle(&director).await;

    let ids = handler.job_ids("flaky-data");
    assert_eq!(ids[0], first);
    assert_ne!(ids[1], first);
    let statuses = status_of(&catalog, "flaky-data").await;
    assert_eq!(statuses.len(), 2);
    assert!(statuses.contains(&JobStatus::ErrorTerminated));
    assert!(statuses.contains(&JobStatus::Terminated));
}

#[tokio::test]
async fn test_watchdog_cancels_stuck_waiter_but_not_running_job() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(
        &[
            job("hold-tape", "weekly", 10, r#"max_wait_time = "1s""#),
            job("stuck", "weekly", 10, r#"max_wait_time = "1s""#),
        ],
        &handler,
    );

    let holder = director.new_job("hold-tape").unwrap();
    director.run_job(holder.clone()).await.unwrap();
    wait_until("the holder to start", || handler.started() == ["hold-tape"]).await;
    director.run_job_by_name("stuck").await.unwrap();
    let stuck = director.registry().find_by_name("stuck").unwrap();
    wait_until("stuck to wait on the storage", || stuck.status().is_waiting()).await;

    let canceled = director
        .monitor()
        .check_jobs(Utc::now() + TimeDelta::seconds(5))
        .await;
    assert_eq!(canceled, 1);
    assert!(stuck.is_canceled());
    assert_eq!(holder.status(), JobStatus::Running);

    director.cancel_job(&holder).await;
    wait_idle(&director).await;
    assert_eq!(status_of(&catalog, "stuck").await, [JobStatus::Canceled]);
    assert_eq!(handler.started(), ["hold-tape"]);
}

#[tokio::test]
async fn test_watchdog_enforces_max_run_time() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(
        &[job("hold-slow", "weekly", 10, r#"max_run_time = "1s""#)],
        &handler,
    );

    director.run_job_by_name("hold-slow").await.unwrap();
    wait_until("the job to start", || handler.started().len() == 1).await;

    assert_eq!(director.monitor().check_jobs(Utc::now()).await, 0);
    assert_eq!(
        director
            .monitor()
            .check_jobs(Utc::now() + TimeDelta::seconds(5))
            .await,
        1
    );
    wait_idle(&director).await;
    assert_eq!(status_of(&catalog, "hold-slow").await, [JobStatus::Canceled]);
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_waiting_jobs() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(
        &[
            job("hold-tape", "weekly", 10, ""),
            job("queued", "weekly", 10, ""),
        ],
        &handler,
    );

    director.run_job_by_name("hold-tape").await.unwrap();
    wait_until("the holder to start", || handler.started() == ["hold-tape"]).await;
    director.run_job_by_name("queued").await.unwrap();

    director.shutdown().await;

    assert!(director.registry().is_empty());
    assert_eq!(director.queue().stats().num_workers, 0);
    assert_eq!(status_of(&catalog, "hold-tape").await, [JobStatus::Canceled]);
    assert_eq!(status_of(&catalog, "queued").await, [JobStatus::Canceled]);
    assert!(matches!(
        director.run_job_by_name("queued").await,
        Err(DirectorError::Queue(_))
    ));
}

#[tokio::test]
async fn test_job_canceled_before_its_start_time_is_finalised() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(&[job("later", "weekly", 10, "")], &handler);

    let later = director.new_job("later").unwrap();
    later.update(|s| s.sched_time = Utc::now() + TimeDelta::hours(1));
    let job_id = director.run_job(later.clone()).await.unwrap();
    assert_eq!(later.status(), JobStatus::WaitStartTime);

    assert!(director.cancel_job(&later).await);
    wait_idle(&director).await;

    let record = catalog.job(job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Canceled);
    assert!(record.end_time.is_some());
    assert!(handler.started().is_empty());
}

#[tokio::test]
async fn test_shutdown_finalises_job_waiting_for_its_start_time() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(&[job("later", "weekly", 10, "")], &handler);

    let later = director.new_job("later").unwrap();
    later.update(|s| s.sched_time = Utc::now() + TimeDelta::hours(1));
    let job_id = director.run_job(later).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), director.shutdown())
        .await
        .expect("shutdown waits for the start time waiter");

    let record = catalog.job(job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Canceled);
    assert!(record.end_time.is_some());
    assert!(director.registry().is_empty());
    assert!(handler.started().is_empty());
}

#[tokio::test]
async fn test_unavailable_catalog_leaves_job_unqueued() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(&[job("a", "weekly", 10, "")], &handler);
    catalog.set_available(false);

    assert!(matches!(
        director.run_job_by_name("a").await,
        Err(DirectorError::Catalog(_))
    ));
    assert!(director.registry().is_empty());
    assert_eq!(director.queue().stats().waiting_jobs, 0);
}

#[tokio::test]
async fn test_daemon_loop_runs_one_shot_job_then_stops() {
    let handler = DaemonStandIn::new(Duration::from_millis(10));
    let (director, catalog) = director_with(&[job("nightly", "weekly", 10, "")], &handler);
    director.run_once("nightly").unwrap();
    assert!(director.run_once("unknown").is_err());

    let token = CancellationToken::new();
    let stopper = async {
        wait_until("the one-shot job to run", || handler.started().len() == 1).await;
        wait_idle(&director).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(director.run(token.clone()), stopper);

    result.unwrap();
    assert_eq!(status_of(&catalog, "nightly").await, [JobStatus::Terminated]);
}
