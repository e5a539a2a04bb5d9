//! Run scheduler: turns calendar matches into job contexts when they are due
//!
//! Every scan looks at the current and the next hour so nothing due inside
//! the window is missed while the scheduler sleeps between scans. Matches
//! are kept in a candidate list sorted by run time, then priority.

use super::calendar::CalendarFields;
use super::job_context::{JobContext, JobHandle};
use super::types::JobLevel;
use crate::errors::{ConfigError, ConfigResult};
use crate::resources::{JobResource, Resources, RunSpec};
use chrono::{DateTime, Datelike, Local, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// A run clause instance waiting for its time
#[derive(Debug, Clone)]
pub struct PendingRun {
    pub job: Arc<JobResource>,
    pub run: Arc<RunSpec>,
    pub run_time: DateTime<Utc>,
    /// Run clause priority if it sets one, else the job's
    pub priority: u32,
}

/// Time zone calendars are evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleZone {
    #[default]
    Local,
    Named(Tz),
}

impl ScheduleZone {
    pub fn from_name(name: Option<&str>) -> ConfigResult<Self> {
        match name {
            None => Ok(Self::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(Self::Named)
                .map_err(|e| ConfigError::invalid("director.timezone", e.to_string())),
        }
    }
}

/// Whether a match at `run_time` should become a pending run
///
/// Drops instances consumed less than one granularity ago and instances
/// that went stale before this scan.
pub fn passes_debounce(run_time: i64, last_run: i64, now: i64, granularity: Duration) -> bool {
    let granularity = granularity.as_secs() as i64;
    run_time - last_run >= granularity + 1 && run_time + (granularity - 1) >= now
}

fn insert_ordered(candidates: &mut Vec<PendingRun>, entry: PendingRun) {
    let position = candidates.iter().position(|queued| {
        queued.run_time > entry.run_time
            || (queued.run_time == entry.run_time && queued.priority > entry.priority)
    });
    match position {
        Some(index) => candidates.insert(index, entry),
        None => candidates.push(entry),
    }
}

/// `minute:00` of the hour `instant` falls in; `None` inside a DST gap
fn run_time_in_hour<Z: TimeZone>(instant: &DateTime<Z>, minute: u32) -> Option<DateTime<Utc>> {
    instant
        .timezone()
        .with_ymd_and_hms(
            instant.year(),
            instant.month(),
            instant.day(),
            instant.hour(),
            minute,
            0,
        )
        .earliest()
        .map(|at| at.with_timezone(&Utc))
}

/// Every run clause instance due in the hour of `now` or the one after
pub fn find_runs<Z: TimeZone>(
    jobs: &[Arc<JobResource>],
    now: &DateTime<Z>,
    granularity: Duration,
) -> Vec<PendingRun> {
    let next_hour = now.clone() + TimeDelta::hours(1);
    let this_hour_fields = CalendarFields::of(now);
    let next_hour_fields = CalendarFields::of(&next_hour);
    let now_secs = now.timestamp();

    let mut candidates = Vec::new();
    for job in jobs {
        let Some(schedule) = &job.schedule else {
            continue;
        };
        if !job.is_enabled() || !schedule.enabled {
            continue;
        }
        for run in &schedule.runs {
            let mut run_times = Vec::with_capacity(2);
            if run.calendar.matches_fields(&this_hour_fields) {
                run_times.extend(run_time_in_hour(now, run.calendar.minute));
            }
            if run.calendar.matches_fields(&next_hour_fields) {
                run_times.extend(run_time_in_hour(&next_hour, run.calendar.minute));
            }
            for run_time in run_times {
                if !passes_debounce(run_time.timestamp(), run.last_run(), now_secs, granularity) {
                    trace!(
                        "Drop: Job={} run={} last_run={}",
                        job.name,
                        run_time,
                        run.last_run()
                    );
                    continue;
                }
                insert_ordered(
                    &mut candidates,
                    PendingRun {
                        job: job.clone(),
                        run: run.clone(),
                        run_time,
                        priority: run.priority.filter(|p| *p > 0).unwrap_or(job.priority),
                    },
                );
            }
        }
    }
    candidates
}

/// An upcoming run for status listings
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub job: String,
    pub level: JobLevel,
    pub priority: u32,
    pub run_time: DateTime<Utc>,
    pub schedule: String,
    pub pool: String,
}

pub struct JobScheduler {
    resources: Arc<Resources>,
    zone: ScheduleZone,
    granularity: Duration,
    candidates: Mutex<Vec<PendingRun>>,
    one_shot: Mutex<Option<Arc<JobResource>>>,
}

impl JobScheduler {
    pub fn new(resources: Arc<Resources>, zone: ScheduleZone, granularity: Duration) -> Self {
        Self {
            resources,
            zone,
            granularity,
            candidates: Mutex::new(Vec::new()),
            one_shot: Mutex::new(None),
        }
    }

    fn candidates(&self) -> MutexGuard<'_, Vec<PendingRun>> {
        self.candidates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `wait_for_next_job` return this job immediately
    pub fn run_once(&self, job: Arc<JobResource>) {
        *self.one_shot.lock().unwrap_or_else(PoisonError::into_inner) = Some(job);
    }

    /// Scan all schedules at `now` and merge the matches into the candidate list
    pub fn scan(&self, now: DateTime<Utc>) -> usize {
        let found = match self.zone {
            ScheduleZone::Local => find_runs(
                &self.resources.jobs,
                &now.with_timezone(&Local),
                self.granularity,
            ),
            ScheduleZone::Named(tz) => {
                find_runs(&self.resources.jobs, &now.with_timezone(&tz), self.granularity)
            }
        };
        let count = found.len();
        let mut candidates = self.candidates();
        for entry in found {
            insert_ordered(&mut candidates, entry);
        }
        debug!("Schedule scan found {} runs, {} pending", count, candidates.len());
        count
    }

    /// Copy of the candidate list
    pub fn pending(&self) -> Vec<PendingRun> {
        self.candidates().clone()
    }

    /// Wait for the next due job and build its context
    ///
    /// Returns `None` once the token is canceled.
    pub async fn wait_for_next_job(&self, cancellation_token: &CancellationToken) -> Option<JobHandle> {
        let one_shot = self
            .one_shot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(definition) = one_shot {
            if definition.is_enabled() {
                info!("Running job {} on request", definition.name);
                return Some(JobContext::new(definition));
            }
            info!("Job {} is disabled, not running it", definition.name);
        }

        loop {
            if self.candidates().is_empty() {
                self.scan(Utc::now());
            }
            let next = {
                let mut candidates = self.candidates();
                if candidates.is_empty() {
                    None
                } else {
                    Some(candidates.remove(0))
                }
            };
            let Some(next) = next else {
                tokio::select! {
                    _ = tokio::time::sleep(self.granularity) => {}
                    _ = cancellation_token.cancelled() => return None,
                }
                continue;
            };

            debug!("Dequeued job {} due at {}", next.job.name, next.run_time);
            loop {
                let remaining = (next.run_time - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = cancellation_token.cancelled() => return None,
                }
            }

            if !next.job.is_enabled() {
                debug!("Job {} is disabled, skipping scheduled run", next.job.name);
                continue;
            }
            next.run.mark_run(Utc::now());
            let job = JobContext::new(next.job.clone());
            job.apply_run_overrides(&next.run);
            info!(
                "Scheduled job {} due at {} (priority {})",
                next.job.name,
                next.run_time.format("%Y-%m-%d %H:%M:%S UTC"),
                job.priority()
            );
            return Some(job);
        }
    }

    /// Calendar matches in the `hours` hours starting at `now`, for listings
    pub fn upcoming(&self, now: DateTime<Utc>, hours: u32) -> Vec<UpcomingRun> {
        match self.zone {
            ScheduleZone::Local => upcoming_runs(&self.resources.jobs, &now.with_timezone(&Local), hours),
            ScheduleZone::Named(tz) => {
                upcoming_runs(&self.resources.jobs, &now.with_timezone(&tz), hours)
            }
        }
    }
}

fn upcoming_runs<Z: TimeZone>(
    jobs: &[Arc<JobResource>],
    now: &DateTime<Z>,
    hours: u32,
) -> Vec<UpcomingRun> {
    let now_utc = now.with_timezone(&Utc);
    let mut runs = Vec::new();
    for job in jobs {
        let Some(schedule) = &job.schedule else {
            continue;
        };
        if !job.is_enabled() || !schedule.enabled {
            continue;
        }
        for offset in 0..=i64::from(hours) {
            let instant = now.clone() + TimeDelta::hours(offset);
            let fields = CalendarFields::of(&instant);
            for run in &schedule.runs {
                if !run.calendar.matches_fields(&fields) {
                    continue;
                }
                let Some(run_time) = run_time_in_hour(&instant, run.calendar.minute) else {
                    continue;
                };
                if run_time < now_utc || run_time > now_utc + TimeDelta::hours(i64::from(hours)) {
                    continue;
                }
                let level = match job.job_type {
                    super::types::JobType::Admin | super::types::JobType::Restore => JobLevel::None,
                    job_type => run
                        .level
                        .or(job.level)
                        .unwrap_or_else(|| JobLevel::default_for(job_type)),
                };
                runs.push(UpcomingRun {
                    job: job.name.clone(),
                    level,
                    priority: run.priority.filter(|p| *p > 0).unwrap_or(job.priority),
                    run_time,
                    schedule: schedule.name.clone(),
                    pool: run.pool.as_ref().unwrap_or(&job.pool).name.clone(),
                });
            }
        }
    }
    runs.sort_by(|a, b| {
        a.run_time
            .cmp(&b.run_time)
            .then(a.priority.cmp(&b.priority))
    });
    runs
}
