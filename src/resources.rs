//! Resolved resource records
//!
//! Configuration refers to resources by name; here every reference is
//! resolved to a shared record once at load time so the scheduler and queue
//! only ever deal with `Arc`s that are known to exist.

use crate::config::{Config, RunScriptConfig};
use crate::errors::{ConfigError, ConfigResult};
use crate::job_scheduling::calendar::Calendar;
use crate::job_scheduling::types::{JobLevel, JobType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct ClientResource {
    pub name: String,
    pub address: Option<String>,
    pub max_concurrent_jobs: u32,
}

#[derive(Debug)]
pub struct StorageResource {
    pub name: String,
    pub address: Option<String>,
    pub media_type: Option<String>,
    pub max_concurrent_jobs: u32,
}

#[derive(Debug)]
pub struct PoolResource {
    pub name: String,
    pub pool_type: String,
    pub storage: Vec<Arc<StorageResource>>,
}

/// One run clause: when to fire and what to override when it does
#[derive(Debug)]
pub struct RunSpec {
    pub calendar: Calendar,
    pub level: Option<JobLevel>,
    pub priority: Option<u32>,
    pub pool: Option<Arc<PoolResource>>,
    pub full_pool: Option<Arc<PoolResource>>,
    pub incremental_pool: Option<Arc<PoolResource>>,
    pub differential_pool: Option<Arc<PoolResource>>,
    pub storage: Option<Arc<StorageResource>>,
    pub messages: Option<String>,
    pub spool_data: Option<bool>,
    /// Unix seconds of the last time this clause was consumed, 0 for never
    last_run: AtomicI64,
}

impl RunSpec {
    pub fn new(calendar: Calendar) -> Self {
        Self {
            calendar,
            level: None,
            priority: None,
            pool: None,
            full_pool: None,
            incremental_pool: None,
            differential_pool: None,
            storage: None,
            messages: None,
            spool_data: None,
            last_run: AtomicI64::new(0),
        }
    }

    pub fn last_run(&self) -> i64 {
        self.last_run.load(Ordering::Acquire)
    }

    pub fn mark_run(&self, at: DateTime<Utc>) {
        self.last_run.store(at.timestamp(), Ordering::Release);
    }
}

#[derive(Debug)]
pub struct ScheduleResource {
    pub name: String,
    pub enabled: bool,
    pub runs: Vec<Arc<RunSpec>>,
}

/// An external command run before or after a job on the director
#[derive(Debug, Clone)]
pub struct RunScript {
    pub command: String,
    pub before: bool,
    pub on_success: bool,
    pub on_failure: bool,
    pub fail_job_on_error: bool,
}

impl From<&RunScriptConfig> for RunScript {
    fn from(config: &RunScriptConfig) -> Self {
        Self {
            command: config.command.clone(),
            before: config.when == crate::config::ScriptWhen::Before,
            on_success: config.on_success,
            on_failure: config.on_failure,
            fail_job_on_error: config.fail_job_on_error,
        }
    }
}

/// MaxWaitTime family plus MaxRunTime
#[derive(Debug, Clone, Default)]
pub struct JobTimeouts {
    pub max_start_delay: Option<Duration>,
    pub max_run_time: Option<Duration>,
    pub max_wait_time: Option<Duration>,
    pub full_max_wait_time: Option<Duration>,
    pub differential_max_wait_time: Option<Duration>,
    pub incremental_max_wait_time: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ReschedulePolicy {
    pub on_error: bool,
    pub interval: Duration,
    pub times: u32,
}

/// A job definition
#[derive(Debug)]
pub struct JobResource {
    pub name: String,
    pub job_type: JobType,
    pub level: Option<JobLevel>,
    pub client: Arc<ClientResource>,
    pub pool: Arc<PoolResource>,
    pub full_pool: Option<Arc<PoolResource>>,
    pub incremental_pool: Option<Arc<PoolResource>>,
    pub differential_pool: Option<Arc<PoolResource>>,
    pub storage: Vec<Arc<StorageResource>>,
    pub fileset: Option<String>,
    pub schedule: Option<Arc<ScheduleResource>>,
    pub messages: Option<String>,
    pub priority: u32,
    pub max_concurrent_jobs: u32,
    pub spool_data: bool,
    pub reschedule: ReschedulePolicy,
    pub timeouts: JobTimeouts,
    pub run_scripts: Vec<RunScript>,
    enabled: AtomicBool,
}

impl JobResource {
    /// Minimal definition used by tests and embedding applications
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        client: Arc<ClientResource>,
        pool: Arc<PoolResource>,
    ) -> Self {
        Self {
            name: name.into(),
            job_type,
            level: None,
            client,
            pool,
            full_pool: None,
            incremental_pool: None,
            differential_pool: None,
            storage: Vec::new(),
            fileset: None,
            schedule: None,
            messages: None,
            priority: crate::config::defaults::DEFAULT_JOB_PRIORITY,
            max_concurrent_jobs: crate::config::defaults::DEFAULT_RESOURCE_MAX_CONCURRENT_JOBS,
            spool_data: false,
            reschedule: ReschedulePolicy {
                interval: crate::config::defaults::DEFAULT_RESCHEDULE_INTERVAL,
                ..Default::default()
            },
            timeouts: JobTimeouts::default(),
            run_scripts: Vec::new(),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Storages a new instance starts with: the job's own, else its pool's
    pub fn default_storage(&self) -> &[Arc<StorageResource>] {
        if self.storage.is_empty() {
            &self.pool.storage
        } else {
            &self.storage
        }
    }
}

/// Every resource known to the director
#[derive(Debug, Default)]
pub struct Resources {
    pub clients: Vec<Arc<ClientResource>>,
    pub storages: Vec<Arc<StorageResource>>,
    pub pools: Vec<Arc<PoolResource>>,
    pub schedules: Vec<Arc<ScheduleResource>>,
    pub jobs: Vec<Arc<JobResource>>,
}

impl Resources {
    pub fn find_job(&self, name: &str) -> Option<&Arc<JobResource>> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn find_storage(&self, name: &str) -> Option<&Arc<StorageResource>> {
        self.storages.iter().find(|storage| storage.name == name)
    }

    pub fn find_pool(&self, name: &str) -> Option<&Arc<PoolResource>> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    /// Resolve every name reference in the configuration
    pub fn from_config(config: &Config) -> ConfigResult<Self> {
        config.validate()?;

        let clients = index("Client", config.client.iter().map(|c| {
            (
                c.name.clone(),
                Arc::new(ClientResource {
                    name: c.name.clone(),
                    address: c.address.clone(),
                    max_concurrent_jobs: c.max_concurrent_jobs,
                }),
            )
        }))?;

        let storages = index("Storage", config.storage.iter().map(|s| {
            (
                s.name.clone(),
                Arc::new(StorageResource {
                    name: s.name.clone(),
                    address: s.address.clone(),
                    media_type: s.media_type.clone(),
                    max_concurrent_jobs: s.max_concurrent_jobs,
                }),
            )
        }))?;

        let mut pool_entries = Vec::with_capacity(config.pool.len());
        for p in &config.pool {
            let owner = format!("Pool \"{}\"", p.name);
            let storage = p
                .storage
                .iter()
                .map(|name| lookup(&storages, &owner, "Storage", name))
                .collect::<ConfigResult<Vec<_>>>()?;
            pool_entries.push((
                p.name.clone(),
                Arc::new(PoolResource {
                    name: p.name.clone(),
                    pool_type: p.pool_type.clone(),
                    storage,
                }),
            ));
        }
        let pools = index("Pool", pool_entries)?;

        let mut schedule_entries = Vec::with_capacity(config.schedule.len());
        for s in &config.schedule {
            let owner = format!("Schedule \"{}\"", s.name);
            let mut runs = Vec::with_capacity(s.run.len());
            for run in &s.run {
                let mut spec = RunSpec::new(run.calendar(&s.name)?);
                spec.level = run.level;
                spec.priority = run.priority;
                spec.pool = optional(&pools, &owner, "Pool", &run.pool)?;
                spec.full_pool = optional(&pools, &owner, "Pool", &run.full_pool)?;
                spec.incremental_pool = optional(&pools, &owner, "Pool", &run.incremental_pool)?;
                spec.differential_pool =
                    optional(&pools, &owner, "Pool", &run.differential_pool)?;
                spec.storage = optional(&storages, &owner, "Storage", &run.storage)?;
                spec.messages = run.messages.clone();
                spec.spool_data = run.spool_data;
                runs.push(Arc::new(spec));
            }
            schedule_entries.push((
                s.name.clone(),
                Arc::new(ScheduleResource {
                    name: s.name.clone(),
                    enabled: s.enabled,
                    runs,
                }),
            ));
        }
        let schedules = index("Schedule", schedule_entries)?;

        let mut job_entries = Vec::with_capacity(config.job.len());
        for j in &config.job {
            let owner = format!("Job \"{}\"", j.name);
            let mut job = JobResource::new(
                j.name.clone(),
                j.job_type,
                lookup(&clients, &owner, "Client", &j.client)?,
                lookup(&pools, &owner, "Pool", &j.pool)?,
            );
            job.level = j.level;
            job.full_pool = optional(&pools, &owner, "Pool", &j.full_pool)?;
            job.incremental_pool = optional(&pools, &owner, "Pool", &j.incremental_pool)?;
            job.differential_pool = optional(&pools, &owner, "Pool", &j.differential_pool)?;
            job.storage = j
                .storage
                .iter()
                .map(|name| lookup(&storages, &owner, "Storage", name))
                .collect::<ConfigResult<Vec<_>>>()?;
            if job.default_storage().is_empty() {
                return Err(ConfigError::invalid(
                    format!("job {} storage", j.name),
                    "neither the job nor its pool names a storage",
                ));
            }
            job.fileset = j.fileset.clone();
            job.schedule = optional(&schedules, &owner, "Schedule", &j.schedule)?;
            job.messages = j.messages.clone();
            job.priority = j.priority;
            job.max_concurrent_jobs = j.max_concurrent_jobs;
            job.spool_data = j.spool_data;
            job.reschedule = ReschedulePolicy {
                on_error: j.reschedule_on_error,
                interval: j.reschedule_interval,
                times: j.reschedule_times,
            };
            job.timeouts = JobTimeouts {
                max_start_delay: j.max_start_delay,
                max_run_time: j.max_run_time,
                max_wait_time: j.max_wait_time,
                full_max_wait_time: j.full_max_wait_time,
                differential_max_wait_time: j.differential_max_wait_time,
                incremental_max_wait_time: j.incremental_max_wait_time,
            };
            job.run_scripts = j.run_script.iter().map(RunScript::from).collect();
            job.set_enabled(j.enabled);
            job_entries.push((j.name.clone(), Arc::new(job)));
        }
        let jobs = index("Job", job_entries)?;

        let resources = Self {
            clients: ordered(&config.client.iter().map(|c| &c.name).collect::<Vec<_>>(), clients),
            storages: ordered(&config.storage.iter().map(|s| &s.name).collect::<Vec<_>>(), storages),
            pools: ordered(&config.pool.iter().map(|p| &p.name).collect::<Vec<_>>(), pools),
            schedules: ordered(&config.schedule.iter().map(|s| &s.name).collect::<Vec<_>>(), schedules),
            jobs: ordered(&config.job.iter().map(|j| &j.name).collect::<Vec<_>>(), jobs),
        };
        debug!(
            "Resolved {} jobs, {} clients, {} storages, {} pools, {} schedules",
            resources.jobs.len(),
            resources.clients.len(),
            resources.storages.len(),
            resources.pools.len(),
            resources.schedules.len()
        );
        Ok(resources)
    }
}

fn index<T, I>(resource: &str, entries: I) -> ConfigResult<HashMap<String, Arc<T>>>
where
    I: IntoIterator<Item = (String, Arc<T>)>,
{
    let mut map = HashMap::new();
    for (name, value) in entries {
        if map.insert(name.clone(), value).is_some() {
            return Err(ConfigError::Duplicate {
                resource: resource.to_string(),
                name,
            });
        }
    }
    Ok(map)
}

fn lookup<T>(
    map: &HashMap<String, Arc<T>>,
    owner: &str,
    resource: &str,
    name: &str,
) -> ConfigResult<Arc<T>> {
    map.get(name)
        .cloned()
        .ok_or_else(|| ConfigError::undefined(owner, resource, name))
}

fn optional<T>(
    map: &HashMap<String, Arc<T>>,
    owner: &str,
    resource: &str,
    name: &Option<String>,
) -> ConfigResult<Option<Arc<T>>> {
    name.as_deref()
        .map(|name| lookup(map, owner, resource, name))
        .transpose()
}

/// Keep declaration order so scans and listings are deterministic
fn ordered<T>(names: &[&String], mut map: HashMap<String, Arc<T>>) -> Vec<Arc<T>> {
    names.iter().filter_map(|name| map.remove(*name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [[client]]
        name = "web"
        max_concurrent_jobs = 2

        [[storage]]
        name = "tape"

        [[pool]]
        name = "default"
        storage = ["tape"]

        [[pool]]
        name = "full"

        [[schedule]]
        name = "nightly"
        [[schedule.run]]
        level = "Full"
        hours = [23]
        minute = 5
        pool = "full"

        [[job]]
        name = "web-backup"
        type = "backup"
        client = "web"
        pool = "default"
        schedule = "nightly"
        enabled = false
    "#;

    #[test]
    fn test_resolves_references() {
        let config = Config::from_toml_str(CONFIG).unwrap();
        let resources = Resources::from_config(&config).unwrap();

        let job = resources.find_job("web-backup").unwrap();
        assert_eq!(job.client.max_concurrent_jobs, 2);
        assert_eq!(job.default_storage()[0].name, "tape");
        assert!(!job.is_enabled());

        let schedule = job.schedule.as_ref().unwrap();
        assert_eq!(schedule.runs.len(), 1);
        let run = &schedule.runs[0];
        assert_eq!(run.level, Some(JobLevel::Full));
        assert_eq!(run.pool.as_ref().unwrap().name, "full");
        assert_eq!(run.calendar.minute, 5);
        assert_eq!(run.last_run(), 0);
    }

    #[test]
    fn test_dangling_reference_is_an_error() {
        let broken = CONFIG.replace("client = \"web\"", "client = \"nowhere\"");
        let config = Config::from_toml_str(&broken).unwrap();
        match Resources::from_config(&config) {
            Err(ConfigError::UndefinedReference { resource, name, .. }) => {
                assert_eq!(resource, "Client");
                assert_eq!(name, "nowhere");
            }
            other => panic!("expected undefined reference, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let doubled = format!("{CONFIG}\n[[storage]]\nname = \"tape\"\n");
        let config = Config::from_toml_str(&doubled).unwrap();
        assert!(matches!(
            Resources::from_config(&config),
            Err(ConfigError::Duplicate { .. })
        ));
    }

    #[test]
    fn test_job_without_any_storage_is_rejected() {
        let no_storage = CONFIG.replace("storage = [\"tape\"]", "");
        let config = Config::from_toml_str(&no_storage).unwrap();
        assert!(Resources::from_config(&config).is_err());
    }
}
