use crate::errors::{ConfigError, ConfigResult};
use crate::job_scheduling::calendar::{BitSet, Calendar};
use crate::job_scheduling::types::{JobLevel, JobType};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;

/// Top level director configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub director: DirectorConfig,
    #[serde(default)]
    pub client: Vec<ClientConfig>,
    #[serde(default)]
    pub storage: Vec<StorageConfig>,
    #[serde(default)]
    pub pool: Vec<PoolConfig>,
    #[serde(default)]
    pub schedule: Vec<ScheduleConfig>,
    #[serde(default)]
    pub job: Vec<JobConfig>,
}

/// Daemon wide settings for the scheduler, queue and watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorConfig {
    #[serde(default = "default_director_name")]
    pub name: String,
    /// Maximum number of queue workers, i.e. jobs running at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Scheduler polling interval; also the scan granularity for the debounce window
    #[serde(default = "default_scan_interval", with = "duration_serde::duration")]
    pub scan_interval: Duration,
    /// Idle time after which a queue worker retires
    #[serde(default = "default_worker_idle_timeout", with = "duration_serde::duration")]
    pub worker_idle_timeout: Duration,
    /// Pause between promotion passes while jobs wait on resources
    #[serde(default = "default_queue_poll_interval", with = "duration_serde::duration")]
    pub queue_poll_interval: Duration,
    /// Longest single sleep of a job waiting for its start time
    #[serde(default = "default_start_time_recheck", with = "duration_serde::duration")]
    pub start_time_recheck: Duration,
    #[serde(default = "default_watchdog_interval", with = "duration_serde::duration")]
    pub watchdog_interval: Duration,
    /// IANA zone for calendar matching; host local time when unset
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            name: default_director_name(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            scan_interval: default_scan_interval(),
            worker_idle_timeout: default_worker_idle_timeout(),
            queue_poll_interval: default_queue_poll_interval(),
            start_time_recheck: default_start_time_recheck(),
            watchdog_interval: default_watchdog_interval(),
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_resource_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default = "default_resource_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default = "default_pool_type")]
    pub pool_type: String,
    /// Storages used by jobs that do not name their own
    #[serde(default)]
    pub storage: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub run: Vec<RunConfig>,
}

/// One run clause of a schedule
///
/// Omitted calendar lists are wildcards. Values are written the way people
/// count: hours 0-23, days of month 1-31, months 1-12, weekdays 0-6 with
/// Sunday as 0, weeks of month 1-5 and ISO weeks of year 0-53.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub level: Option<JobLevel>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub full_pool: Option<String>,
    #[serde(default)]
    pub incremental_pool: Option<String>,
    #[serde(default)]
    pub differential_pool: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub messages: Option<String>,
    #[serde(default)]
    pub spool_data: Option<bool>,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub hours: Option<Vec<usize>>,
    #[serde(default)]
    pub days_of_month: Option<Vec<usize>>,
    #[serde(default)]
    pub months: Option<Vec<usize>>,
    #[serde(default)]
    pub weekdays: Option<Vec<usize>>,
    #[serde(default)]
    pub weeks_of_month: Option<Vec<usize>>,
    #[serde(default)]
    pub weeks_of_year: Option<Vec<usize>>,
}

/// When a run script fires relative to the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptWhen {
    Before,
    After,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScriptConfig {
    pub command: String,
    pub when: ScriptWhen,
    #[serde(default = "default_true")]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub fail_job_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub level: Option<JobLevel>,
    pub client: String,
    pub pool: String,
    #[serde(default)]
    pub full_pool: Option<String>,
    #[serde(default)]
    pub incremental_pool: Option<String>,
    #[serde(default)]
    pub differential_pool: Option<String>,
    /// Storages for this job; the pool's storages when empty
    #[serde(default)]
    pub storage: Vec<String>,
    #[serde(default)]
    pub fileset: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub messages: Option<String>,
    #[serde(default = "default_job_priority")]
    pub priority: u32,
    #[serde(default = "default_resource_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub spool_data: bool,
    #[serde(default)]
    pub reschedule_on_error: bool,
    #[serde(default = "default_reschedule_interval", with = "duration_serde::duration")]
    pub reschedule_interval: Duration,
    #[serde(default)]
    pub reschedule_times: u32,
    #[serde(default, with = "duration_serde::option_duration")]
    pub max_start_delay: Option<Duration>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub max_run_time: Option<Duration>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub max_wait_time: Option<Duration>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub full_max_wait_time: Option<Duration>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub differential_max_wait_time: Option<Duration>,
    #[serde(default, with = "duration_serde::option_duration")]
    pub incremental_max_wait_time: Option<Duration>,
    #[serde(default)]
    pub run_script: Vec<RunScriptConfig>,
}

impl RunConfig {
    /// Translate the human friendly lists into calendar bitsets
    pub fn calendar(&self, schedule: &str) -> ConfigResult<Calendar> {
        if self.minute > 59 {
            return Err(ConfigError::invalid(
                format!("schedule {schedule} minute"),
                format!("{} is outside 0-59", self.minute),
            ));
        }
        Ok(Calendar {
            hour: bitset(schedule, "hours", &self.hours, 0)?,
            mday: bitset(schedule, "days_of_month", &self.days_of_month, 1)?,
            month: bitset(schedule, "months", &self.months, 1)?,
            wday: bitset(schedule, "weekdays", &self.weekdays, 0)?,
            wom: bitset(schedule, "weeks_of_month", &self.weeks_of_month, 1)?,
            woy: bitset(schedule, "weeks_of_year", &self.weeks_of_year, 0)?,
            minute: self.minute,
        })
    }
}

/// An omitted list is a wildcard; an empty one could never match and is rejected
fn bitset<const N: usize>(
    schedule: &str,
    field: &str,
    values: &Option<Vec<usize>>,
    base: usize,
) -> ConfigResult<BitSet<N>> {
    let Some(values) = values else {
        return Ok(BitSet::full());
    };
    if values.is_empty() {
        return Err(ConfigError::invalid(
            format!("schedule {schedule} {field}"),
            "an empty list never matches; omit the field to match any value",
        ));
    }
    let indices = values
        .iter()
        .map(|v| v.checked_sub(base).unwrap_or(N))
        .collect::<Vec<_>>();
    BitSet::from_indices(indices).map_err(|_| {
        ConfigError::invalid(
            format!("schedule {schedule} {field}"),
            format!("values must lie within {base}-{}", N - 1 + base),
        )
    })
}

impl Config {
    /// Load from the file named by `DIRECTOR_CONFIG`, else the default file
    pub fn load() -> ConfigResult<Self> {
        let config_file = std::env::var("DIRECTOR_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(&config_file)
    }

    /// Load a TOML file, then apply `DIRECTOR_*` overrides to the `[director]` table
    pub fn load_from_file<P: AsRef<Path>>(config_file: P) -> ConfigResult<Self> {
        let path = config_file.as_ref();
        if !path.exists() {
            return Err(ConfigError::invalid(
                "config file",
                format!("{} does not exist", path.display()),
            ));
        }
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(director_env())
            .extract()?;
        info!(
            "Loaded configuration from {} ({} jobs, {} schedules)",
            path.display(),
            config.job.len(),
            config.schedule.len()
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string without environment overrides
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Ok(Figment::new().merge(Toml::string(contents)).extract()?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.director.max_concurrent_jobs == 0 {
            return Err(ConfigError::invalid(
                "director.max_concurrent_jobs",
                "must be at least 1",
            ));
        }
        if self.director.scan_interval < Duration::from_secs(2) {
            return Err(ConfigError::invalid(
                "director.scan_interval",
                "must be at least 2s",
            ));
        }
        if let Some(zone) = &self.director.timezone {
            zone.parse::<chrono_tz::Tz>()
                .map_err(|e| ConfigError::invalid("director.timezone", e.to_string()))?;
        }
        Ok(())
    }
}

fn director_env() -> Env {
    Env::prefixed("DIRECTOR_")
        .filter(|key| !key.as_str().eq_ignore_ascii_case("config"))
        .map(|key| format!("director.{}", key.as_str()).into())
}
