/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
use std::time::Duration;

// Director defaults
pub const DEFAULT_DIRECTOR_NAME: &str = "backup-director";
pub const DEFAULT_CONFIG_FILE: &str = "director.toml";
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 1;

// Scheduler and queue timing
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_START_TIME_RECHECK: Duration = Duration::from_secs(30);
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

// Resource defaults
pub const DEFAULT_RESOURCE_MAX_CONCURRENT_JOBS: u32 = 1;
pub const DEFAULT_JOB_PRIORITY: u32 = 10;
pub const DEFAULT_RESCHEDULE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_POOL_TYPE: &str = "Backup";

pub fn default_director_name() -> String {
    DEFAULT_DIRECTOR_NAME.to_string()
}

pub fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}

pub fn default_scan_interval() -> Duration {
    DEFAULT_SCAN_INTERVAL
}

pub fn default_worker_idle_timeout() -> Duration {
    DEFAULT_WORKER_IDLE_TIMEOUT
}

pub fn default_queue_poll_interval() -> Duration {
    DEFAULT_QUEUE_POLL_INTERVAL
}

pub fn default_start_time_recheck() -> Duration {
    DEFAULT_START_TIME_RECHECK
}

pub fn default_watchdog_interval() -> Duration {
    DEFAULT_WATCHDOG_INTERVAL
}

pub fn default_resource_max_concurrent_jobs() -> u32 {
    DEFAULT_RESOURCE_MAX_CONCURRENT_JOBS
}

pub fn default_job_priority() -> u32 {
    DEFAULT_JOB_PRIORITY
}

pub fn default_reschedule_interval() -> Duration {
    DEFAULT_RESCHEDULE_INTERVAL
}

pub fn default_pool_type() -> String {
    DEFAULT_POOL_TYPE.to_string()
}

pub fn default_true() -> bool {
    true
}
