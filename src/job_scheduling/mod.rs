//! Job scheduling subsystem of the director
//!
//! This module turns configured schedules into running backup jobs:
//! - Calendar matching of schedule run clauses against wall clock time
//! - Hourly lookahead of runs due within the next two hours
//! - Admission control against storage, client and job concurrency limits
//! - Running jobs through their type specific handler with catalog records
//!
//! The system is built around four main components:
//! - `Calendar`: bitset calendars matched against an instant
//! - `JobScheduler`: lookahead scans and sleeping until the next run
//! - `JobQueue`: waiting/ready/running lists served by elastic workers
//! - `JobExecutor`: per job lifecycle from catalog setup to final status

pub mod api;
pub mod calendar;
pub mod cancel;
pub mod handlers;
pub mod job_context;
pub mod job_executor;
pub mod job_queue;
pub mod job_queue_runner;
pub mod job_scheduler;
pub mod registry;
pub mod scripts;
pub mod types;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use api::{Director, DirectorStatus};
pub use calendar::Calendar;
pub use handlers::{JobHandler, JobHandlers};
pub use job_context::{JobContext, JobHandle, JobSnapshot};
pub use job_executor::JobExecutor;
pub use job_queue::JobQueue;
pub use job_queue_runner::JobEngine;
pub use job_scheduler::JobScheduler;
pub use registry::JobRegistry;
pub use types::*;
