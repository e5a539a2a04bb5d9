//! Catalog collaborator contract
//!
//! The director records every job in a catalog: a start record when the job
//! is set up, an updated start record when it begins running and an end
//! record once it has finished. SQL backends live outside this crate; the
//! [`memory`] module provides the implementation used by the binary and the
//! tests.

use crate::errors::CatalogResult;
use crate::job_scheduling::types::{JobId, JobLevel, JobStatus, JobType};
use crate::resources::ClientResource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub mod memory;

pub use memory::MemoryCatalog;

/// Catalog row describing one job instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    /// Unique job name
    pub job: String,
    /// Job definition name
    pub name: String,
    pub job_type: JobType,
    pub level: JobLevel,
    pub status: JobStatus,
    pub client_id: Option<u64>,
    pub pool: String,
    pub sched_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub job_bytes: u64,
    pub job_files: u64,
}

/// Opens per-job catalog connections
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn open(&self, job: &str) -> CatalogResult<Arc<dyn CatalogConnection>>;
}

/// A connection owned by a single job
#[async_trait]
pub trait CatalogConnection: Send + Sync {
    async fn get_or_create_client(&self, client: &ClientResource) -> CatalogResult<u64>;

    /// Insert the job row and return its authoritative JobId
    async fn create_job_record(&self, record: &JobRecord) -> CatalogResult<JobId>;

    async fn update_job_start(&self, record: &JobRecord) -> CatalogResult<()>;

    async fn update_job_end(&self, record: &JobRecord) -> CatalogResult<()>;

    async fn close(&self);
}
