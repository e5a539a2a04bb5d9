use super::{Catalog, CatalogConnection, JobRecord};
use crate::errors::{CatalogError, CatalogResult};
use crate::job_scheduling::types::JobId;
use crate::resources::ClientResource;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct CatalogState {
    next_job_id: JobId,
    next_client_id: u64,
    clients: HashMap<String, u64>,
    jobs: BTreeMap<JobId, JobRecord>,
    open_connections: usize,
}

/// In-process catalog keeping job records in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<RwLock<CatalogState>>,
    refuse_connections: Arc<AtomicBool>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail, as an unreachable database would
    pub fn set_available(&self, available: bool) {
        self.refuse_connections.store(!available, Ordering::Release);
    }

    pub async fn job(&self, job_id: JobId) -> Option<JobRecord> {
        self.state.read().await.jobs.get(&job_id).cloned()
    }

    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.state.read().await.jobs.values().cloned().collect()
    }

    pub async fn open_connections(&self) -> usize {
        self.state.read().await.open_connections
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn open(&self, job: &str) -> CatalogResult<Arc<dyn CatalogConnection>> {
        if self.refuse_connections.load(Ordering::Acquire) {
            return Err(CatalogError::Open {
                catalog: "memory".to_string(),
                message: "catalog is not accepting connections".to_string(),
            });
        }
        self.state.write().await.open_connections += 1;
        debug!("Opened memory catalog connection for {}", job);
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    state: Arc<RwLock<CatalogState>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self, operation: &str) -> CatalogResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CatalogError::query(operation, "connection is closed"));
        }
        Ok(())
    }

    async fn update(&self, operation: &str, record: &JobRecord) -> CatalogResult<()> {
        self.ensure_open(operation)?;
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&record.job_id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(CatalogError::RecordNotFound {
                record: "Job".to_string(),
                id: record.job_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl CatalogConnection for MemoryConnection {
    async fn get_or_create_client(&self, client: &ClientResource) -> CatalogResult<u64> {
        self.ensure_open("get_or_create_client")?;
        let mut state = self.state.write().await;
        if let Some(id) = state.clients.get(&client.name) {
            return Ok(*id);
        }
        state.next_client_id += 1;
        let id = state.next_client_id;
        state.clients.insert(client.name.clone(), id);
        Ok(id)
    }

    async fn create_job_record(&self, record: &JobRecord) -> CatalogResult<JobId> {
        self.ensure_open("create_job_record")?;
        let mut state = self.state.write().await;
        state.next_job_id += 1;
        let job_id = state.next_job_id;
        let mut row = record.clone();
        row.job_id = job_id;
        state.jobs.insert(job_id, row);
        Ok(job_id)
    }

    async fn update_job_start(&self, record: &JobRecord) -> CatalogResult<()> {
        self.update("update_job_start", record).await
    }

    async fn update_job_end(&self, record: &JobRecord) -> CatalogResult<()> {
        self.update("update_job_end", record).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = self.state.write().await;
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}
