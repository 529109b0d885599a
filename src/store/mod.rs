mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::StoreResult;
use crate::model::{BackupJob, DatabaseConfig, JobStatus, canonical_tag};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// 1-based page request, clamped to sane bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: if limit == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                limit.min(MAX_PAGE_SIZE)
            },
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    FileSize,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Filters, paging and ordering for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub statuses: Vec<JobStatus>,
    pub types: Vec<String>,
    /// Case-insensitive match against host, database and type.
    pub search: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub pagination: Pagination,
    pub sort: SortField,
    pub direction: SortDirection,
}

impl JobQuery {
    /// Type filters mapped to the tags jobs are stored under.
    pub(crate) fn canonical_types(&self) -> Vec<String> {
        self.types.iter().map(|t| canonical_tag(t)).collect()
    }

    pub(crate) fn matches(&self, job: &BackupJob) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if !self.types.is_empty() && !self.canonical_types().contains(&job.db_type) {
            return false;
        }
        if let Some(from) = self.created_from {
            if job.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if job.created_at > to {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(term) => {
                let term = term.to_lowercase();
                [&job.host, &job.database, &job.db_type]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&term))
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

/// Terminal artifact write for a job that reached `Completed` (or `Failed`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUpdate {
    pub file_path: String,
    pub object_key: Option<String>,
    pub file_size: u64,
    pub status: JobStatus,
    /// Non-fatal annotation, e.g. an upload failure on a completed job.
    pub error: Option<String>,
}

/// Persistence for job records and saved connection profiles.
///
/// Status writes must respect [`JobStatus::can_transition_to`]; implementations
/// reject anything else with `StoreError::InvalidTransition`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_job(&self, job: &BackupJob) -> StoreResult<()>;
    async fn get_job(&self, id: &str) -> StoreResult<Option<BackupJob>>;
    async fn update_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> StoreResult<()>;
    async fn update_artifact(&self, id: &str, update: &ArtifactUpdate) -> StoreResult<()>;
    async fn list_jobs(&self, query: &JobQuery) -> StoreResult<Page<BackupJob>>;
    async fn delete_job(&self, id: &str) -> StoreResult<()>;
    async fn job_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<JobStats>;

    async fn create_config(&self, config: &DatabaseConfig) -> StoreResult<()>;
    async fn get_config(&self, id: &str) -> StoreResult<Option<DatabaseConfig>>;
    async fn list_configs(&self, pagination: Pagination) -> StoreResult<Page<DatabaseConfig>>;
    async fn update_config(&self, config: &DatabaseConfig) -> StoreResult<()>;
    async fn delete_config(&self, id: &str) -> StoreResult<()>;
}
