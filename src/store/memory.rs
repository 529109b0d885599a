// dbbackup/src/store/memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{
    ArtifactUpdate, JobQuery, JobStats, MetadataStore, Page, Pagination, SortDirection, SortField,
};
use crate::errors::{StoreError, StoreResult};
use crate::model::{BackupJob, DatabaseConfig, JobStatus};

/// Process-local store. Used when no metadata database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, BackupJob>>,
    configs: RwLock<HashMap<String, DatabaseConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_transition(job: &BackupJob, next: JobStatus) -> StoreResult<()> {
    if job.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: job.id.clone(),
            from: job.status,
            to: next,
        })
    }
}

fn paginate<T>(mut items: Vec<T>, pagination: Pagination) -> Page<T> {
    let total = items.len() as u64;
    let start = (pagination.offset() as usize).min(items.len());
    let end = (start + pagination.limit as usize).min(items.len());
    Page {
        items: items.drain(start..end).collect(),
        total,
        page: pagination.page,
        limit: pagination.limit,
    }
}

fn compare_jobs(a: &BackupJob, b: &BackupJob, field: SortField) -> Ordering {
    match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::FileSize => a.file_size.cmp(&b.file_size),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_job(&self, job: &BackupJob) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<BackupJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn update_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_transition(job, status)?;
        job.status = status;
        job.error = error.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn update_artifact(&self, id: &str, update: &ArtifactUpdate) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_transition(job, update.status)?;
        job.status = update.status;
        job.file_path = Some(update.file_path.clone());
        job.object_key = update.object_key.clone();
        job.file_size = update.file_size;
        job.error = update.error.clone();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs(&self, query: &JobQuery) -> StoreResult<Page<BackupJob>> {
        let mut matched: Vec<BackupJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            let ord = compare_jobs(a, b, query.sort).then_with(|| a.id.cmp(&b.id));
            match query.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });
        Ok(paginate(matched, query.pagination))
    }

    async fn delete_job(&self, id: &str) -> StoreResult<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn job_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<JobStats> {
        let query = JobQuery {
            created_from: from,
            created_to: to,
            ..Default::default()
        };
        let mut stats = JobStats::default();
        for job in self.jobs.read().await.values().filter(|j| query.matches(j)) {
            stats.total += 1;
            *stats.by_type.entry(job.db_type.clone()).or_default() += 1;
            *stats.by_status.entry(job.status.to_string()).or_default() += 1;
        }
        Ok(stats)
    }

    async fn create_config(&self, config: &DatabaseConfig) -> StoreResult<()> {
        let mut configs = self.configs.write().await;
        if configs.contains_key(&config.id) {
            return Err(StoreError::Duplicate(config.id.clone()));
        }
        configs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn get_config(&self, id: &str) -> StoreResult<Option<DatabaseConfig>> {
        Ok(self.configs.read().await.get(id).cloned())
    }

    async fn list_configs(&self, pagination: Pagination) -> StoreResult<Page<DatabaseConfig>> {
        let mut configs: Vec<DatabaseConfig> = self.configs.read().await.values().cloned().collect();
        configs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(configs, pagination))
    }

    async fn update_config(&self, config: &DatabaseConfig) -> StoreResult<()> {
        let mut configs = self.configs.write().await;
        let existing = configs
            .get_mut(&config.id)
            .ok_or_else(|| StoreError::NotFound(config.id.clone()))?;
        let created_at = existing.created_at;
        *existing = config.clone();
        existing.created_at = created_at;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_config(&self, id: &str) -> StoreResult<()> {
        self.configs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
