// dbbackup/src/scheduler/mod.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::JobSubmitter;
use crate::errors::SchedulerError;
use crate::model::DatabaseConfig;
use crate::store::{MetadataStore, Pagination};

/// Configs are read from the store this many at a time.
pub const CONFIG_PAGE_SIZE: u32 = 100;

/// Accepts both five-field (minute first) and six-field (seconds first) cron
/// expressions; five-field ones fire at second zero.
pub fn normalize_cron_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Cron registrations for saved connection profiles, at most one per config id.
///
/// The request fired by a registration is the config as it was when `add_job`
/// ran; edits to the stored config only take effect on the next `add_job`.
pub struct BackupScheduler {
    cron: JobScheduler,
    store: Arc<dyn MetadataStore>,
    submitter: Arc<dyn JobSubmitter>,
    entries: Mutex<HashMap<String, Uuid>>,
}

impl BackupScheduler {
    pub async fn new(
        store: Arc<dyn MetadataStore>,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            cron: JobScheduler::new().await?,
            store,
            submitter,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Replaces any registration for this config. Inactive configs, or ones
    /// without a cron expression, end up unscheduled.
    pub async fn add_job(&self, config: &DatabaseConfig) -> Result<(), SchedulerError> {
        // Held across remove + add so concurrent calls for one id cannot double-register.
        let mut entries = self.entries.lock().await;

        if let Some(previous) = entries.remove(&config.id) {
            if let Err(e) = self.cron.remove(&previous).await {
                warn!(config_id = %config.id, error = %e, "Failed to remove previous cron entry");
            }
        }

        if !config.is_schedulable() {
            debug!(config_id = %config.id, "Config is inactive or has no schedule, skipping");
            return Ok(());
        }

        let expression = normalize_cron_expression(&config.cron_expression);
        let request = config.to_backup_request();
        let submitter = Arc::clone(&self.submitter);
        let config_id = config.id.clone();
        let config_name = config.name.clone();

        let job = Job::new_async(expression.as_str(), move |_uuid, mut _l| {
            let submitter = Arc::clone(&submitter);
            let request = request.clone();
            let config_id = config_id.clone();
            let config_name = config_name.clone();

            Box::pin(async move {
                match submitter.submit(request).await {
                    Ok(job_id) => {
                        info!(config_id = %config_id, name = %config_name, job_id = %job_id, "Scheduled backup submitted")
                    }
                    Err(e) => {
                        warn!(config_id = %config_id, name = %config_name, error = %e, "Scheduled backup rejected")
                    }
                }
            })
        })
        .map_err(|e| SchedulerError::InvalidCron {
            config_id: config.id.clone(),
            expression: config.cron_expression.clone(),
            message: e.to_string(),
        })?;

        let uuid = self.cron.add(job).await?;
        entries.insert(config.id.clone(), uuid);
        info!(config_id = %config.id, name = %config.name, cron = %expression, "Scheduled backup");
        Ok(())
    }

    /// Drops the registration for `config_id`, if there is one.
    pub async fn remove_job(&self, config_id: &str) -> Result<(), SchedulerError> {
        let mut entries = self.entries.lock().await;
        if let Some(uuid) = entries.remove(config_id) {
            match self.cron.remove(&uuid).await {
                Ok(()) => info!(config_id, "Unscheduled backup"),
                Err(e) => warn!(config_id, error = %e, "Failed to remove cron entry"),
            }
        }
        Ok(())
    }

    /// Registers every active config with a schedule. A config that cannot be
    /// scheduled is logged and skipped. Returns how many were registered.
    pub async fn load_all(&self) -> Result<usize, SchedulerError> {
        let mut scheduled = 0;
        let mut page = 1;
        loop {
            let batch = self
                .store
                .list_configs(Pagination::new(page, CONFIG_PAGE_SIZE))
                .await?;
            let fetched = batch.items.len();

            for config in batch.items.iter().filter(|c| c.is_schedulable()) {
                match self.add_job(config).await {
                    Ok(()) => scheduled += 1,
                    Err(e) => {
                        warn!(config_id = %config.id, cron = %config.cron_expression, error = %e, "Skipping config that could not be scheduled")
                    }
                }
            }

            if fetched < CONFIG_PAGE_SIZE as usize
                || u64::from(page) * u64::from(CONFIG_PAGE_SIZE) >= batch.total
            {
                break;
            }
            page += 1;
        }

        info!(scheduled, "Loaded backup schedules");
        Ok(scheduled)
    }

    /// Starts the cron loop and registers the stored schedules.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        self.cron.start().await?;
        self.load_all().await
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut cron = self.cron.clone();
        cron.shutdown().await?;
        self.entries.lock().await.clear();
        info!("Backup scheduler stopped");
        Ok(())
    }

    /// Registers a housekeeping task that is not tied to a stored config.
    pub async fn add_maintenance<F, Fut>(
        &self,
        name: &str,
        expression: &str,
        task: F,
    ) -> Result<Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let normalized = normalize_cron_expression(expression);
        let task = Arc::new(task);
        let job = Job::new_async(normalized.as_str(), move |_uuid, mut _l| {
            let task = Arc::clone(&task);
            Box::pin(async move { task().await })
        })
        .map_err(|e| SchedulerError::InvalidCron {
            config_id: name.to_string(),
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        let uuid = self.cron.add(job).await?;
        info!(task = name, cron = %normalized, "Scheduled maintenance task");
        Ok(uuid)
    }

    pub async fn scheduled_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_scheduled(&self, config_id: &str) -> bool {
        self.entries.lock().await.contains_key(config_id)
    }
}
