// dbbackup/src/engine/mod.rs
//! Fire-and-track backup execution.
//!
//! `submit` validates, records a `Pending` job and hands the work to a supervised
//! task; everything after that is visible only through the job record and the
//! webhook payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};

use crate::backup::{DumpStrategy, StrategyRegistry};
use crate::config::{DEFAULT_JOB_TIMEOUT, DEFAULT_MAX_CONCURRENT_JOBS};
use crate::errors::{ExecutionError, ValidationError};
use crate::model::{BackupJob, BackupRequest, BackupResult, JobStatus};
use crate::notify::Notifier;
use crate::storage::{ObjectStorage, UploadMetadata};
use crate::store::{ArtifactUpdate, MetadataStore};

/// Anything that can accept a backup request and hand back a job id.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: BackupRequest) -> Result<String, ValidationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Hard limit on a single dump, after which the subprocess is killed.
    pub job_timeout: Duration,
    /// Dumps allowed to run at once; extra jobs wait in `Pending`.
    pub max_concurrent_jobs: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

/// Collaborators the engine drives. Passed in explicitly, never global.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn MetadataStore>,
    pub registry: StrategyRegistry,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone)]
pub struct BackupEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    deps: EngineDeps,
    settings: EngineSettings,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl BackupEngine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                deps,
                settings,
                permits,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.inner.deps.store
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    /// Jobs still queued or running.
    pub fn active_jobs(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Validates the request, records a `Pending` job and starts it in the background.
    ///
    /// Returns the job id, or an empty string if the job record could not be
    /// persisted. The backup still runs in that case, it just cannot be tracked.
    pub async fn submit(&self, request: BackupRequest) -> Result<String, ValidationError> {
        request.validate()?;

        let started_at = Utc::now();
        let job = BackupJob::pending(&request, started_at);
        let job_id = match self.inner.deps.store.create_job(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, db_type = %job.db_type, host = %job.host, "Backup job submitted");
                Some(job.id)
            }
            Err(e) => {
                warn!(db_type = %job.db_type, host = %job.host, error = %e, "Failed to save backup metadata, job will run untracked");
                None
            }
        };

        let span = info_span!("backup_job", job_id = job_id.as_deref().unwrap_or(""), db_type = %request.db_type);
        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn(supervise(inner, job_id.clone(), request, started_at).instrument(span));

        Ok(job_id.unwrap_or_default())
    }

    /// Waits for every job submitted so far to finish.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Cancels queued and running dumps (they end `Failed`) and waits for them.
    pub async fn shutdown(&self) {
        info!(active = self.active_jobs(), "Shutting down backup engine");
        self.inner.shutdown.cancel();
        self.drain().await;
    }
}

#[async_trait]
impl JobSubmitter for BackupEngine {
    async fn submit(&self, request: BackupRequest) -> Result<String, ValidationError> {
        BackupEngine::submit(self, request).await
    }
}

/// Runs the job in its own task so a panic is contained and still ends the job.
async fn supervise(
    inner: Arc<EngineInner>,
    job_id: Option<String>,
    request: BackupRequest,
    started_at: DateTime<Utc>,
) {
    let webhook = request.webhook_url().map(str::to_string);
    // Set once a payload has gone to the notifier; a job is reported at most once.
    let notified = Arc::new(AtomicBool::new(false));
    let worker = tokio::spawn(
        Arc::clone(&inner)
            .execute(job_id.clone(), request, started_at, Arc::clone(&notified))
            .in_current_span(),
    );

    if let Err(e) = worker.await {
        let reason = if e.is_panic() {
            "backup worker panicked"
        } else {
            "backup worker was aborted"
        };
        error!(error = %e, "{}", reason);
        inner
            .record_status(job_id.as_deref(), JobStatus::Failed, Some(reason))
            .await;
        if let Some(url) = webhook.filter(|_| !notified.swap(true, Ordering::SeqCst)) {
            let id = job_id.unwrap_or_default();
            inner
                .notify(&url, &BackupResult::failure(&id, reason, started_at))
                .await;
        }
    }
}

impl EngineInner {
    async fn execute(
        self: Arc<Self>,
        job_id: Option<String>,
        request: BackupRequest,
        started_at: DateTime<Utc>,
        notified: Arc<AtomicBool>,
    ) {
        let result = self.run_pipeline(job_id.as_deref(), &request, started_at).await;
        if let Some(url) = request.webhook_url() {
            notified.store(true, Ordering::SeqCst);
            self.notify(url, &result).await;
        }
    }

    async fn run_pipeline(
        &self,
        job_id: Option<&str>,
        request: &BackupRequest,
        started_at: DateTime<Utc>,
    ) -> BackupResult {
        let id = job_id.unwrap_or_default();

        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.fail(job_id, ExecutionError::Cancelled.to_string(), started_at).await,
            },
            _ = self.shutdown.cancelled() => {
                return self.fail(job_id, ExecutionError::Cancelled.to_string(), started_at).await;
            }
        };

        let strategy = match self.deps.registry.resolve(&request.db_type) {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(error = %e, "No dump strategy for backup type");
                return self.fail(job_id, e.to_string(), started_at).await;
            }
        };

        self.record_status(job_id, JobStatus::Generating, None).await;
        info!(db_type = %strategy.database_type(), host = %request.display_host(), "Starting backup");

        let timeout = self.settings.job_timeout;
        let dumped = tokio::select! {
            outcome = tokio::time::timeout(timeout, strategy.run(request)) => {
                outcome.unwrap_or(Err(ExecutionError::TimedOut(timeout)))
            }
            _ = self.shutdown.cancelled() => Err(ExecutionError::Cancelled),
        };

        match dumped {
            Ok(file_path) => {
                info!(job_id = id, file = %file_path.display(), "Backup completed");
                self.complete(job_id, request, strategy.as_ref(), file_path, started_at)
                    .await
            }
            Err(e) => {
                warn!(error = %e, "Backup failed");
                self.fail(job_id, e.to_string(), started_at).await
            }
        }
    }

    async fn complete(
        &self,
        job_id: Option<&str>,
        request: &BackupRequest,
        strategy: &dyn DumpStrategy,
        file_path: PathBuf,
        started_at: DateTime<Utc>,
    ) -> BackupResult {
        let file_size = match tokio::fs::metadata(&file_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(file = %file_path.display(), error = %e, "Could not stat backup file");
                0
            }
        };
        let db_type = strategy.database_type().as_str().to_string();
        let host = request.display_host();
        let database = request.display_database();

        let mut metadata = BTreeMap::new();
        let mut object_key = None;
        let mut upload_error = None;
        if let Some(storage) = &self.deps.storage {
            let upload_meta = UploadMetadata {
                database_type: db_type.clone(),
                host: host.clone(),
                database: database.clone(),
                timestamp: started_at,
                file_size,
            };
            match storage.upload(&file_path, &upload_meta).await {
                Ok(key) => {
                    info!(key = %key, "Uploaded backup");
                    metadata.insert("storage".to_string(), "s3".to_string());
                    object_key = Some(key);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to upload backup, keeping local copy");
                    metadata.insert("upload_error".to_string(), e.to_string());
                    upload_error = Some(format!("upload failed: {}", e));
                }
            }
        }
        metadata.insert("database_type".to_string(), db_type);
        metadata.insert("host".to_string(), host);
        metadata.insert("database".to_string(), database);
        metadata.insert("file_size".to_string(), file_size.to_string());

        let file_path = file_path.display().to_string();
        if let Some(id) = job_id {
            let update = ArtifactUpdate {
                file_path: file_path.clone(),
                object_key: object_key.clone(),
                file_size,
                status: JobStatus::Completed,
                error: upload_error,
            };
            if let Err(e) = self.deps.store.update_artifact(id, &update).await {
                warn!(job_id = id, error = %e, "Failed to update backup metadata");
            }
        }

        BackupResult {
            job_id: job_id.unwrap_or_default().to_string(),
            success: true,
            error: None,
            file_path,
            object_key,
            metadata,
            timestamp: started_at.to_rfc3339(),
        }
    }

    async fn fail(&self, job_id: Option<&str>, error: String, started_at: DateTime<Utc>) -> BackupResult {
        self.record_status(job_id, JobStatus::Failed, Some(&error)).await;
        BackupResult::failure(job_id.unwrap_or_default(), error, started_at)
    }

    async fn record_status(&self, job_id: Option<&str>, status: JobStatus, error: Option<&str>) {
        let Some(id) = job_id else { return };
        if let Err(e) = self.deps.store.update_status(id, status, error).await {
            warn!(job_id = id, status = %status, error = %e, "Failed to update backup status");
        }
    }

    async fn notify(&self, url: &str, result: &BackupResult) {
        if let Err(e) = self.deps.notifier.notify(url, result).await {
            warn!(job_id = %result.job_id, url, error = %e, "Failed to notify webhook");
        }
    }
}
