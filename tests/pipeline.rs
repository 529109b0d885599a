// dbbackup/tests/pipeline.rs
//! Engine and scheduler behaviour with in-process collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify, Semaphore};

use dbbackup::backup::{DumpStrategy, StrategyRegistry};
use dbbackup::engine::{BackupEngine, EngineDeps, EngineSettings};
use dbbackup::errors::{ExecutionError, NotificationError, StoreError, StoreResult, UploadError};
use dbbackup::model::{
    BackupJob, BackupRequest, BackupResult, Connection, DatabaseConfig, DatabaseType, JobStatus,
};
use dbbackup::notify::Notifier;
use dbbackup::scheduler::BackupScheduler;
use dbbackup::storage::{ObjectStorage, UploadMetadata, object_key_for};
use dbbackup::store::{
    ArtifactUpdate, JobQuery, JobStats, MemoryStore, MetadataStore, Page, Pagination,
};

const WEBHOOK: &str = "http://hooks.test/backup";

#[derive(Clone, Copy)]
enum Outcome {
    Write(&'static [u8]),
    Fail,
    Panic,
    Hang,
}

struct FakeDump {
    db_type: DatabaseType,
    root: PathBuf,
    outcome: Outcome,
    gate: Option<Arc<Semaphore>>,
    started: Arc<Notify>,
    running: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl FakeDump {
    fn new(db_type: DatabaseType, root: &Path, outcome: Outcome) -> Self {
        Self {
            db_type,
            root: root.to_path_buf(),
            outcome,
            gate: None,
            started: Arc::new(Notify::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    /// Each run blocks until the test adds a permit.
    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl DumpStrategy for FakeDump {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn run(&self, request: &BackupRequest) -> Result<PathBuf, ExecutionError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = match self.outcome {
            Outcome::Write(bytes) => {
                let path = self
                    .root
                    .join(format!("{}_{}.sql", request.display_database(), n));
                tokio::fs::write(&path, bytes).await?;
                Ok(path)
            }
            Outcome::Fail => Err(ExecutionError::EmptyOutput("dump produced nothing".into())),
            Outcome::Panic => panic!("dump tool crashed"),
            Outcome::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, BackupResult)>>,
    /// Panic right after recording, like a webhook client that crashes mid-call.
    crash_after_send: AtomicBool,
}

impl RecordingNotifier {
    async fn sent(&self) -> Vec<(String, BackupResult)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, url: &str, result: &BackupResult) -> Result<(), NotificationError> {
        self.sent.lock().await.push((url.to_string(), result.clone()));
        if self.crash_after_send.load(Ordering::SeqCst) {
            panic!("webhook client crashed");
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeStorage {
    fail: bool,
    uploads: Mutex<Vec<UploadMetadata>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(&self, file_path: &Path, metadata: &UploadMetadata) -> Result<String, UploadError> {
        let key = object_key_for(&metadata.database_type, file_path);
        if self.fail {
            return Err(UploadError::Put {
                key,
                message: "bucket unreachable".into(),
            });
        }
        self.uploads.lock().await.push(metadata.clone());
        Ok(key)
    }

    async fn delete(&self, _object_key: &str) -> Result<(), UploadError> {
        Ok(())
    }

    async fn presigned_url(&self, object_key: &str, _ttl: Duration) -> Result<String, UploadError> {
        Ok(format!("https://bucket.test/{object_key}"))
    }
}

/// Store whose job inserts always fail; everything else goes to memory.
#[derive(Default)]
struct UnavailableJobStore {
    inner: MemoryStore,
}

#[async_trait]
impl MetadataStore for UnavailableJobStore {
    async fn create_job(&self, _job: &BackupJob) -> StoreResult<()> {
        Err(StoreError::Unavailable("metadata database is down".into()))
    }
    async fn get_job(&self, id: &str) -> StoreResult<Option<BackupJob>> {
        self.inner.get_job(id).await
    }
    async fn update_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> StoreResult<()> {
        self.inner.update_status(id, status, error).await
    }
    async fn update_artifact(&self, id: &str, update: &ArtifactUpdate) -> StoreResult<()> {
        self.inner.update_artifact(id, update).await
    }
    async fn list_jobs(&self, query: &JobQuery) -> StoreResult<Page<BackupJob>> {
        self.inner.list_jobs(query).await
    }
    async fn delete_job(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_job(id).await
    }
    async fn job_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<JobStats> {
        self.inner.job_stats(from, to).await
    }
    async fn create_config(&self, config: &DatabaseConfig) -> StoreResult<()> {
        self.inner.create_config(config).await
    }
    async fn get_config(&self, id: &str) -> StoreResult<Option<DatabaseConfig>> {
        self.inner.get_config(id).await
    }
    async fn list_configs(&self, pagination: Pagination) -> StoreResult<Page<DatabaseConfig>> {
        self.inner.list_configs(pagination).await
    }
    async fn update_config(&self, config: &DatabaseConfig) -> StoreResult<()> {
        self.inner.update_config(config).await
    }
    async fn delete_config(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_config(id).await
    }
}

struct Harness {
    engine: BackupEngine,
    store: Arc<dyn MetadataStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(
    strategy: Arc<FakeDump>,
    storage: Option<Arc<FakeStorage>>,
    store: Arc<dyn MetadataStore>,
    settings: EngineSettings,
) -> Harness {
    let mut registry = StrategyRegistry::new();
    registry.register(strategy);
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = BackupEngine::new(
        EngineDeps {
            store: store.clone(),
            registry,
            storage: storage.map(|s| s as Arc<dyn ObjectStorage>),
            notifier: notifier.clone(),
        },
        settings,
    );
    Harness { engine, store, notifier }
}

fn postgres_request(database: &str) -> BackupRequest {
    BackupRequest::new(
        "postgre",
        Connection {
            host: Some("orders-db".into()),
            port: Some(5432),
            username: Some("backup".into()),
            password: Some("s3cret".into()),
            database: Some(database.into()),
            ..Default::default()
        },
    )
    .with_webhook(WEBHOOK)
}

async fn job(store: &Arc<dyn MetadataStore>, id: &str) -> BackupJob {
    store.get_job(id).await.unwrap().expect("job record exists")
}

#[tokio::test]
async fn successful_backup_is_tracked_uploaded_and_reported_once() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let dump = Arc::new(
        FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"-- dump --")).gated(gate.clone()),
    );
    let storage = Arc::new(FakeStorage::default());
    let h = harness(
        dump.clone(),
        Some(storage.clone()),
        Arc::new(MemoryStore::new()),
        EngineSettings::default(),
    );

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    assert!(!id.is_empty());

    dump.started.notified().await;
    assert_eq!(job(&h.store, &id).await.status, JobStatus::Generating);
    gate.add_permits(1);
    h.engine.drain().await;

    let finished = job(&h.store, &id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.file_size, 10);
    assert_eq!(finished.error, None);
    let object_key = finished.object_key.clone().unwrap();
    assert!(object_key.starts_with("backups/postgre/orders_"));

    let uploads = storage.uploads.lock().await.clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].host, "orders-db");
    assert_eq!(uploads[0].file_size, 10);

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    let (url, result) = &sent[0];
    assert_eq!(url, WEBHOOK);
    assert!(result.success);
    assert_eq!(result.job_id, id);
    assert_eq!(result.object_key.as_deref(), Some(object_key.as_str()));
    assert_eq!(result.metadata["storage"], "s3");
    assert_eq!(result.metadata["database_type"], "postgre");
    assert_eq!(result.metadata["file_size"], "10");
    assert!(!serde_json::to_string(result).unwrap().contains("s3cret"));
}

#[tokio::test]
async fn job_record_never_holds_the_password() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"x")));
    let h = harness(dump, None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let stored = serde_json::to_string(&job(&h.store, &id).await).unwrap();
    assert!(!stored.contains("s3cret"));
}

#[tokio::test]
async fn invalid_request_is_rejected_without_a_job() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"x")));
    let h = harness(dump.clone(), None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let err = h
        .engine
        .submit(BackupRequest::new("postgre", Connection::default()))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Invalid backup request"));

    h.engine.drain().await;
    let page = h.store.list_jobs(&JobQuery::default()).await.unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(dump.runs.load(Ordering::SeqCst), 0);
    assert!(h.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn unsupported_type_fails_the_job() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"x")));
    let h = harness(dump.clone(), None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let mut request = postgres_request("orders");
    request.db_type = "oracle".into();
    let id = h.engine.submit(request).await.unwrap();
    h.engine.drain().await;

    let failed = job(&h.store, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("unsupported backup type: oracle"));
    assert_eq!(dump.runs.load(Ordering::SeqCst), 0);

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].1.success);
    assert_eq!(sent[0].1.error.as_deref(), Some("unsupported backup type: oracle"));
}

#[tokio::test]
async fn failed_dump_marks_the_job_failed() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Fail));
    let storage = Arc::new(FakeStorage::default());
    let h = harness(dump, Some(storage.clone()), Arc::new(MemoryStore::new()), EngineSettings::default());

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let failed = job(&h.store, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("dump produced nothing"));
    assert!(storage.uploads.lock().await.is_empty());

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].1.success);
}

#[tokio::test]
async fn upload_failure_still_completes_with_local_artifact() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"dump")));
    let storage = Arc::new(FakeStorage {
        fail: true,
        ..Default::default()
    });
    let h = harness(dump, Some(storage), Arc::new(MemoryStore::new()), EngineSettings::default());

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let done = job(&h.store, &id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.object_key, None);
    assert!(done.error.unwrap().contains("bucket unreachable"));
    assert!(Path::new(done.file_path.as_deref().unwrap()).exists());

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    let result = &sent[0].1;
    assert!(result.success);
    assert!(result.metadata["upload_error"].contains("bucket unreachable"));
    assert!(!result.metadata.contains_key("storage"));
}

#[tokio::test]
async fn without_storage_the_artifact_stays_local() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"dump")));
    let h = harness(dump, None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let done = job(&h.store, &id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.object_key, None);
    assert_eq!(done.error, None);
    assert!(done.file_path.unwrap().starts_with(&dir.path().display().to_string()));
}

#[tokio::test]
async fn no_webhook_means_no_notification() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"dump")));
    let h = harness(dump, None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let mut request = postgres_request("orders");
    request.webhook_url = None;
    h.engine.submit(request).await.unwrap();
    h.engine.drain().await;

    assert!(h.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn untracked_job_still_runs_when_metadata_is_down() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"dump")));
    let h = harness(
        dump.clone(),
        None,
        Arc::new(UnavailableJobStore::default()),
        EngineSettings::default(),
    );

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    assert_eq!(id, "");
    h.engine.drain().await;

    assert_eq!(dump.runs.load(Ordering::SeqCst), 1);
    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.success);
    assert_eq!(sent[0].1.job_id, "");
}

#[tokio::test]
async fn panicking_dump_fails_the_job() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Panic));
    let h = harness(dump, None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let failed = job(&h.store, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("backup worker panicked"));

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].1.success);
}

#[tokio::test]
async fn notifier_crash_after_delivery_is_not_reported_twice() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"x")));
    let h = harness(dump, None, Arc::new(MemoryStore::new()), EngineSettings::default());
    h.notifier.crash_after_send.store(true, Ordering::SeqCst);

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.success);
    assert_eq!(job(&h.store, &id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn dump_exceeding_the_timeout_fails() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Hang));
    let h = harness(
        dump,
        None,
        Arc::new(MemoryStore::new()),
        EngineSettings {
            job_timeout: Duration::from_millis(50),
            max_concurrent_jobs: 1,
        },
    );

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    h.engine.drain().await;

    let failed = job(&h.store, &id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().starts_with("backup timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_holds_extra_jobs_in_pending() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let dump = Arc::new(
        FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"dump")).gated(gate.clone()),
    );
    let h = harness(
        dump.clone(),
        None,
        Arc::new(MemoryStore::new()),
        EngineSettings {
            job_timeout: Duration::from_secs(30),
            max_concurrent_jobs: 2,
        },
    );

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.engine.submit(postgres_request(&format!("db{i}"))).await.unwrap());
    }

    // Let the two permitted dumps start, then check nobody else got in.
    for _ in 0..50 {
        if dump.running.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dump.running.load(Ordering::SeqCst), 2);

    let pending = h
        .store
        .list_jobs(&JobQuery {
            statuses: vec![JobStatus::Pending],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.total, 3);

    gate.add_permits(5);
    h.engine.drain().await;

    assert_eq!(dump.peak.load(Ordering::SeqCst), 2);
    for id in &ids {
        assert_eq!(job(&h.store, id).await.status, JobStatus::Completed);
    }
    assert_eq!(h.notifier.sent().await.len(), 5);
}

#[tokio::test]
async fn shutdown_cancels_running_dumps() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Hang));
    let h = harness(dump.clone(), None, Arc::new(MemoryStore::new()), EngineSettings::default());

    let id = h.engine.submit(postgres_request("orders")).await.unwrap();
    dump.started.notified().await;
    h.engine.shutdown().await;

    let cancelled = job(&h.store, &id).await;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(h.engine.active_jobs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_config_runs_through_the_engine() {
    let dir = TempDir::new().unwrap();
    let dump = Arc::new(FakeDump::new(DatabaseType::Postgres, dir.path(), Outcome::Write(b"dump")));
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
    let h = harness(dump, None, store.clone(), EngineSettings::default());

    let mut config = DatabaseConfig::new(
        "orders",
        "postgres",
        Connection {
            host: Some("orders-db".into()),
            database: Some("orders".into()),
            ..Default::default()
        },
    );
    config.cron_expression = "* * * * * *".into();
    config.is_active = true;
    store.create_config(&config).await.unwrap();

    let scheduler = BackupScheduler::new(store.clone(), Arc::new(h.engine.clone()))
        .await
        .unwrap();
    assert_eq!(scheduler.start().await.unwrap(), 1);

    let mut completed = 0;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        completed = store
            .list_jobs(&JobQuery {
                statuses: vec![JobStatus::Completed],
                ..Default::default()
            })
            .await
            .unwrap()
            .total;
        if completed > 0 {
            break;
        }
    }
    scheduler.stop().await.unwrap();
    h.engine.shutdown().await;

    assert!(completed > 0, "scheduled backup never completed");
    let page = store.list_jobs(&JobQuery::default()).await.unwrap();
    assert!(page.items.iter().all(|j| j.host == "orders-db" && j.db_type == "postgre"));
    let by_alias = store
        .list_jobs(&JobQuery {
            types: vec!["postgres".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_alias.total, page.total);
}
