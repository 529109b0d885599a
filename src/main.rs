//! Database Backup Service
//!
//! CLI entry point: long-running scheduler, one-shot backups and housekeeping.

// dbbackup/src/main.rs
use anyhow::{Context, Result, bail};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dbbackup::backup::StrategyRegistry;
use dbbackup::config::AppConfig;
use dbbackup::engine::{BackupEngine, EngineDeps, EngineSettings};
use dbbackup::model::{BackupRequest, DatabaseConfig, JobStatus};
use dbbackup::notify::WebhookNotifier;
use dbbackup::scheduler::BackupScheduler;
use dbbackup::storage::{ObjectStorage, S3Storage};
use dbbackup::store::{MemoryStore, MetadataStore, PgStore};
use dbbackup::utils::retention::cleanup_old_backups;

const RETENTION_SCHEDULE: &str = "0 30 3 * * *";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration from environment")?;

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|a| a.trim().to_string()).unwrap_or_else(|| "serve".to_string());

    match command.as_str() {
        "serve" => serve(&config).await.context("Backup service failed"),
        "backup" => {
            let path = required_path(&args, "backup <request.json>")?;
            run_once(&config, &path).await.context("Backup failed")
        }
        "register" => {
            let path = required_path(&args, "register <config.json>")?;
            register(&config, &path).await.context("Failed to register database config")
        }
        "cleanup" => cleanup(&config),
        other => {
            eprintln!("Usage: dbbackup [serve | backup <request.json> | register <config.json> | cleanup]");
            bail!("Unknown command '{}'", other);
        }
    }
}

fn required_path(args: &[String], usage: &str) -> Result<PathBuf> {
    match args.get(2) {
        Some(path) => Ok(PathBuf::from(path)),
        None => bail!("Missing file argument. Usage: dbbackup {}", usage),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn MetadataStore>> {
    match &config.metadata_database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("Failed to connect to metadata database")?;
            info!("Using PostgreSQL metadata store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("METADATA_DATABASE_URL is not set, job metadata will be kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn build_engine(config: &AppConfig, store: Arc<dyn MetadataStore>) -> BackupEngine {
    let storage: Option<Arc<dyn ObjectStorage>> = match &config.storage {
        Some(storage_config) => {
            let s3 = S3Storage::connect(storage_config).await;
            info!(bucket = %s3.bucket_name(), "S3 uploads enabled");
            Some(Arc::new(s3))
        }
        None => {
            info!("S3 is not configured, backups stay on local disk");
            None
        }
    };

    BackupEngine::new(
        EngineDeps {
            store,
            registry: StrategyRegistry::with_defaults(&config.output_dir),
            storage,
            notifier: Arc::new(WebhookNotifier::new()),
        },
        EngineSettings {
            job_timeout: config.job_timeout,
            max_concurrent_jobs: config.max_concurrent_jobs,
        },
    )
}

async fn serve(config: &AppConfig) -> Result<()> {
    let store = open_store(config).await?;
    let engine = build_engine(config, store.clone()).await;
    let scheduler = BackupScheduler::new(store, Arc::new(engine.clone()))
        .await
        .context("Failed to create scheduler")?;

    let scheduled = scheduler.start().await.context("Failed to start scheduler")?;
    info!(scheduled, "Backup service started");

    if let Some(max_age) = config.retention {
        let root = config.output_dir.clone();
        scheduler
            .add_maintenance("retention-cleanup", RETENTION_SCHEDULE, move || {
                let root = root.clone();
                async move {
                    let outcome =
                        tokio::task::spawn_blocking(move || cleanup_old_backups(&root, max_age)).await;
                    match outcome {
                        Ok(Ok(report)) => info!(removed = report.removed.len(), bytes = report.bytes_freed, "Retention cleanup finished"),
                        Ok(Err(e)) => warn!(error = %e, "Retention cleanup failed"),
                        Err(e) => warn!(error = %e, "Retention cleanup task failed"),
                    }
                }
            })
            .await
            .context("Failed to schedule retention cleanup")?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if let Err(e) = scheduler.stop().await {
        warn!(error = %e, "Scheduler did not stop cleanly");
    }
    engine.shutdown().await;
    Ok(())
}

async fn run_once(config: &AppConfig, path: &Path) -> Result<()> {
    let request: BackupRequest = read_json(path)?;
    let store = open_store(config).await?;
    let engine = build_engine(config, store.clone()).await;

    let job_id = engine.submit(request).await?;
    engine.drain().await;

    if job_id.is_empty() {
        println!("Backup finished, but its job record could not be saved.");
        return Ok(());
    }
    let job = store
        .get_job(&job_id)
        .await?
        .with_context(|| format!("Job {} disappeared from the metadata store", job_id))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    if job.status == JobStatus::Failed {
        bail!(
            "Backup job {} failed: {}",
            job_id,
            job.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn register(config: &AppConfig, path: &Path) -> Result<()> {
    let db_config: DatabaseConfig = read_json(path)?;
    db_config.to_backup_request().validate()?;
    if config.metadata_database_url.is_none() {
        bail!("METADATA_DATABASE_URL must be set to register a database config");
    }
    let store = open_store(config).await?;
    store.create_config(&db_config).await?;
    println!("Registered config '{}' ({})", db_config.name, db_config.id);
    Ok(())
}

fn cleanup(config: &AppConfig) -> Result<()> {
    let Some(max_age) = config.retention else {
        bail!("Retention cleanup is disabled (BACKUP_RETENTION_DAYS=0)");
    };
    let report = cleanup_old_backups(&config.output_dir, max_age)
        .with_context(|| format!("Failed to clean {}", config.output_dir.display()))?;
    println!(
        "Removed {} file(s), freed {} bytes from {}",
        report.removed.len(),
        report.bytes_freed,
        config.output_dir.display()
    );
    Ok(())
}
