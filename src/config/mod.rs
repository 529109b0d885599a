// dbbackup/src/config/mod.rs
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::utils::retention::retention_from_days;

pub const DEFAULT_OUTPUT_DIR: &str = "backups";
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Credentials for an S3-compatible bucket (R2, Spaces, MinIO, AWS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres URL for job and config metadata. `None` keeps metadata in memory.
    pub metadata_database_url: Option<String>,
    pub output_dir: PathBuf,
    pub job_timeout: Duration,
    pub max_concurrent_jobs: usize,
    /// Age after which local artifacts are deleted. `None` keeps them forever.
    pub retention: Option<Duration>,
    pub storage: Option<StorageConfig>,
}

impl AppConfig {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine; real deployments set the variables directly.
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let job_timeout = match get("BACKUP_JOB_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("BACKUP_JOB_TIMEOUT_SECS must be a number of seconds, got '{}'", raw))?,
            ),
            None => DEFAULT_JOB_TIMEOUT,
        };
        if job_timeout.is_zero() {
            bail!("BACKUP_JOB_TIMEOUT_SECS must be greater than zero");
        }

        let max_concurrent_jobs = match get("BACKUP_MAX_CONCURRENT_JOBS") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("BACKUP_MAX_CONCURRENT_JOBS must be a positive integer, got '{}'", raw))?,
            None => DEFAULT_MAX_CONCURRENT_JOBS,
        };
        if max_concurrent_jobs == 0 {
            bail!("BACKUP_MAX_CONCURRENT_JOBS must be at least 1");
        }

        let retention_days = match get("BACKUP_RETENTION_DAYS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("BACKUP_RETENTION_DAYS must be a whole number of days, got '{}'", raw))?,
            None => DEFAULT_RETENTION_DAYS,
        };
        // Zero turns retention cleanup off.
        let retention = match retention_days {
            0 => None,
            days => Some(
                retention_from_days(days)
                    .with_context(|| format!("BACKUP_RETENTION_DAYS is too large: {}", days))?,
            ),
        };

        Ok(AppConfig {
            metadata_database_url: get("METADATA_DATABASE_URL"),
            output_dir: get("BACKUP_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            job_timeout,
            max_concurrent_jobs,
            retention,
            storage: storage_from_lookup(&get),
        })
    }
}

/// Uploads are enabled only when every required S3 variable is present.
fn storage_from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Option<StorageConfig> {
    let endpoint = get("S3_ENDPOINT");
    let key_id = get("S3_ACCESS_KEY_ID");
    let secret = get("S3_SECRET_ACCESS_KEY");
    let bucket = get("S3_BUCKET_NAME");

    if let (Some(endpoint_url), Some(access_key_id), Some(secret_access_key), Some(bucket_name)) =
        (endpoint.clone(), key_id.clone(), secret.clone(), bucket.clone())
    {
        return Some(StorageConfig {
            endpoint_url,
            region: get("S3_REGION").unwrap_or_else(|| "auto".to_string()),
            access_key_id,
            secret_access_key,
            bucket_name,
        });
    }

    if endpoint.is_some() || key_id.is_some() || secret.is_some() || bucket.is_some() {
        // Only warn if some S3 fields were provided but the set is incomplete.
        warn!(
            "S3 configuration is incomplete (S3_ENDPOINT, S3_ACCESS_KEY_ID, S3_SECRET_ACCESS_KEY, \
             S3_BUCKET_NAME are all required). Uploads are disabled."
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_any_variables() -> Result<()> {
        let config = config_from(&[])?;
        assert_eq!(config.metadata_database_url, None);
        assert_eq!(config.output_dir, PathBuf::from("backups"));
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.retention, Some(Duration::from_secs(7 * 24 * 3600)));
        assert_eq!(config.storage, None);
        Ok(())
    }

    #[test]
    fn reads_engine_settings() -> Result<()> {
        let config = config_from(&[
            ("METADATA_DATABASE_URL", "postgres://meta@localhost/backups"),
            ("BACKUP_OUTPUT_DIR", "/var/lib/dbbackup"),
            ("BACKUP_JOB_TIMEOUT_SECS", "120"),
            ("BACKUP_MAX_CONCURRENT_JOBS", "2"),
            ("BACKUP_RETENTION_DAYS", "7"),
        ])?;
        assert_eq!(
            config.metadata_database_url.as_deref(),
            Some("postgres://meta@localhost/backups")
        );
        assert_eq!(config.output_dir, PathBuf::from("/var/lib/dbbackup"));
        assert_eq!(config.job_timeout, Duration::from_secs(120));
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.retention, Some(Duration::from_secs(7 * 24 * 3600)));
        Ok(())
    }

    #[test]
    fn storage_requires_the_full_set() -> Result<()> {
        let partial = config_from(&[("S3_ENDPOINT", "https://r2.example.com"), ("S3_BUCKET_NAME", "b")])?;
        assert_eq!(partial.storage, None);

        let full = config_from(&[
            ("S3_ENDPOINT", "https://r2.example.com"),
            ("S3_ACCESS_KEY_ID", "key"),
            ("S3_SECRET_ACCESS_KEY", "secret"),
            ("S3_BUCKET_NAME", "db-backups"),
        ])?;
        let storage = full.storage.unwrap();
        assert_eq!(storage.region, "auto");
        assert_eq!(storage.bucket_name, "db-backups");
        Ok(())
    }

    #[test]
    fn rejects_invalid_numbers() {
        assert!(config_from(&[("BACKUP_MAX_CONCURRENT_JOBS", "0")]).is_err());
        assert!(config_from(&[("BACKUP_MAX_CONCURRENT_JOBS", "many")]).is_err());
        assert!(config_from(&[("BACKUP_JOB_TIMEOUT_SECS", "0")]).is_err());
        assert!(config_from(&[("BACKUP_RETENTION_DAYS", "-1")]).is_err());
    }

    #[test]
    fn retention_days_that_overflow_are_rejected() {
        let err = config_from(&[("BACKUP_RETENTION_DAYS", "213503982334602")]).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(config_from(&[("BACKUP_RETENTION_DAYS", u64::MAX.to_string().as_str())]).is_err());
    }

    #[test]
    fn zero_retention_days_disable_cleanup() -> Result<()> {
        let config = config_from(&[("BACKUP_RETENTION_DAYS", "0")])?;
        assert_eq!(config.retention, None);
        Ok(())
    }

    #[test]
    fn blank_values_count_as_unset() -> Result<()> {
        let config = config_from(&[("METADATA_DATABASE_URL", "   "), ("S3_ENDPOINT", "")])?;
        assert_eq!(config.metadata_database_url, None);
        assert_eq!(config.storage, None);
        Ok(())
    }
}
