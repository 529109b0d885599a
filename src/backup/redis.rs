// dbbackup/src/backup/redis.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::DumpStrategy;
use super::db_dump::{DumpTool, run_tool};
use crate::errors::ExecutionError;
use crate::model::{BackupRequest, DatabaseType};

/// Remote RDB snapshot via `redis-cli --rdb`.
///
/// redis-cli can exit 0 without writing anything useful, so the artifact is
/// checked after the fact and an empty file is deleted and reported as a failure.
#[derive(Debug, Clone)]
pub struct RedisDump {
    tool: DumpTool,
}

impl RedisDump {
    pub fn new(tool: DumpTool) -> Self {
        Self { tool }
    }

    pub fn with_defaults(output_root: &Path) -> Self {
        Self::new(DumpTool::resolve("redis-cli", output_root))
    }
}

async fn verify_snapshot(file: &Path) -> Result<(), ExecutionError> {
    let metadata = tokio::fs::metadata(file)
        .await
        .map_err(|source| ExecutionError::Verify {
            path: file.display().to_string(),
            source,
        })?;
    if metadata.len() == 0 {
        if let Err(e) = tokio::fs::remove_file(file).await {
            warn!(file = %file.display(), error = %e, "Failed to remove empty redis snapshot");
        }
        return Err(ExecutionError::EmptyOutput(file.display().to_string()));
    }
    Ok(())
}

#[async_trait]
impl DumpStrategy for RedisDump {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Redis
    }

    async fn run(&self, request: &BackupRequest) -> Result<PathBuf, ExecutionError> {
        let resolved = request
            .connection
            .resolve(DatabaseType::Redis)
            .map_err(|e| ExecutionError::Connection {
                tool: self.tool.name(),
                reason: e.0,
            })?;
        let file = self
            .tool
            .artifact_path(
                DatabaseType::Redis,
                &resolved.host,
                resolved.database.as_deref(),
                "rdb",
            )
            .await?;

        let mut cmd = self.tool.command();
        cmd.arg("-h")
            .arg(&resolved.host)
            .arg("-p")
            .arg(resolved.port.to_string());
        if let Some(user) = &resolved.username {
            cmd.arg("--user").arg(user);
        }
        if let Some(password) = &resolved.password {
            cmd.env("REDISCLI_AUTH", password);
        }
        cmd.arg("--rdb").arg(&file);

        info!(host = %resolved.host, file = %file.display(), "Running redis-cli --rdb");
        run_tool(&self.tool.name(), &mut cmd).await?;
        verify_snapshot(&file).await?;
        Ok(file)
    }
}
