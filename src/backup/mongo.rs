// dbbackup/src/backup/mongo.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::DumpStrategy;
use super::db_dump::{DumpTool, run_tool};
use crate::errors::ExecutionError;
use crate::model::{BackupRequest, DatabaseType};

/// `mongodump` into a single gzip archive rather than a directory tree.
#[derive(Debug, Clone)]
pub struct MongoDump {
    tool: DumpTool,
}

impl MongoDump {
    pub fn new(tool: DumpTool) -> Self {
        Self { tool }
    }

    pub fn with_defaults(output_root: &Path) -> Self {
        Self::new(DumpTool::resolve("mongodump", output_root))
    }

    fn connection_args(&self, request: &BackupRequest) -> Result<Vec<String>, ExecutionError> {
        let conn = &request.connection;
        if let Some(uri) = conn.connection_uri() {
            return Ok(vec![format!("--uri={}", uri)]);
        }

        let resolved = conn
            .resolve(DatabaseType::Mongo)
            .map_err(|e| ExecutionError::Connection {
                tool: self.tool.name(),
                reason: e.0,
            })?;
        let mut args = vec![
            format!("--host={}", resolved.host),
            format!("--port={}", resolved.port),
        ];
        if let Some(user) = &resolved.username {
            args.push(format!("--username={}", user));
        }
        if let Some(password) = &resolved.password {
            args.push(format!("--password={}", password));
        }
        if let Some(db) = &resolved.database {
            args.push(format!("--db={}", db));
        }
        if let Some(auth_source) = conn.auth_source() {
            args.push(format!("--authenticationDatabase={}", auth_source));
        }
        Ok(args)
    }
}

#[async_trait]
impl DumpStrategy for MongoDump {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mongo
    }

    async fn run(&self, request: &BackupRequest) -> Result<PathBuf, ExecutionError> {
        let args = self.connection_args(request)?;
        let host = request.display_host();
        let database = request.display_database();
        let file = self
            .tool
            .artifact_path(DatabaseType::Mongo, &host, Some(&database), "gz")
            .await?;

        let mut cmd = self.tool.command();
        cmd.args(&args)
            .arg(format!("--archive={}", file.display()))
            .arg("--gzip");

        info!(host = %host, file = %file.display(), "Running mongodump");
        run_tool(&self.tool.name(), &mut cmd).await?;
        Ok(file)
    }
}
