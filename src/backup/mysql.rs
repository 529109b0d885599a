// dbbackup/src/backup/mysql.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::DumpStrategy;
use super::db_dump::{DumpTool, run_tool_to_file};
use crate::errors::ExecutionError;
use crate::model::{BackupRequest, DatabaseType};

/// `mysqldump` with stdout captured into the artifact and the password in `MYSQL_PWD`.
#[derive(Debug, Clone)]
pub struct MySqlDump {
    tool: DumpTool,
}

impl MySqlDump {
    pub fn new(tool: DumpTool) -> Self {
        Self { tool }
    }

    pub fn with_defaults(output_root: &Path) -> Self {
        Self::new(DumpTool::resolve("mysqldump", output_root))
    }
}

#[async_trait]
impl DumpStrategy for MySqlDump {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    async fn run(&self, request: &BackupRequest) -> Result<PathBuf, ExecutionError> {
        let resolved = request
            .connection
            .resolve(DatabaseType::MySql)
            .map_err(|e| ExecutionError::Connection {
                tool: self.tool.name(),
                reason: e.0,
            })?;
        let file = self
            .tool
            .artifact_path(
                DatabaseType::MySql,
                &resolved.host,
                resolved.database.as_deref(),
                "sql",
            )
            .await?;

        let mut cmd = self.tool.command();
        cmd.arg("-h")
            .arg(&resolved.host)
            .arg("-P")
            .arg(resolved.port.to_string());
        if let Some(user) = &resolved.username {
            cmd.arg("-u").arg(user);
        }
        match &resolved.database {
            Some(db) => cmd.arg(db),
            None => cmd.arg("--all-databases"),
        };
        if let Some(password) = &resolved.password {
            cmd.env("MYSQL_PWD", password);
        }

        info!(host = %resolved.host, file = %file.display(), "Running mysqldump");
        run_tool_to_file(&self.tool.name(), &mut cmd, &file).await?;
        Ok(file)
    }
}
