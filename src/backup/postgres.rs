// dbbackup/src/backup/postgres.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;
use url::Url;

use super::DumpStrategy;
use super::db_dump::{DumpTool, run_tool};
use crate::errors::ExecutionError;
use crate::model::{BackupRequest, DatabaseType};

/// Plain-SQL dumps through `pg_dump`.
///
/// The password only ever travels through `PGPASSWORD` in the child environment;
/// a password embedded in a connection URI is stripped from the argument.
#[derive(Debug, Clone)]
pub struct PostgresDump {
    tool: DumpTool,
}

impl PostgresDump {
    pub fn new(tool: DumpTool) -> Self {
        Self { tool }
    }

    pub fn with_defaults(output_root: &Path) -> Self {
        Self::new(DumpTool::resolve("pg_dump", output_root))
    }

    fn build_command(
        &self,
        request: &BackupRequest,
        file: &Path,
    ) -> Result<Command, ExecutionError> {
        let conn = &request.connection;
        let mut cmd = self.tool.command();

        if let Some(uri) = conn.connection_uri() {
            let mut url = Url::parse(uri).map_err(|e| self.invalid(e.to_string()))?;
            let password = conn
                .password()
                .map(str::to_string)
                .or_else(|| url.password().map(str::to_string));
            // set_password only fails for cannot-be-a-base URLs, which pg_dump rejects anyway.
            let _ = url.set_password(None);
            if let Some(password) = password {
                cmd.env("PGPASSWORD", password);
            }
            cmd.arg("-f").arg(file).arg(url.as_str());
            return Ok(cmd);
        }

        let resolved = conn
            .resolve(DatabaseType::Postgres)
            .map_err(|e| self.invalid(e.0))?;
        cmd.arg("-h")
            .arg(&resolved.host)
            .arg("-p")
            .arg(resolved.port.to_string());
        if let Some(user) = &resolved.username {
            cmd.arg("-U").arg(user);
        }
        cmd.arg("-f").arg(file);
        if let Some(db) = &resolved.database {
            cmd.arg(db);
        }
        if let Some(password) = &resolved.password {
            cmd.env("PGPASSWORD", password);
        }
        Ok(cmd)
    }

    fn invalid(&self, reason: String) -> ExecutionError {
        ExecutionError::Connection {
            tool: self.tool.name(),
            reason,
        }
    }
}

#[async_trait]
impl DumpStrategy for PostgresDump {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn run(&self, request: &BackupRequest) -> Result<PathBuf, ExecutionError> {
        let host = request.display_host();
        let database = request.display_database();
        let file = self
            .tool
            .artifact_path(DatabaseType::Postgres, &host, Some(&database), "sql")
            .await?;

        let mut cmd = self.build_command(request, &file)?;
        info!(host = %host, database = %database, file = %file.display(), "Running pg_dump");
        run_tool(&self.tool.name(), &mut cmd).await?;
        Ok(file)
    }
}
