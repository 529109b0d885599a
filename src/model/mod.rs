// dbbackup/src/model/mod.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

use crate::errors::{UnsupportedTypeError, ValidationError};

/// Database engines we know how to dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "postgre")]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mongo")]
    Mongo,
    #[serde(rename = "redis")]
    Redis,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 4] = [
        DatabaseType::Postgres,
        DatabaseType::MySql,
        DatabaseType::Mongo,
        DatabaseType::Redis,
    ];

    /// Canonical tag, also used as the artifact directory and object key segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgre",
            DatabaseType::MySql => "mysql",
            DatabaseType::Mongo => "mongo",
            DatabaseType::Redis => "redis",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::Postgres => 5432,
            DatabaseType::MySql => 3306,
            DatabaseType::Mongo => 27017,
            DatabaseType::Redis => 6379,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = UnsupportedTypeError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "postgre" | "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            "mysql" | "mariadb" => Ok(DatabaseType::MySql),
            "mongo" | "mongodb" => Ok(DatabaseType::Mongo),
            "redis" => Ok(DatabaseType::Redis),
            _ => Err(UnsupportedTypeError(tag.to_string())),
        }
    }
}

/// Canonical tag for a known type, so aliases are filed together. Unknown tags
/// are kept as given (trimmed).
pub fn canonical_tag(raw: &str) -> String {
    let raw = raw.trim();
    raw.parse::<DatabaseType>()
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Lifecycle of a single backup job.
///
/// Transitions only move forward: `Pending -> Generating -> Completed | Failed`,
/// with `Pending -> Failed` allowed when the strategy cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Generating => "generating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Generating)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Generating, JobStatus::Completed)
                | (JobStatus::Generating, JobStatus::Failed)
        )
    }

    /// States a job must be in to move to `next`.
    pub fn predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[],
            JobStatus::Generating => &[JobStatus::Pending],
            JobStatus::Completed => &[JobStatus::Generating],
            JobStatus::Failed => &[JobStatus::Pending, JobStatus::Generating],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "generating" => Ok(JobStatus::Generating),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ValidationError(format!("unknown job status '{}'", other))),
        }
    }
}

/// How to reach a database: either discrete host/port fields or a single URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_source: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Connection {
    pub fn host(&self) -> Option<&str> {
        non_empty(&self.host)
    }

    pub fn username(&self) -> Option<&str> {
        non_empty(&self.username)
    }

    pub fn password(&self) -> Option<&str> {
        // Passwords are not trimmed.
        self.password.as_deref().filter(|s| !s.is_empty())
    }

    pub fn database(&self) -> Option<&str> {
        non_empty(&self.database)
    }

    pub fn connection_uri(&self) -> Option<&str> {
        non_empty(&self.connection_uri)
    }

    pub fn auth_source(&self) -> Option<&str> {
        non_empty(&self.auth_source)
    }

    /// Discrete connection fields, falling back to whatever the URI carries
    /// for the ones that were not given explicitly.
    pub fn resolve(&self, db_type: DatabaseType) -> Result<ResolvedConnection, ValidationError> {
        let parsed = match self.connection_uri() {
            Some(uri) => Some(
                Url::parse(uri)
                    .map_err(|e| ValidationError(format!("invalid connection URI: {}", e)))?,
            ),
            None => None,
        };
        let from_uri = |f: fn(&Url) -> Option<String>| parsed.as_ref().and_then(f);

        let host = self
            .host()
            .map(str::to_string)
            .or_else(|| from_uri(|u| u.host_str().map(str::to_string)))
            .ok_or_else(|| ValidationError("host or connection URI is required".into()))?;
        let port = self
            .port
            .or_else(|| parsed.as_ref().and_then(Url::port))
            .unwrap_or_else(|| db_type.default_port());
        let username = self
            .username()
            .map(str::to_string)
            .or_else(|| from_uri(|u| Some(u.username().to_string()).filter(|s| !s.is_empty())));
        let password = self
            .password()
            .map(str::to_string)
            .or_else(|| from_uri(|u| u.password().map(str::to_string)));
        let database = self.database().map(str::to_string).or_else(|| {
            from_uri(|u| {
                let path = u.path().trim_start_matches('/');
                (!path.is_empty()).then(|| path.to_string())
            })
        });

        Ok(ResolvedConnection {
            host,
            port,
            username,
            password,
            database,
        })
    }
}

/// Connection fields after URI decomposition and default ports are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

/// A request to back up one database, either from the API layer or a cron firing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    /// Raw type tag. Kept as a string so unknown tags fail on the job, not at parse time.
    #[serde(rename = "type")]
    pub db_type: String,
    #[serde(flatten)]
    pub connection: Connection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl BackupRequest {
    pub fn new(db_type: impl Into<String>, connection: Connection) -> Self {
        Self {
            db_type: db_type.into(),
            connection,
            webhook_url: None,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn webhook_url(&self) -> Option<&str> {
        non_empty(&self.webhook_url)
    }

    /// Host used for artifact naming and job records. Falls back to the URI host.
    pub fn display_host(&self) -> String {
        if let Some(host) = self.connection.host() {
            return host.to_string();
        }
        self.connection
            .connection_uri()
            .and_then(|uri| Url::parse(uri).ok())
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Database name, falling back to the URI path.
    pub fn display_database(&self) -> String {
        if let Some(db) = self.connection.database() {
            return db.to_string();
        }
        self.connection
            .connection_uri()
            .and_then(|uri| Url::parse(uri).ok())
            .map(|u| u.path().trim_start_matches('/').to_string())
            .unwrap_or_default()
    }

    /// Shape checks done synchronously before any job is created.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.db_type.trim().is_empty() {
            return Err(ValidationError("type is required".into()));
        }
        if self.connection.host().is_none() && self.connection.connection_uri().is_none() {
            return Err(ValidationError(
                "type and (host or connectionUri) are required".into(),
            ));
        }
        if let Some(uri) = self.connection.connection_uri() {
            Url::parse(uri).map_err(|e| ValidationError(format!("invalid connectionUri: {}", e)))?;
        }
        if let Some(hook) = self.webhook_url() {
            let parsed =
                Url::parse(hook).map_err(|e| ValidationError(format!("invalid webhookUrl: {}", e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ValidationError(format!(
                    "webhookUrl must use http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }
}

/// One tracked backup attempt. Never carries secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub id: String,
    #[serde(rename = "type")]
    pub db_type: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: Option<String>,
    pub file_path: Option<String>,
    pub object_key: Option<String>,
    pub file_size: u64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupJob {
    pub fn pending(request: &BackupRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            db_type: canonical_tag(&request.db_type),
            host: request.display_host(),
            port: request.connection.port,
            database: request.display_database(),
            username: request.connection.username().map(str::to_string),
            file_path: None,
            object_key: None,
            file_size: 0,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A saved connection profile, optionally bound to a cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: String,
    #[serde(flatten)]
    pub connection: Connection,
    #[serde(default)]
    pub cron_expression: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, db_type: impl Into<String>, connection: Connection) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            db_type: db_type.into(),
            connection,
            cron_expression: String::new(),
            is_active: false,
            webhook_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_schedulable(&self) -> bool {
        self.is_active && !self.cron_expression.trim().is_empty()
    }

    /// Request captured at schedule time; later edits need a fresh `add_job`.
    pub fn to_backup_request(&self) -> BackupRequest {
        BackupRequest {
            db_type: self.db_type.clone(),
            connection: self.connection.clone(),
            webhook_url: self.webhook_url.clone(),
        }
    }
}

/// Payload delivered to the webhook once per submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: String,
}

impl BackupResult {
    pub fn failure(job_id: &str, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: false,
            error: Some(error.into()),
            file_path: String::new(),
            object_key: None,
            metadata: BTreeMap::new(),
            timestamp: started_at.to_rfc3339(),
        }
    }
}
