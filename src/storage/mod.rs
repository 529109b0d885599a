pub(crate) mod s3_upload;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::UploadError;

pub use s3_upload::S3Storage;

/// Descriptive tags stored alongside an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub database_type: String,
    pub host: String,
    pub database: String,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
}

impl UploadMetadata {
    pub fn to_object_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("database-type".to_string(), self.database_type.clone()),
            ("host".to_string(), self.host.clone()),
            ("database".to_string(), self.database.clone()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
            ("file-size".to_string(), self.file_size.to_string()),
        ])
    }
}

/// `backups/{type}/{filename}`
pub fn object_key_for(database_type: &str, file_path: &Path) -> String {
    let filename = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("backups/{}/{}", database_type, filename)
}

/// Remote home for finished artifacts.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Uploads `file_path` and returns the object key it was stored under.
    async fn upload(&self, file_path: &Path, metadata: &UploadMetadata) -> Result<String, UploadError>;

    async fn delete(&self, object_key: &str) -> Result<(), UploadError>;

    async fn presigned_url(&self, object_key: &str, ttl: Duration) -> Result<String, UploadError>;
}
