// dbbackup/src/storage/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::{ObjectStorage, UploadMetadata, object_key_for};
use crate::config::StorageConfig;
use crate::errors::UploadError;

/// S3-compatible object storage (R2, Spaces, MinIO, AWS).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket_name: String,
}

impl S3Storage {
    /// Builds the client once; every upload reuses it.
    pub async fn connect(config: &StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket_name: config.bucket_name.clone(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(&self, file_path: &Path, metadata: &UploadMetadata) -> Result<String, UploadError> {
        let key = object_key_for(&metadata.database_type, file_path);
        info!(
            file = %file_path.display(),
            bucket = %self.bucket_name,
            key = %key,
            "Uploading backup to object storage"
        );

        let body = ByteStream::from_path(file_path)
            .await
            .map_err(|e| UploadError::Read {
                path: file_path.display().to_string(),
                source: std::io::Error::other(e),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .body(body)
            .set_metadata(Some(metadata.to_object_metadata()))
            .send()
            .await
            .map_err(|e| UploadError::Put {
                key: key.clone(),
                message: DisplayErrorContext(e).to_string(),
            })?;

        info!(bucket = %self.bucket_name, key = %key, "Upload finished");
        Ok(key)
    }

    async fn delete(&self, object_key: &str) -> Result<(), UploadError> {
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(object_key)
            .send()
            .await
            .map_err(|e| UploadError::Delete {
                key: object_key.to_string(),
                message: DisplayErrorContext(e).to_string(),
            })?;
        Ok(())
    }

    async fn presigned_url(&self, object_key: &str, ttl: Duration) -> Result<String, UploadError> {
        let presign_err = |message: String| UploadError::Presign {
            key: object_key.to_string(),
            message,
        };
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| presign_err(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(object_key)
            .presigned(presigning)
            .await
            .map_err(|e| presign_err(DisplayErrorContext(e).to_string()))?;
        Ok(request.uri().to_string())
    }
}
