use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::errors::NotificationError;
use crate::model::BackupResult;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivers the result of a finished job to a caller-supplied endpoint.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, result: &BackupResult) -> Result<(), NotificationError>;
}

/// Single JSON POST per notification. The response body is ignored.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self::with_client(
            reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        )
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, url: &str, result: &BackupResult) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(url)
            .json(result)
            .send()
            .await
            .map_err(|source| NotificationError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        debug!(url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
