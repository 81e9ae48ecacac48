//! Outbound notifications for completed operations
//!
//! One call per finished backup or restore, success or failure. Delivery is
//! best effort: [`dispatch`] logs and swallows every error.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors raised by a notifier
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The request failed or was refused
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Outcome being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Operation succeeded
    Success,
    /// Operation failed
    Failure,
}

/// Payload sent to the sink
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Outcome
    pub status: NotificationStatus,
    /// Human-readable summary
    pub message: String,
    /// Reporting service
    pub service: String,
    /// Artifact size, for successful backups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Wall-clock duration
    pub duration_secs: f64,
}

/// Outcome notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink used when no endpoint is configured
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!(status = ?notification.status, "No notification endpoint configured");
        Ok(())
    }
}

/// POSTs the notification as JSON to a webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Client with a ten second timeout
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!("endpoint returned {}", response.status())));
        }
        Ok(())
    }
}

/// Collects notifications in memory (for testing/development)
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl RecordingNotifier {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}

/// Fire-and-forget delivery: failures are logged, never propagated
pub async fn dispatch(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.notify(&notification).await {
        warn!(error = %e, status = ?notification.status, "Failed to deliver notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _notification: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("connection refused".to_string()))
        }
    }

    fn sample() -> Notification {
        Notification {
            status: NotificationStatus::Success,
            message: "Full backup completed".to_string(),
            service: "app".to_string(),
            size_bytes: Some(1024),
            duration_secs: 1.5,
        }
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        dispatch(&FailingNotifier, sample()).await;
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["service"], "app");
        assert_eq!(json["message"], "Full backup completed");
    }
}
