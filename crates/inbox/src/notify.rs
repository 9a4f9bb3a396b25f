//! New-mail notifications over a publish channel

use anyhow::{Context, Result};
use chrono::Utc;
use redis::Commands;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::InboxConfig;
use crate::models::{InboxAddress, Message, canonical_timestamp};

/// Payload published on `email:<address>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub email: String,
    /// RFC 3339, UTC, millisecond precision
    pub timestamp: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
}

impl Notification {
    pub fn new(email: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            timestamp: canonical_timestamp(&Utc::now()),
            message: message.into(),
            email_id: None,
        }
    }

    /// Announcement for a freshly ingested message
    pub fn new_mail(message: &Message) -> Self {
        Self {
            email_id: Some(message.id.to_string()),
            ..Self::new(
                message.to_address.clone(),
                format!("New email from {}: {}", message.from.address, message.subject),
            )
        }
    }
}

/// Channel name for an address
pub fn channel(address: &InboxAddress) -> String {
    format!("email:{}", address)
}

/// Redis instance assumed by manual notifications when none is configured
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, address: &InboxAddress, notification: &Notification) -> Result<()>;

    /// Whether published notifications reach a real channel
    fn is_configured(&self) -> bool {
        true
    }
}

/// Publish, logging instead of failing. Returns whether it was delivered.
pub fn publish_best_effort(
    publisher: &dyn NotificationPublisher,
    address: &InboxAddress,
    notification: &Notification,
) -> bool {
    match publisher.publish(address, notification) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("[NOTIFY] Notification for {} failed: {:#}", address, e);
            false
        }
    }
}

/// Redis PUBLISH with bounded connect and write times
pub struct RedisPublisher {
    client: redis::Client,
    timeout: Duration,
}

impl RedisPublisher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        Ok(Self {
            client,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl NotificationPublisher for RedisPublisher {
    fn publish(&self, address: &InboxAddress, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_string(notification).context("Failed to encode notification")?;

        let mut con = self
            .client
            .get_connection_with_timeout(self.timeout)
            .context("Failed to connect to Redis")?;
        con.set_write_timeout(Some(self.timeout))
            .context("Failed to set Redis write timeout")?;
        con.set_read_timeout(Some(self.timeout))
            .context("Failed to set Redis read timeout")?;

        let receivers: i64 = con
            .publish(channel(address), payload)
            .context("Redis PUBLISH failed")?;
        log::debug!("[NOTIFY] Published to {} ({} receivers)", channel(address), receivers);
        Ok(())
    }
}

/// Publisher used when no channel is configured
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl NotificationPublisher for NoopPublisher {
    fn publish(&self, address: &InboxAddress, _notification: &Notification) -> Result<()> {
        log::debug!("[NOTIFY] No publisher configured, dropping notification for {}", address);
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Keeps published notifications in memory; for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(String, Notification)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// (channel, notification) pairs in publish order
    pub fn published(&self) -> Vec<(String, Notification)> {
        self.published.lock().unwrap().clone()
    }
}

impl NotificationPublisher for MemoryPublisher {
    fn publish(&self, address: &InboxAddress, notification: &Notification) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel(address), notification.clone()));
        Ok(())
    }
}

/// Redis publisher when a URL is configured, otherwise a no-op.
///
/// For the best-effort ingestion path.
pub fn publisher_from_config(config: &InboxConfig) -> Result<Arc<dyn NotificationPublisher>> {
    match &config.redis_url {
        Some(url) => Ok(Arc::new(RedisPublisher::new(url)?)),
        None => Ok(Arc::new(NoopPublisher)),
    }
}

/// Redis publisher for explicitly requested notifications, falling back to
/// [`DEFAULT_REDIS_URL`] so a missing setting surfaces as a delivery failure
pub fn manual_publisher_from_config(config: &InboxConfig) -> Result<Arc<dyn NotificationPublisher>> {
    let url = config.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL);
    Ok(Arc::new(RedisPublisher::new(url)?))
}
