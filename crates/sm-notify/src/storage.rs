use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sm_common::Notification;

/// Read side of the notification table used by the distribution core
#[async_trait]
pub trait NotificationStorage: Send + Sync {
    /// Highest committed revision, or `INVALID_REVISION` when there is none
    async fn get_last_revision(&self) -> Result<i64>;

    async fn get_notification(&self, id: &str) -> Result<Notification>;

    /// Delete notifications created before `cutoff`, returning how many were removed
    async fn delete_notifications_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
