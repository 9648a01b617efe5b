//! Notification Cleaner - periodically deletes expired notifications

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sm_config::NotificationSettings;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::storage::NotificationStorage;

pub struct NotificationCleaner {
    storage: Arc<dyn NotificationStorage>,
    clean_interval: Duration,
    keep_for: Duration,
}

impl NotificationCleaner {
    pub fn new(storage: Arc<dyn NotificationStorage>, settings: &NotificationSettings) -> Self {
        Self {
            storage,
            clean_interval: settings.clean_interval(),
            keep_for: settings.keep_for(),
        }
    }

    /// Delete notifications older than the retention period
    pub async fn clean(&self) -> Result<u64> {
        let keep_for = chrono::Duration::from_std(self.keep_for)
            .context("notification retention period out of range")?;
        let cutoff = Utc::now() - keep_for;

        let deleted = self.storage.delete_notifications_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted = deleted, cutoff = %cutoff, "Deleted expired notifications");
        } else {
            debug!(cutoff = %cutoff, "No expired notifications");
        }
        Ok(deleted)
    }

    /// Run `clean` every interval until shutdown
    pub fn start(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.clean_interval);
            info!(
                interval = ?self.clean_interval,
                keep_for = ?self.keep_for,
                "Notification cleaner started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.clean().await {
                            warn!(error = %e, "Notification cleanup failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Notification cleaner shutting down");
                        break;
                    }
                }
            }
        })
    }
}
