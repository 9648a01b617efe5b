use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sm_common::{LabelChange, Notification, ServiceManagerError, INVALID_REVISION};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::storage::NotificationStorage;

pub struct PgNotificationStorage {
    pool: PgPool,
    channel: String,
}

impl PgNotificationStorage {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Create the notification table and the trigger that publishes every insert
    /// on the notification channel
    pub async fn init_schema(&self) -> Result<()> {
        if !self
            .channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("invalid notification channel name: {}", self.channel);
        }

        let schema = format!(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                resource TEXT NOT NULL,
                type TEXT NOT NULL,
                platform_id TEXT,
                revision BIGSERIAL NOT NULL UNIQUE,
                new_state JSONB,
                old_state JSONB,
                label_changes JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_created_at ON notifications(created_at);

            CREATE OR REPLACE FUNCTION sm_notify_notification_inserted() RETURNS trigger AS $$
            BEGIN
                PERFORM pg_notify('{channel}', json_build_object(
                    'platform_id', COALESCE(NEW.platform_id, ''),
                    'notification_id', NEW.id,
                    'revision', NEW.revision
                )::text);
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS notifications_inserted ON notifications;
            CREATE TRIGGER notifications_inserted AFTER INSERT ON notifications
                FOR EACH ROW EXECUTE FUNCTION sm_notify_notification_inserted();
            "#,
            channel = self.channel
        );

        sqlx::raw_sql(&schema).execute(&self.pool).await?;
        info!(channel = %self.channel, "Notification schema initialized");
        Ok(())
    }

    /// Insert a notification; the revision is assigned by the database on commit
    pub async fn create_notification(&self, notification: &Notification) -> Result<i64> {
        let label_changes = serde_json::to_value(&notification.label_changes)?;
        let row = sqlx::query(
            r#"
            INSERT INTO notifications (id, resource, type, platform_id, new_state, old_state, label_changes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING revision
            "#,
        )
        .bind(&notification.id)
        .bind(notification.resource.as_str())
        .bind(notification.operation.as_str())
        .bind(&notification.platform_id)
        .bind(&notification.new_state)
        .bind(&notification.old_state)
        .bind(label_changes)
        .bind(notification.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("revision")?)
    }
}

fn notification_from_row(row: &PgRow) -> Result<Notification> {
    let resource: String = row.try_get("resource")?;
    let operation: String = row.try_get("type")?;
    let label_changes: serde_json::Value = row.try_get("label_changes")?;
    let label_changes: Vec<LabelChange> =
        serde_json::from_value(label_changes).context("invalid label_changes column")?;

    Ok(Notification {
        id: row.try_get("id")?,
        resource: resource.parse()?,
        operation: operation.parse()?,
        platform_id: row
            .try_get::<Option<String>, _>("platform_id")?
            .filter(|id| !id.is_empty()),
        revision: row.try_get("revision")?,
        new_state: row.try_get("new_state")?,
        old_state: row.try_get("old_state")?,
        label_changes,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl NotificationStorage for PgNotificationStorage {
    async fn get_last_revision(&self) -> Result<i64> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM notifications ORDER BY revision DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(revision.unwrap_or(INVALID_REVISION))
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        let row = sqlx::query(
            r#"
            SELECT id, resource, type, platform_id, revision, new_state, old_state, label_changes, created_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceManagerError::not_found("Notification", id))?;

        notification_from_row(&row)
    }

    async fn delete_notifications_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notifications WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
