//! Wire payload carried by each change-feed event.
//!
//! The producer (a database trigger) emits exactly:
//! `{"platform_id": "<string, may be empty>", "notification_id": "<string>", "revision": <int64>}`

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub platform_id: String,
    pub notification_id: String,
    pub revision: i64,
}

impl NotificationPayload {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Target platform, `None` for broadcast
    pub fn platform_id(&self) -> Option<&str> {
        if self.platform_id.is_empty() {
            None
        } else {
            Some(&self.platform_id)
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
