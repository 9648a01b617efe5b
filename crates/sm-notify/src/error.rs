//! Notification Error Types

use thiserror::Error;

/// Failure of a single queue operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("notification queue is full")]
    Full,

    #[error("notification queue is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notificator already started")]
    AlreadyStarted,

    #[error("Notificator not started")]
    NotStarted,

    #[error("Notificator is not connected to the notification channel")]
    NotConnected,

    #[error("Connection error ({context}): {source}")]
    Connection {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage error ({context}): {source}")]
    Storage {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl NotifyError {
    pub fn connection(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Connection {
            context: context.into(),
            source,
        }
    }

    pub fn storage(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }
}
