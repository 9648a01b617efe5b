//! Change-feed connection contract.
//!
//! A connection subscribes to named channels of the backing store and hands
//! out the raw events it receives. Transport state changes are reported to the
//! handler supplied when the connection is opened.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A raw event as delivered by the change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub channel: String,
    pub payload: String,
}

/// Receiving end of the raw event channel. `None` items are keepalive markers.
pub type RawEventReceiver = mpsc::Receiver<Option<RawEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Reconnected,
    Disconnected,
    ConnectionAttemptFailed,
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected | ConnectionEvent::Reconnected)
    }
}

/// Callback invoked on every transport state change
pub type ConnectionEventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[async_trait]
pub trait NotificationConnection: Send + Sync {
    async fn listen(&self, channel: &str) -> Result<()>;
    async fn unlisten(&self, channel: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;

    /// Hand out the raw event receiver. Only the first call returns `Some`.
    fn take_notification_channel(&self) -> Option<RawEventReceiver>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, on_event: ConnectionEventHandler) -> Result<Arc<dyn NotificationConnection>>;
}
