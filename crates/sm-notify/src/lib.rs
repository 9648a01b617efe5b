//! Service Manager Notifications
//!
//! This crate distributes committed resource changes to registered platforms:
//! - Notificator: listens on the change feed and fans notifications out to consumers
//! - NotificationQueue: bounded, closable per-consumer buffer
//! - ConsumerRegistry: platform to queue index
//! - ReceiversFilter: ordered recipient filter chain
//! - NotificationCleaner: periodic removal of expired notifications
//! - postgres: LISTEN/NOTIFY connection and notification table storage (feature `postgres`)

pub mod cleaner;
pub mod connection;
pub mod error;
pub mod filter;
pub mod notificator;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod telemetry;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cleaner::NotificationCleaner;
pub use connection::{
    ConnectionEvent, ConnectionEventHandler, ConnectionFactory, NotificationConnection, RawEvent,
    RawEventReceiver,
};
pub use error::{NotifyError, QueueError};
pub use filter::ReceiversFilter;
pub use notificator::{Notificator, NotificatorStats};
pub use payload::NotificationPayload;
pub use queue::NotificationQueue;
pub use registry::ConsumerRegistry;
pub use storage::NotificationStorage;

pub type Result<T> = std::result::Result<T, NotifyError>;
