//! In-memory collaborators for driving the Notificator in tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use sm_common::{Notification, OperationType, Platform, ResourceType};
use sm_config::NotificationSettings;
use sm_notify::{
    ConnectionEvent, ConnectionEventHandler, ConnectionFactory, NotificationConnection,
    NotificationPayload, NotificationQueue, NotificationStorage, Notificator, QueueError, RawEvent,
    RawEventReceiver,
};

pub const CHANNEL: &str = "notifications";

/// Mock change-feed connection
pub struct MockConnection {
    pub listen_calls: AtomicUsize,
    pub unlisten_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub fail_close: AtomicBool,
    events: Mutex<Option<RawEventReceiver>>,
    handler: Mutex<Option<ConnectionEventHandler>>,
}

impl MockConnection {
    fn new(events: RawEventReceiver) -> Self {
        Self {
            listen_calls: AtomicUsize::new(0),
            unlisten_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            events: Mutex::new(Some(events)),
            handler: Mutex::new(None),
        }
    }

    /// Report a transport state change the way a real connection would
    pub fn emit(&self, event: ConnectionEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn listens(&self) -> usize {
        self.listen_calls.load(Ordering::SeqCst)
    }

    pub fn unlistens(&self) -> usize {
        self.unlisten_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationConnection for MockConnection {
    async fn listen(&self, _channel: &str) -> Result<()> {
        self.listen_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unlisten(&self, _channel: &str) -> Result<()> {
        self.unlisten_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            anyhow::bail!("connection already broken");
        }
        self.emit(ConnectionEvent::Disconnected);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn take_notification_channel(&self) -> Option<RawEventReceiver> {
        self.events.lock().take()
    }
}

pub struct MockConnectionFactory {
    connection: Arc<MockConnection>,
    connect_on_open: bool,
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn open(&self, on_event: ConnectionEventHandler) -> Result<Arc<dyn NotificationConnection>> {
        *self.connection.handler.lock() = Some(on_event);
        if self.connect_on_open {
            self.connection.emit(ConnectionEvent::Connected);
        }
        Ok(self.connection.clone())
    }
}

/// Mock notification storage
pub struct MockStorage {
    notifications: Mutex<HashMap<String, Notification>>,
    last_revision: AtomicI64,
    fail_last_revision: AtomicBool,
    held_last_revision: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    pub last_revision_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl MockStorage {
    pub fn new(last_revision: i64) -> Self {
        Self {
            notifications: Mutex::new(HashMap::new()),
            last_revision: AtomicI64::new(last_revision),
            fail_last_revision: AtomicBool::new(false),
            held_last_revision: Mutex::new(None),
            last_revision_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, notification: Notification) {
        self.notifications
            .lock()
            .insert(notification.id.clone(), notification);
    }

    pub fn set_fail_last_revision(&self, fail: bool) {
        self.fail_last_revision.store(fail, Ordering::SeqCst);
    }

    pub fn set_last_revision(&self, revision: i64) {
        self.last_revision.store(revision, Ordering::SeqCst);
    }

    /// Make the next `get_last_revision` wait until released.
    ///
    /// Returns a receiver that fires once the call is waiting, and the sender
    /// that releases it.
    pub fn hold_last_revision(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.held_last_revision.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationStorage for MockStorage {
    async fn get_last_revision(&self) -> Result<i64> {
        self.last_revision_calls.fetch_add(1, Ordering::SeqCst);
        let held = self.held_last_revision.lock().take();
        if let Some((entered, release)) = held {
            let _ = entered.send(());
            let _ = release.await;
        }
        if self.fail_last_revision.load(Ordering::SeqCst) {
            anyhow::bail!("database unavailable");
        }
        Ok(self.last_revision.load(Ordering::SeqCst))
    }

    async fn get_notification(&self, id: &str) -> Result<Notification> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.notifications
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("notification {id} not found"))
    }

    async fn delete_notifications_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

/// A notificator wired to mock collaborators
pub struct Harness {
    pub notificator: Arc<Notificator>,
    pub connection: Arc<MockConnection>,
    pub storage: Arc<MockStorage>,
    pub events: mpsc::Sender<Option<RawEvent>>,
    pub shutdown: broadcast::Sender<()>,
}

impl Harness {
    pub fn new(queues_size: usize, last_revision: i64) -> Self {
        Self::build(queues_size, last_revision, true)
    }

    /// Harness whose connection stays down until a `Connected` event is emitted
    pub fn disconnected(queues_size: usize) -> Self {
        Self::build(queues_size, 0, false)
    }

    fn build(queues_size: usize, last_revision: i64, connect_on_open: bool) -> Self {
        let (events, events_rx) = mpsc::channel(64);
        let connection = Arc::new(MockConnection::new(events_rx));
        let storage = Arc::new(MockStorage::new(last_revision));
        let factory = Arc::new(MockConnectionFactory {
            connection: connection.clone(),
            connect_on_open,
        });

        let settings = NotificationSettings {
            queues_size,
            ..Default::default()
        };
        let notificator = Arc::new(Notificator::new(settings, storage.clone(), factory));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            notificator,
            connection,
            storage,
            events,
            shutdown,
        }
    }

    pub async fn start(&self) {
        self.notificator
            .start(self.shutdown.subscribe())
            .await
            .expect("notificator should start");
    }

    pub async fn register(&self, platform_id: &str) -> (Arc<NotificationQueue>, i64) {
        self.notificator
            .register_consumer(platform(platform_id))
            .await
            .expect("consumer should register")
    }

    /// Store a notification and publish its change event
    pub async fn publish(&self, id: &str, platform_id: &str, revision: i64) {
        self.storage.insert(notification(id, platform_id, revision));
        self.send_event(platform_id, id, revision).await;
    }

    /// Publish a change event without storing the notification
    pub async fn send_event(&self, platform_id: &str, id: &str, revision: i64) {
        let payload = NotificationPayload {
            platform_id: platform_id.to_string(),
            notification_id: id.to_string(),
            revision,
        };
        self.send_raw(&payload.encode().unwrap()).await;
    }

    /// Send a keepalive marker on the raw event channel
    pub async fn send_keepalive(&self) {
        self.events
            .send(None)
            .await
            .expect("dispatch loop should be running");
    }

    pub async fn send_raw(&self, payload: &str) {
        self.events
            .send(Some(RawEvent {
                channel: CHANNEL.to_string(),
                payload: payload.to_string(),
            }))
            .await
            .expect("dispatch loop should be running");
    }
}

pub fn platform(id: &str) -> Platform {
    Platform::new(id, "kubernetes", format!("{id}-cluster"))
}

pub fn notification(id: &str, platform_id: &str, revision: i64) -> Notification {
    let mut notification = Notification::new(
        ResourceType::ServiceInstance,
        OperationType::Created,
        Some(platform_id.to_string()),
        revision,
    );
    notification.id = id.to_string();
    notification
}

/// Route crate logs to the test output
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sm_notify=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the next notification, failing the test if none arrives in time
pub async fn next_within(queue: &NotificationQueue) -> Result<Arc<Notification>, QueueError> {
    tokio::time::timeout(Duration::from_secs(2), queue.next())
        .await
        .expect("timed out waiting on notification queue")
}
