//! Notificator - distributes change-feed events to registered consumers
//!
//! - Listens on the notification channel while at least one consumer is registered
//! - Resolves recipients per event, fetches the full notification and applies filters
//! - Fans one shared notification out to every recipient queue
//! - Force-closes every consumer when continuity can no longer be guaranteed
//!
//! Two locks are used. The connection lock guards the connection handle and
//! listen/unlisten transitions; the registry lock guards the consumers and the
//! last known revision. Whenever both are needed the connection lock is taken
//! first. The dispatch loop and the connection state task only ever take the
//! registry lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use sm_common::{Notification, Platform, INVALID_REVISION};
use sm_config::NotificationSettings;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::connection::{
    ConnectionEvent, ConnectionEventHandler, ConnectionFactory, NotificationConnection, RawEvent,
    RawEventReceiver,
};
use crate::error::NotifyError;
use crate::filter::{apply_filters, ReceiversFilter};
use crate::payload::NotificationPayload;
use crate::queue::NotificationQueue;
use crate::registry::ConsumerRegistry;
use crate::storage::NotificationStorage;
use crate::telemetry::{self, CloseReason};
use crate::Result;

/// State guarded by the registry lock
struct Consumers {
    registry: ConsumerRegistry,
    last_known_revision: i64,
}

impl Consumers {
    fn observe_revision(&mut self, revision: i64) {
        if revision > self.last_known_revision {
            self.last_known_revision = revision;
            telemetry::record_last_known_revision(revision);
        }
    }

    fn recipients(&self, platform_id: Option<&str>) -> Vec<Platform> {
        match platform_id {
            None => self.registry.platforms().to_vec(),
            Some(id) => self.registry.platform(id).cloned().into_iter().collect(),
        }
    }

    /// Close and drop every registered queue, returning how many were closed
    fn close_all(&mut self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for (_, queues) in self.registry.clear() {
            for queue in queues {
                queue.close();
                closed += 1;
            }
        }
        telemetry::record_queues_closed(reason, closed);
        telemetry::record_consumers(0);
        closed
    }
}

/// Point-in-time view of the notificator
#[derive(Debug, Clone, Serialize)]
pub struct NotificatorStats {
    pub started: bool,
    pub connected: bool,
    pub listening: bool,
    pub consumers: usize,
    pub platforms: usize,
    pub last_known_revision: i64,
}

pub struct Notificator {
    settings: NotificationSettings,
    storage: Arc<dyn NotificationStorage>,
    connection_factory: Arc<dyn ConnectionFactory>,

    /// Connection lock
    connection: Mutex<Option<Arc<dyn NotificationConnection>>>,

    /// Registry lock
    consumers: Mutex<Consumers>,

    filters: RwLock<Vec<Arc<dyn ReceiversFilter>>>,

    started: AtomicBool,
    connected: AtomicBool,
    listening: AtomicBool,
}

impl Notificator {
    pub fn new(
        settings: NotificationSettings,
        storage: Arc<dyn NotificationStorage>,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            settings,
            storage,
            connection_factory,
            connection: Mutex::new(None),
            consumers: Mutex::new(Consumers {
                registry: ConsumerRegistry::new(),
                last_known_revision: INVALID_REVISION,
            }),
            filters: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            listening: AtomicBool::new(false),
        }
    }

    /// Open the connection and spawn the background tasks.
    ///
    /// Everything stops once `shutdown` fires (or its sender is dropped).
    pub async fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NotifyError::AlreadyStarted);
        }

        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let handler = self.connection_event_handler(state_tx);

        let connection = match self.connection_factory.open(handler).await {
            Ok(connection) => connection,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(NotifyError::connection("failed to open notification connection", e));
            }
        };

        let Some(events) = connection.take_notification_channel() else {
            self.started.store(false, Ordering::SeqCst);
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close notification connection");
            }
            return Err(NotifyError::connection(
                "failed to open notification connection",
                anyhow::anyhow!("notification channel already taken"),
            ));
        };

        *self.connection.lock().await = Some(connection);

        tokio::spawn(self.clone().handle_connection_events(state_rx));
        tokio::spawn(self.clone().process_notifications(events));
        tokio::spawn(self.clone().await_shutdown(shutdown));

        info!(
            channel = %self.settings.channel,
            queues_size = self.settings.queues_size,
            "Notificator started"
        );
        Ok(())
    }

    /// Register a consumer queue for `platform`.
    ///
    /// Returns the queue and the last known revision; every notification with a
    /// higher revision for this platform will be delivered to the queue until it
    /// is closed.
    pub async fn register_consumer(&self, platform: Platform) -> Result<(Arc<NotificationQueue>, i64)> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(NotifyError::NotStarted);
        }
        if !self.is_connected() {
            return Err(NotifyError::NotConnected);
        }

        let connection_guard = self.connection.lock().await;
        let connection = connection_guard.as_ref().ok_or(NotifyError::NotStarted)?;

        if !self.listening.load(Ordering::SeqCst) {
            self.start_listening(connection.as_ref()).await?;
        }

        let mut consumers = self.consumers.lock().await;
        // A disconnect flips the flag before its force-close takes the registry
        // lock, so a queue added while the flag is still set will be closed by it.
        if !self.is_connected() {
            return Err(NotifyError::NotConnected);
        }

        let queue = Arc::new(NotificationQueue::new(self.settings.queues_size));
        consumers.registry.add(platform.clone(), queue.clone());
        let revision = consumers.last_known_revision;
        telemetry::record_consumers(consumers.registry.len());

        info!(
            platform_id = %platform.id,
            queue_id = %queue.id(),
            revision = revision,
            "Registered notification consumer"
        );
        Ok((queue, revision))
    }

    /// Close and unregister a queue; stops listening when it was the last one.
    ///
    /// The queue is unregistered even if stopping the subscription fails.
    pub async fn unregister_consumer(&self, queue: &NotificationQueue) -> Result<()> {
        let became_idle = {
            let mut consumers = self.consumers.lock().await;
            let removed = consumers.registry.delete(queue);
            if queue.close() {
                telemetry::record_queues_closed(CloseReason::Unregistered, 1);
            }
            telemetry::record_consumers(consumers.registry.len());
            removed && consumers.registry.is_empty()
        };

        debug!(queue_id = %queue.id(), "Unregistered notification consumer");

        if became_idle {
            self.stop_listening_if_idle().await?;
        }
        Ok(())
    }

    /// Append a filter to the recipient filter chain. Only allowed before `start`.
    pub fn register_filter<F>(&self, filter: F) -> Result<()>
    where
        F: ReceiversFilter + 'static,
    {
        if self.started.load(Ordering::SeqCst) {
            return Err(NotifyError::AlreadyStarted);
        }
        self.filters.write().push(Arc::new(filter));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub async fn last_known_revision(&self) -> i64 {
        self.consumers.lock().await.last_known_revision
    }

    /// Check the underlying connection
    pub async fn ping(&self) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or(NotifyError::NotStarted)?;
        connection
            .ping()
            .await
            .map_err(|e| NotifyError::connection("ping failed", e))
    }

    pub async fn stats(&self) -> NotificatorStats {
        let consumers = self.consumers.lock().await;
        NotificatorStats {
            started: self.started.load(Ordering::SeqCst),
            connected: self.is_connected(),
            listening: self.is_listening(),
            consumers: consumers.registry.len(),
            platforms: consumers.registry.platforms().len(),
            last_known_revision: consumers.last_known_revision,
        }
    }

    /// Subscribe to the channel and capture the baseline revision.
    ///
    /// Called with the connection lock held. The subscription happens before the
    /// baseline read, so an event committed in between may be both delivered and
    /// already covered by the returned revision.
    async fn start_listening(&self, connection: &dyn NotificationConnection) -> Result<()> {
        let channel = &self.settings.channel;
        connection
            .listen(channel)
            .await
            .map_err(|e| NotifyError::connection(format!("failed to listen on channel {channel}"), e))?;

        let revision = match self.storage.get_last_revision().await {
            Ok(revision) => revision,
            Err(e) => {
                if let Err(unlisten_err) = connection.unlisten(channel).await {
                    warn!(
                        channel = %channel,
                        error = %unlisten_err,
                        "Failed to roll back subscription"
                    );
                }
                return Err(NotifyError::storage("failed to read last notification revision", e));
            }
        };

        // The store may have been cleaned since the last subscription, so the
        // baseline can be lower than what was already observed.
        self.consumers.lock().await.observe_revision(revision);
        self.listening.store(true, Ordering::SeqCst);

        info!(channel = %channel, revision = revision, "Started listening for notifications");
        Ok(())
    }

    async fn stop_listening_if_idle(&self) -> Result<()> {
        let connection_guard = self.connection.lock().await;
        if !self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.consumers.lock().await.registry.is_empty() {
            return Ok(());
        }
        let Some(connection) = connection_guard.as_ref() else {
            return Ok(());
        };

        let channel = &self.settings.channel;
        connection
            .unlisten(channel)
            .await
            .map_err(|e| NotifyError::connection(format!("failed to unlisten channel {channel}"), e))?;
        self.listening.store(false, Ordering::SeqCst);

        info!(channel = %channel, "Stopped listening for notifications");
        Ok(())
    }

    fn connection_event_handler(
        self: &Arc<Self>,
        state_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionEventHandler {
        let notificator: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event: ConnectionEvent| {
            if let Some(notificator) = notificator.upgrade() {
                notificator
                    .connected
                    .store(event.is_connected(), Ordering::SeqCst);
            }
            let _ = state_tx.send(event);
        })
    }

    async fn handle_connection_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            if event.is_connected() {
                info!(event = ?event, "Notification connection established");
                continue;
            }

            let closed = self.consumers.lock().await.close_all(CloseReason::ConnectionLost);
            warn!(
                event = ?event,
                closed_consumers = closed,
                "Notification connection lost, all consumers must resynchronize"
            );

            if let Err(e) = self.stop_listening_if_idle().await {
                warn!(error = %e, "Failed to stop listening after connection loss");
            }
        }
        debug!("Connection event handler stopped");
    }

    async fn process_notifications(self: Arc<Self>, mut events: RawEventReceiver) {
        info!("Notification dispatch loop started");
        while let Some(event) = events.recv().await {
            // Keepalive
            let Some(event) = event else {
                continue;
            };
            self.process_event(&event).await;
        }
        info!("Notification channel closed, dispatch loop stopped");
    }

    async fn process_event(self: &Arc<Self>, event: &RawEvent) {
        let payload = match NotificationPayload::decode(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let closed = self.consumers.lock().await.close_all(CloseReason::InvalidPayload);
                error!(
                    channel = %event.channel,
                    error = %e,
                    closed_consumers = closed,
                    "Could not decode notification payload, closing all consumers"
                );
                return;
            }
        };

        debug!(
            notification_id = %payload.notification_id,
            platform_id = %payload.platform_id,
            revision = payload.revision,
            "Received notification event"
        );

        let mut consumers = self.consumers.lock().await;
        consumers.observe_revision(payload.revision);

        let recipients = consumers.recipients(payload.platform_id());
        if recipients.is_empty() {
            debug!(notification_id = %payload.notification_id, "No recipients for notification");
            return;
        }

        let notification = match self.storage.get_notification(&payload.notification_id).await {
            Ok(notification) => Arc::new(notification),
            Err(e) => {
                let closed = consumers.close_all(CloseReason::StorageFailure);
                error!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    closed_consumers = closed,
                    "Could not fetch notification, closing all consumers"
                );
                return;
            }
        };

        let recipients = {
            let filters = self.filters.read();
            apply_filters(&filters, recipients, &notification)
        };

        let (delivered, failed) = fan_out(&consumers.registry, &recipients, &notification);
        for queue in &failed {
            queue.close();
            consumers.registry.delete(queue);
        }
        telemetry::record_dispatched(delivered);
        telemetry::record_queues_closed(CloseReason::EnqueueFailed, failed.len());
        telemetry::record_consumers(consumers.registry.len());

        let became_idle = !failed.is_empty() && consumers.registry.is_empty();
        drop(consumers);

        if became_idle {
            // Unlistening waits on the connection, which may itself be waiting
            // for this loop to take the next event.
            let notificator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = notificator.stop_listening_if_idle().await {
                    warn!(error = %e, "Failed to stop listening after dropping consumers");
                }
            });
        }
    }

    async fn await_shutdown(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let _ = shutdown.recv().await;
        info!("Notificator shutting down");

        let connection_guard = self.connection.lock().await;
        let Some(connection) = connection_guard.as_ref() else {
            return;
        };

        if self.listening.load(Ordering::SeqCst) {
            match connection.unlisten(&self.settings.channel).await {
                Ok(()) => self.listening.store(false, Ordering::SeqCst),
                Err(e) => warn!(error = %e, "Failed to unlisten during shutdown"),
            }
        }

        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close notification connection");
        }
        info!("Notificator stopped");
    }
}

/// Push one shared notification into every queue of every recipient.
///
/// Returns the number of successful deliveries and the queues that rejected it.
fn fan_out(
    registry: &ConsumerRegistry,
    recipients: &[Platform],
    notification: &Arc<Notification>,
) -> (usize, Vec<Arc<NotificationQueue>>) {
    let mut delivered = 0;
    let mut failed = Vec::new();

    for platform in recipients {
        for queue in registry.queues_for_platform(&platform.id) {
            match queue.enqueue(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        platform_id = %platform.id,
                        queue_id = %queue.id(),
                        notification_id = %notification.id,
                        error = %e,
                        "Could not deliver notification, closing consumer queue"
                    );
                    failed.push(queue.clone());
                }
            }
        }
    }

    (delivered, failed)
}
