//! Postgres LISTEN/NOTIFY connection
//!
//! A worker task owns the `PgListener`. It serves listen/unlisten/ping/close
//! commands, forwards notifications and reconnects with exponential backoff,
//! re-listening to every active channel once the connection is back.
//!
//! `Reconnected` is only reported after the worker has opened a new listener and
//! restored its channels. A listener that reports a lost connection is dropped
//! rather than left to reconnect on its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sm_config::NotificationSettings;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::connection::{
    ConnectionEvent, ConnectionEventHandler, ConnectionFactory, NotificationConnection, RawEvent,
    RawEventReceiver,
};

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 1024;

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    Listen(String, Reply),
    Unlisten(String, Reply),
    Ping(Reply),
    Close(Reply),
}

/// A live subscription session
#[async_trait]
trait Listener: Send {
    async fn listen(&mut self, channel: &str) -> Result<()>;
    async fn unlisten(&mut self, channel: &str) -> Result<()>;
    async fn ping(&mut self) -> Result<()>;

    /// Next notification; `Ok(None)` once the connection has been lost
    async fn recv(&mut self) -> Result<Option<RawEvent>>;
}

/// Opens listeners already subscribed to `channels`
#[async_trait]
trait Connector: Send + Sync + 'static {
    type Listener: Listener;

    async fn connect(&self, channels: &HashSet<String>) -> Result<Self::Listener>;
}

struct PgConnector {
    pool: PgPool,
}

#[async_trait]
impl Connector for PgConnector {
    type Listener = PgListener;

    async fn connect(&self, channels: &HashSet<String>) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        if !channels.is_empty() {
            listener.listen_all(channels.iter().map(String::as_str)).await?;
        }
        Ok(listener)
    }
}

#[async_trait]
impl Listener for PgListener {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        PgListener::listen(self, channel).await?;
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<()> {
        PgListener::unlisten(self, channel).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&mut *self).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RawEvent>> {
        Ok(self.try_recv().await?.map(|notification| RawEvent {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
        }))
    }
}

pub struct PgConnectionFactory {
    pool: PgPool,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl PgConnectionFactory {
    pub fn new(pool: PgPool, settings: &NotificationSettings) -> Self {
        Self {
            pool,
            min_reconnect_interval: settings.min_reconnect_interval(),
            max_reconnect_interval: settings.max_reconnect_interval(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn open(&self, on_event: ConnectionEventHandler) -> Result<Arc<dyn NotificationConnection>> {
        let connector = PgConnector {
            pool: self.pool.clone(),
        };
        Ok(Arc::new(spawn_worker(
            connector,
            self.min_reconnect_interval,
            self.max_reconnect_interval,
            on_event,
        )))
    }
}

fn spawn_worker<C: Connector>(
    connector: C,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
    on_event: ConnectionEventHandler,
) -> PgNotificationConnection {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    let worker = ListenerWorker {
        connector,
        min_reconnect_interval,
        max_reconnect_interval,
        on_event,
        events: event_tx,
        channels: HashSet::new(),
    };
    tokio::spawn(worker.run(command_rx));

    PgNotificationConnection {
        commands: command_tx,
        events: Mutex::new(Some(event_rx)),
    }
}

pub struct PgNotificationConnection {
    commands: mpsc::Sender<Command>,
    events: Mutex<Option<RawEventReceiver>>,
}

impl PgNotificationConnection {
    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| anyhow!("notification connection is closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("notification connection is closed"))?
    }
}

#[async_trait]
impl NotificationConnection for PgNotificationConnection {
    async fn listen(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.request(|reply| Command::Listen(channel, reply)).await
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.request(|reply| Command::Unlisten(channel, reply)).await
    }

    async fn close(&self) -> Result<()> {
        if self.commands.is_closed() {
            return Ok(());
        }
        self.request(Command::Close).await
    }

    async fn ping(&self) -> Result<()> {
        self.request(Command::Ping).await
    }

    fn take_notification_channel(&self) -> Option<RawEventReceiver> {
        self.events.lock().take()
    }
}

enum Wake {
    Command(Option<Command>),
    Notification(Result<Option<RawEvent>>),
}

struct ListenerWorker<C: Connector> {
    connector: C,
    min_reconnect_interval: Duration,
    max_reconnect_interval: Duration,
    on_event: ConnectionEventHandler,
    events: mpsc::Sender<Option<RawEvent>>,
    channels: HashSet<String>,
}

impl<C: Connector> ListenerWorker<C> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut listener: Option<C::Listener> = None;
        let mut backoff = self.min_reconnect_interval;
        let mut has_connected = false;

        loop {
            let Some(active) = listener.as_mut() else {
                match self.connector.connect(&self.channels).await {
                    Ok(connected) => {
                        listener = Some(connected);
                        backoff = self.min_reconnect_interval;
                        let event = if has_connected {
                            ConnectionEvent::Reconnected
                        } else {
                            ConnectionEvent::Connected
                        };
                        has_connected = true;
                        info!(channels = self.channels.len(), "Notification listener connected");
                        (self.on_event)(event);
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?backoff, "Notification listener connection attempt failed");
                        (self.on_event)(ConnectionEvent::ConnectionAttemptFailed);
                        if !self.wait_disconnected(&mut commands, backoff).await {
                            break;
                        }
                        backoff = (backoff * 2).min(self.max_reconnect_interval);
                    }
                }
                continue;
            };

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                received = active.recv() => Wake::Notification(received),
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(Command::Close(reply))) => {
                    listener = None;
                    (self.on_event)(ConnectionEvent::Disconnected);
                    let _ = reply.send(Ok(()));
                    break;
                }
                Wake::Command(Some(command)) => self.handle_connected(active, command).await,
                Wake::Notification(Ok(Some(event))) => {
                    if self.events.send(Some(event)).await.is_err() {
                        debug!("Notification receiver dropped, discarding event");
                    }
                }
                Wake::Notification(Ok(None)) => {
                    warn!("Notification listener lost its connection");
                    listener = None;
                    (self.on_event)(ConnectionEvent::Disconnected);
                }
                Wake::Notification(Err(e)) => {
                    error!(error = %e, "Notification listener connection failed");
                    listener = None;
                    (self.on_event)(ConnectionEvent::Disconnected);
                }
            }
        }

        info!("Notification listener stopped");
    }

    async fn handle_connected(&mut self, listener: &mut C::Listener, command: Command) {
        match command {
            Command::Listen(channel, reply) => {
                let result = listener.listen(&channel).await;
                if result.is_ok() {
                    self.channels.insert(channel);
                }
                let _ = reply.send(result);
            }
            Command::Unlisten(channel, reply) => {
                let result = listener.unlisten(&channel).await;
                self.channels.remove(&channel);
                let _ = reply.send(result);
            }
            Command::Ping(reply) => {
                let _ = reply.send(listener.ping().await);
            }
            Command::Close(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Serve commands until the backoff elapses. Returns `false` when the
    /// worker should stop.
    async fn wait_disconnected(&mut self, commands: &mut mpsc::Receiver<Command>, backoff: Duration) -> bool {
        let deadline = tokio::time::sleep(backoff);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                command = commands.recv() => match command {
                    None => return false,
                    Some(Command::Close(reply)) => {
                        (self.on_event)(ConnectionEvent::Disconnected);
                        let _ = reply.send(Ok(()));
                        return false;
                    }
                    // Applied once the connection is back
                    Some(Command::Listen(channel, reply)) => {
                        self.channels.insert(channel);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Unlisten(channel, reply)) => {
                        self.channels.remove(&channel);
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Ping(reply)) => {
                        let _ = reply.send(Err(anyhow!("notification listener is not connected")));
                    }
                }
            }
        }
    }
}
