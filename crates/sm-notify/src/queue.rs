//! Notification Queue
//!
//! Bounded per-consumer buffer of notifications.
//! - `enqueue` never blocks; it fails with `Full` or `Closed`
//! - `next` waits for the next notification or for closure
//! - `close` is idempotent and discards anything still buffered

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use sm_common::Notification;
use tokio::sync::Notify;

use crate::error::QueueError;

struct QueueState {
    buffer: VecDeque<Arc<Notification>>,
    closed: bool,
}

pub struct NotificationQueue {
    id: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl NotificationQueue {
    /// Create an open queue. A capacity of 0 is legal and rejects every enqueue.
    pub fn new(capacity: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            capacity,
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn enqueue(&self, notification: Arc<Notification>) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.buffer.len() >= self.capacity {
                return Err(QueueError::Full);
            }
            state.buffer.push_back(notification);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next notification without waiting
    pub fn try_next(&self) -> Result<Option<Arc<Notification>>, QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        Ok(state.buffer.pop_front())
    }

    /// Wait for the next notification.
    ///
    /// Returns `Err(QueueError::Closed)` once the queue is closed, even if the
    /// caller was already waiting when the close happened.
    pub async fn next(&self) -> Result<Arc<Notification>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking state so a wakeup between the
            // check and the await is not lost.
            notified.as_mut().enable();

            if let Some(notification) = self.try_next()? {
                return Ok(notification);
            }

            notified.await;
        }
    }

    /// Close the queue, dropping buffered notifications.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = !state.closed;
            state.closed = true;
            state.buffer.clear();
            was_open
        };
        self.notify.notify_waiters();
        was_open
    }

    /// Consume the queue as a stream that ends when the queue closes
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Arc<Notification>> + Send {
        futures::stream::unfold(self, |queue| async move {
            match queue.next().await {
                Ok(notification) => Some((notification, queue)),
                Err(_) => None,
            }
        })
    }
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NotificationQueue")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}
