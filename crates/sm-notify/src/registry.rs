//! Consumer Registry
//!
//! Index of platform id to the queues registered for it, plus the list of
//! platforms that have at least one queue. The registry does no locking of its
//! own; the Notificator keeps it behind its registry lock so that every
//! find-then-act sequence is atomic.

use std::collections::HashMap;
use std::sync::Arc;

use sm_common::Platform;

use crate::queue::NotificationQueue;

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    queues: HashMap<String, Vec<Arc<NotificationQueue>>>,
    platforms: Vec<Platform>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue for a platform; the platform is recorded on its first queue
    pub fn add(&mut self, platform: Platform, queue: Arc<NotificationQueue>) {
        let queues = self.queues.entry(platform.id.clone()).or_default();
        if queues.is_empty() {
            self.platforms.push(platform);
        }
        queues.push(queue);
    }

    /// Remove a queue wherever it is registered.
    ///
    /// Returns `false` if the queue was not registered.
    pub fn delete(&mut self, queue: &NotificationQueue) -> bool {
        let owner = self
            .queues
            .iter()
            .find(|(_, queues)| queues.iter().any(|q| q.id() == queue.id()))
            .map(|(platform_id, _)| platform_id.clone());

        let Some(platform_id) = owner else {
            return false;
        };

        let now_empty = match self.queues.get_mut(&platform_id) {
            Some(queues) => {
                queues.retain(|q| q.id() != queue.id());
                queues.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.queues.remove(&platform_id);
            self.platforms.retain(|p| p.id != platform_id);
        }
        true
    }

    /// Empty the registry, handing the previous contents to the caller.
    ///
    /// The caller is responsible for closing the returned queues.
    pub fn clear(&mut self) -> HashMap<String, Vec<Arc<NotificationQueue>>> {
        self.platforms.clear();
        std::mem::take(&mut self.queues)
    }

    pub fn queues_for_platform(&self, platform_id: &str) -> &[Arc<NotificationQueue>] {
        self.queues
            .get(platform_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn platform(&self, platform_id: &str) -> Option<&Platform> {
        self.platforms.iter().find(|p| p.id == platform_id)
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    /// Number of registered queues
    pub fn len(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}
