//! Notification metrics

use metrics::{counter, gauge};

pub const DISPATCHED_TOTAL: &str = "sm_notifications_dispatched_total";
pub const QUEUES_CLOSED_TOTAL: &str = "sm_notification_queues_closed_total";
pub const CONSUMERS: &str = "sm_notification_consumers";
pub const LAST_KNOWN_REVISION: &str = "sm_notification_last_known_revision";

/// Why a consumer queue was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unregistered,
    EnqueueFailed,
    InvalidPayload,
    StorageFailure,
    ConnectionLost,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unregistered => "unregistered",
            CloseReason::EnqueueFailed => "enqueue_failed",
            CloseReason::InvalidPayload => "invalid_payload",
            CloseReason::StorageFailure => "storage_failure",
            CloseReason::ConnectionLost => "connection_lost",
        }
    }
}

pub(crate) fn record_dispatched(deliveries: usize) {
    counter!(DISPATCHED_TOTAL).increment(deliveries as u64);
}

pub(crate) fn record_queues_closed(reason: CloseReason, count: usize) {
    if count > 0 {
        counter!(QUEUES_CLOSED_TOTAL, "reason" => reason.as_str()).increment(count as u64);
    }
}

pub(crate) fn record_consumers(count: usize) {
    gauge!(CONSUMERS).set(count as f64);
}

pub(crate) fn record_last_known_revision(revision: i64) {
    gauge!(LAST_KNOWN_REVISION).set(revision as f64);
}
