//! Recipient filters
//!
//! Filters run in registration order. Each one receives the current recipients
//! and may only narrow them.

use std::collections::HashSet;
use std::sync::Arc;

use sm_common::{Notification, Platform};
use tracing::{debug, warn};

pub trait ReceiversFilter: Send + Sync {
    fn filter(&self, recipients: Vec<Platform>, notification: &Notification) -> Vec<Platform>;
}

impl<F> ReceiversFilter for F
where
    F: Fn(Vec<Platform>, &Notification) -> Vec<Platform> + Send + Sync,
{
    fn filter(&self, recipients: Vec<Platform>, notification: &Notification) -> Vec<Platform> {
        self(recipients, notification)
    }
}

/// Run the filter chain, discarding any platform a filter tries to add or repeat
pub(crate) fn apply_filters(
    filters: &[Arc<dyn ReceiversFilter>],
    recipients: Vec<Platform>,
    notification: &Notification,
) -> Vec<Platform> {
    filters.iter().fold(recipients, |current, filter| {
        if current.is_empty() {
            return current;
        }
        let allowed: HashSet<String> = current.iter().map(|p| p.id.clone()).collect();
        let mut seen = HashSet::with_capacity(allowed.len());
        let mut narrowed = filter.filter(current, notification);
        narrowed.retain(|platform| {
            if !allowed.contains(&platform.id) {
                warn!(
                    platform_id = %platform.id,
                    notification_id = %notification.id,
                    "Filter returned a platform outside its input, ignoring it"
                );
                return false;
            }
            if !seen.insert(platform.id.clone()) {
                debug!(
                    platform_id = %platform.id,
                    notification_id = %notification.id,
                    "Filter returned a platform twice, keeping the first"
                );
                return false;
            }
            true
        });
        narrowed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_common::{OperationType, ResourceType};

    fn platforms(ids: &[&str]) -> Vec<Platform> {
        ids.iter().map(|id| Platform::new(*id, "cloudfoundry", *id)).collect()
    }

    fn notification() -> Notification {
        Notification::new(ResourceType::Visibility, OperationType::Created, None, 3)
    }

    fn ids(recipients: &[Platform]) -> Vec<&str> {
        recipients.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_filters_apply_in_order() {
        let drop_a: Arc<dyn ReceiversFilter> = Arc::new(|recipients: Vec<Platform>, _: &Notification| {
            recipients.into_iter().filter(|p| p.id != "a").collect()
        });
        let drop_c: Arc<dyn ReceiversFilter> = Arc::new(|recipients: Vec<Platform>, _: &Notification| {
            recipients.into_iter().filter(|p| p.id != "c").collect()
        });

        let result = apply_filters(&[drop_a, drop_c], platforms(&["a", "b", "c"]), &notification());
        assert_eq!(ids(&result), vec!["b"]);
    }

    #[test]
    fn test_filter_cannot_add_recipients() {
        let widen: Arc<dyn ReceiversFilter> = Arc::new(|mut recipients: Vec<Platform>, _: &Notification| {
            recipients.push(Platform::new("intruder", "kubernetes", "intruder"));
            recipients
        });

        let result = apply_filters(&[widen], platforms(&["a"]), &notification());
        assert_eq!(ids(&result), vec!["a"]);
    }

    #[test]
    fn test_filter_cannot_repeat_recipients() {
        let repeat: Arc<dyn ReceiversFilter> = Arc::new(|recipients: Vec<Platform>, _: &Notification| {
            let mut doubled = recipients.clone();
            doubled.extend(recipients);
            doubled
        });

        let result = apply_filters(&[repeat], platforms(&["a", "b"]), &notification());
        assert_eq!(ids(&result), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_chain_keeps_recipients() {
        let result = apply_filters(&[], platforms(&["a", "b"]), &notification());
        assert_eq!(ids(&result), vec!["a", "b"]);
    }
}
