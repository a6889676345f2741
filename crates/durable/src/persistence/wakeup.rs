//! In-process wakeup fan-out for notification and event waiters
//!
//! Waiters subscribe before their initial lookup, closing the lost-wakeup
//! window: anything already stored is found by the lookup, anything later
//! arrives as a wakeup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub(crate) struct WakeupHub {
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl WakeupHub {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, key: String) -> Subscription {
        let notify = self
            .waiters
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        Subscription {
            hub: Arc::clone(self),
            key,
            notify,
        }
    }

    pub(crate) fn wake(&self, key: &str) {
        if let Some(notify) = self.waiters.lock().get(key) {
            notify.notify_waiters();
        }
    }
}

/// A registered waiter; deregisters on drop once no other waiter shares the key
pub(crate) struct Subscription {
    hub: Arc<WakeupHub>,
    key: String,
    pub(crate) notify: Arc<Notify>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut waiters = self.hub.waiters.lock();
        if let Some(entry) = waiters.get(&self.key) {
            // One reference in the map, one in self
            if Arc::strong_count(entry) <= 2 {
                waiters.remove(&self.key);
            }
        }
    }
}

/// Wakeup key for a (destination, topic) message queue
pub(crate) fn notification_key(destination: &str, topic: &str) -> String {
    format!("n:{destination}::{topic}")
}

/// Wakeup key for a (workflow, key) event
pub(crate) fn event_key(workflow_id: &str, key: &str) -> String {
    format!("e:{workflow_id}::{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wake_reaches_subscriber() {
        let hub = Arc::new(WakeupHub::new());
        let subscription = hub.subscribe(notification_key("wf-1", "chan"));

        let notified = subscription.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        hub.wake(&notification_key("wf-1", "chan"));

        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("should be woken");
    }

    #[tokio::test]
    async fn test_subscription_cleans_up_on_drop() {
        let hub = Arc::new(WakeupHub::new());
        let key = event_key("wf-1", "status");

        let subscription = hub.subscribe(key.clone());
        assert_eq!(hub.waiters.lock().len(), 1);

        drop(subscription);
        assert!(hub.waiters.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shared_key_survives_one_drop() {
        let hub = Arc::new(WakeupHub::new());
        let key = event_key("wf-1", "status");

        let first = hub.subscribe(key.clone());
        let second = hub.subscribe(key.clone());

        drop(first);
        assert_eq!(hub.waiters.lock().len(), 1);

        drop(second);
        assert!(hub.waiters.lock().is_empty());
    }
}
