// ABOUTME: Typed publish/subscribe message bus with synchronous, in-order delivery.
// ABOUTME: Subscriber errors are logged and isolated; handlers unsubscribe by id.

pub mod messages;

pub use messages::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// A subscriber callback. Returning an error never affects other
/// subscribers or the publisher; it is logged and dropped.
pub type BusHandler = Arc<dyn Fn(&BusMessage) -> anyhow::Result<()> + Send + Sync>;

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: HashMap<MessageKind, Vec<(SubscriptionId, BusHandler)>>,
}

/// In-process message bus decoupling who asks for a confirmation from who
/// decides it. `publish` delivers synchronously, in subscription order,
/// to every subscriber of the message's kind.
#[derive(Default)]
pub struct MessageBus {
    inner: Mutex<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one message kind. Delivery order follows
    /// subscription order.
    pub fn subscribe(
        &self,
        kind: MessageKind,
        handler: impl Fn(&BusMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner
            .subscribers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription by identity. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        for handlers in inner.subscribers.values_mut() {
            handlers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Deliver a message to every subscriber of its kind, in order. The
    /// handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe reentrantly without deadlocking.
    pub fn publish(&self, message: &BusMessage) {
        let handlers: Vec<BusHandler> = {
            let inner = self.inner.lock().expect("bus lock poisoned");
            inner
                .subscribers
                .get(&message.kind())
                .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler(message) {
                warn!(kind = ?message.kind(), error = %e, "bus subscriber failed");
            }
        }
    }

    /// Number of live subscriptions for a kind, mostly for tests.
    pub fn subscriber_count(&self, kind: MessageKind) -> usize {
        self.inner
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .get(&kind)
            .map_or(0, Vec::len)
    }
}
