//! Event Bus - in-process typed publish/subscribe.
//!
//! Delivery is synchronous, per subscriber, in registration order. A subscriber that
//! panics is logged and skipped; the remaining subscribers still receive the event.
//! Components that need to do async work subscribe through [`Bus::channel`] and
//! consume the events from their own task.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{Event, EventKind};

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event {0} is not forwarded by this proxy")]
    NotForwarded(EventKind),
}

/// Handle returned by `subscribe`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
pub struct Bus {
    subscribers: RwLock<HashMap<EventKind, Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription { id, kind }
    }

    /// Returns `false` when the subscription was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        before != list.len()
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// The subscriber list is snapshotted first, so callbacks may publish or
    /// (un)subscribe without deadlocking.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = match self.subscribers.read().get(&kind) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => Vec::new(),
        };
        tracing::trace!(event = %kind, subscribers = callbacks.len(), "publish");

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                tracing::error!(event = %kind, "bus subscriber panicked; continuing delivery");
            }
        }
    }

    /// Subscribe to `kinds` and receive the events on a channel. Dropping the
    /// receiver unsubscribes.
    pub fn channel(self: &Arc<Self>, kinds: &[EventKind]) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = kinds
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                self.subscribe(*kind, move |event| {
                    // receiver gone: the Drop below is about to unsubscribe us
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        EventReceiver {
            rx,
            subscriptions,
            bus: Arc::downgrade(self),
        }
    }

    /// A proxy exposing only `kinds`, for observers that should not see (or know
    /// about) the rest of the traffic.
    pub fn forward(self: &Arc<Self>, kinds: &[EventKind]) -> Forwarder {
        Forwarder {
            bus: Arc::clone(self),
            kinds: kinds.to_vec(),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }
}

/// Events delivered through a channel subscription.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
    subscriptions: Vec<Subscription>,
    bus: Weak<Bus>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            for subscription in &self.subscriptions {
                bus.unsubscribe(subscription);
            }
        }
    }
}

/// Re-subscribable view over a curated subset of event kinds.
#[derive(Clone)]
pub struct Forwarder {
    bus: Arc<Bus>,
    kinds: Vec<EventKind>,
}

impl Forwarder {
    pub fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        if !self.kinds.contains(&kind) {
            return Err(BusError::NotForwarded(kind));
        }
        Ok(self.bus.subscribe(kind, callback))
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.bus.unsubscribe(subscription)
    }

    /// Channel over every forwarded kind.
    pub fn channel(&self) -> EventReceiver {
        self.bus.channel(&self.kinds)
    }
}
