use crate::error::{BusError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strata_core::{AggregateType, Event};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

type Senders = HashMap<AggregateType, Vec<(u64, UnboundedSender<Event>)>>;

struct Inner {
    senders: RwLock<Senders>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn unsubscribe(&self, id: u64) {
        let mut senders = self.senders.write();
        for subs in senders.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        senders.retain(|_, subs| !subs.is_empty());
    }
}

/// Live event delivery by aggregate type
///
/// The bus is an explicitly owned object: every engine creates (or is handed)
/// its own bus, so several engines can coexist in one process without
/// sharing subscriptions. Cloning the bus yields another handle to the same
/// subscriptions.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                senders: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to the events of `aggregate_types`
    ///
    /// Events are queued without bound until the subscription receives them.
    pub fn subscribe(&self, aggregate_types: &[AggregateType]) -> Result<Subscription> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if aggregate_types.is_empty() {
            return Err(BusError::NoAggregateTypes);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut senders = self.inner.senders.write();
            for aggregate_type in aggregate_types {
                senders
                    .entry(aggregate_type.clone())
                    .or_default()
                    .push((id, tx.clone()));
            }
        }

        tracing::debug!(subscription = id, ?aggregate_types, "subscribed");

        Ok(Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver an event to every subscription of its aggregate type,
    /// returning the number of deliveries
    pub fn publish(&self, event: &Event) -> Result<usize> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let senders = self.inner.senders.read();
        let Some(subs) = senders.get(&event.aggregate_type) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for (id, tx) in subs {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::trace!(subscription = id, "dropping event for closed subscription");
            }
        }
        Ok(delivered)
    }

    /// Close the bus. Open subscriptions drain what is queued and then end.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.senders.write().clear();
            tracing::debug!("event bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        let senders = self.inner.senders.read();
        let mut ids: Vec<u64> = senders
            .values()
            .flat_map(|subs| subs.iter().map(|(id, _)| *id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Receiving end of a bus subscription; unsubscribes on drop
pub struct Subscription {
    id: u64,
    receiver: UnboundedReceiver<Event>,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the bus is closed and the queue
    /// is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take an already queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take up to `max` already queued events without waiting
    pub fn drain(&mut self, max: usize) -> Vec<Event> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.try_recv() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}
