//! In-memory event bus, the orchestrator's default.
//!
//! Publishing never fails: a lock poisoned by a panicking subscriber thread is
//! recovered, and subscribers whose receiving end is gone are pruned (and
//! logged) on the next publish.

use std::convert::Infallible;
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};

use tracing::debug;

use crate::bus::{EventBus, Subscription};

/// Fan-out to every live subscriber, in publication order.
///
/// Publishing with zero subscribers is a successful no-op.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<mpsc::Sender<M>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribers still registered (dropped ones go at the next publish).
    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = Infallible;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut senders = self.senders();
        let before = senders.len();

        senders.retain(|tx| tx.send(message.clone()).is_ok());

        let pruned = before - senders.len();
        if pruned > 0 {
            debug!(pruned, remaining = senders.len(), "dropped closed subscriptions");
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        self.senders().push(tx);
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApmEvent, EventEnvelope};

    fn paused(seq: u64, process: &str) -> EventEnvelope<ApmEvent> {
        EventEnvelope::now(
            seq,
            ApmEvent::ProcessPaused {
                process_id: process.into(),
            },
        )
    }

    #[test]
    fn every_subscriber_receives_every_message() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(paused(1, "P1")).unwrap();
        bus.publish(paused(2, "P2")).unwrap();

        let seqs = |sub: &Subscription<EventEnvelope<ApmEvent>>| {
            sub.drain()
                .iter()
                .map(|e| e.sequence_number())
                .collect::<Vec<_>>()
        };
        assert_eq!(seqs(&a), vec![1, 2]);
        assert_eq!(seqs(&b), vec![1, 2]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(paused(1, "P1")).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.drain().len(), 1);
    }

    #[test]
    fn poisoned_lock_does_not_lose_subscribers() {
        let bus = std::sync::Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();

        let poisoner = bus.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.subscribers.lock().unwrap();
            panic!("subscriber thread crashed");
        })
        .join();
        assert!(bus.subscribers.is_poisoned());

        let late = bus.subscribe();
        bus.publish(paused(1, "P1")).unwrap();

        assert_eq!(sub.drain().len(), 1);
        assert_eq!(late.drain().len(), 1);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus: InMemoryEventBus<EventEnvelope<ApmEvent>> = InMemoryEventBus::new();
        assert!(bus.publish(paused(1, "P1")).is_ok());
    }
}
