//! Event publishing/subscription abstraction.
//!
//! The bus is the **hook point** for logging, metrics and audit collaborators:
//! the orchestrator publishes, collaborators subscribe.
//!
//! ## Delivery
//!
//! - **Broadcast**: every subscription receives every message published after
//!   it was created.
//! - **Best effort**: no persistence; a subscriber that is dropped simply stops
//!   receiving.
//! - **Per-publisher order**: messages from one publishing thread arrive in
//!   publication order. Concurrent processes interleave freely.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

type Filter<M> = Box<dyn Fn(&M) -> bool + Send>;

/// A subscription to an event stream.
///
/// ```ignore
/// let sub = orchestrator.subscribe_process("P1");
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(envelope) => audit_log.write(envelope)?,
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consumer thread.
pub struct Subscription<M> {
    receiver: Receiver<M>,
    filter: Option<Filter<M>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only yield messages accepted by `predicate`; the rest are discarded
    /// on receipt.
    pub fn filtered<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&M) -> bool + Send + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, message: &M) -> bool {
        self.filter.as_ref().is_none_or(|f| f(message))
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        loop {
            let message = self.receiver.recv()?;
            if self.accepts(&message) {
                return Ok(message);
            }
        }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        loop {
            let message = self.receiver.try_recv()?;
            if self.accepts(&message) {
                return Ok(message);
            }
        }
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = self.receiver.recv_timeout(remaining)?;
            if self.accepts(&message) {
                return Ok(message);
            }
        }
    }

    /// Collect every message that is already pending, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver
            .try_iter()
            .filter(|m| self.accepts(m))
            .collect()
    }
}

impl<M> core::fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("filtered", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

/// Transport-agnostic pub/sub contract.
///
/// Implementations must be shareable across threads: many process tasks
/// publish concurrently through the same bus.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
