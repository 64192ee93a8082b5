//! Lifecycle events of the APM core and the bus that distributes them.
//!
//! The orchestrator owns no logging or metrics sink. Instead it publishes a
//! named [`ApmEvent`] (wrapped in an [`EventEnvelope`]) for every lifecycle
//! step; external collaborators subscribe to the bus and decide what to do.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::{ApmEvent, Event};
pub use in_memory_bus::InMemoryEventBus;
