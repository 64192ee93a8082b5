//! `apm-core`: foundation types for agent process management.
//!
//! This crate contains **pure** primitives (no runtime, no IO): identifiers,
//! the process lifecycle state machine, and the error taxonomy shared by the
//! event and orchestrator crates.

pub mod error;
pub mod id;
pub mod state;

pub use error::{ApmError, ApmResult, ErrorKind, StepError};
pub use id::{AgentId, ProcessId, StepId, TemplateId};
pub use state::ProcessState;
