//! Error model for agent process management.
//!
//! Two layers:
//!
//! - [`StepError`]: failures raised while executing a single step. These are
//!   eligible for recovery through a template's error handlers, which are keyed
//!   by [`ErrorKind`].
//! - [`ApmError`]: everything an orchestrator operation can return to its
//!   caller, including step failures that were not recovered locally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{AgentId, ProcessId, StepId, TemplateId};
use crate::state::ProcessState;

/// Result type used by the registries and the orchestrator.
pub type ApmResult<T> = Result<T, ApmError>;

/// Closed set of step-level failure kinds (error handler dispatch key).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoAgentAvailable,
    ValidationFailed,
    StepActionError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoAgentAvailable => "no_agent_available",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::StepActionError => "step_action_error",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single step.
///
/// Kept `Clone` + serializable so the triggering error can be stored on the
/// process context and reported through status queries after the fact.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// No registered agent is available with the required capabilities.
    #[error("no available agent for step '{step_id}' (required capabilities: {required:?})")]
    NoAgentAvailable {
        step_id: StepId,
        required: Vec<String>,
    },

    /// A template validation rule returned `false` or raised.
    #[error("validation rule '{rule}' rejected step '{step_id}'{}", reason_suffix(.reason))]
    ValidationFailed {
        step_id: StepId,
        rule: String,
        reason: Option<String>,
    },

    /// The step action raised.
    #[error("action of step '{step_id}' failed on agent '{agent_id}': {message}")]
    StepActionError {
        step_id: StepId,
        agent_id: AgentId,
        message: String,
    },
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {r}"),
        None => String::new(),
    }
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::NoAgentAvailable { .. } => ErrorKind::NoAgentAvailable,
            StepError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            StepError::StepActionError { .. } => ErrorKind::StepActionError,
        }
    }

    pub fn step_id(&self) -> &StepId {
        match self {
            StepError::NoAgentAvailable { step_id, .. }
            | StepError::ValidationFailed { step_id, .. }
            | StepError::StepActionError { step_id, .. } => step_id,
        }
    }
}

/// Error returned by registry and orchestrator operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApmError {
    #[error("template '{template_id}' is already registered")]
    DuplicateTemplate { template_id: TemplateId },

    #[error("template '{template_id}' not found")]
    TemplateNotFound { template_id: TemplateId },

    #[error("process '{process_id}' not found")]
    ProcessNotFound { process_id: ProcessId },

    #[error("process '{process_id}' already exists")]
    DuplicateProcess { process_id: ProcessId },

    #[error("agent '{agent_id}' not found")]
    AgentNotFound { agent_id: AgentId },

    /// The context metadata does not name the template to execute.
    #[error("process '{process_id}' has no 'template_id' in its metadata")]
    MissingTemplateId { process_id: ProcessId },

    #[error("process '{process_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        process_id: ProcessId,
        from: ProcessState,
        to: ProcessState,
    },

    /// A step failed and the template had no handler for its kind.
    #[error("process '{process_id}' failed: {error}")]
    Step {
        process_id: ProcessId,
        #[source]
        error: StepError,
    },

    /// The error handler for a step failure raised itself.
    #[error("error handler for {kind} in process '{process_id}' failed: {message}")]
    HandlerError {
        process_id: ProcessId,
        kind: ErrorKind,
        message: String,
    },
}

impl ApmError {
    /// The underlying step failure, if this error carries one.
    pub fn step_error(&self) -> Option<&StepError> {
        match self {
            ApmError::Step { error, .. } => Some(error),
            _ => None,
        }
    }
}
