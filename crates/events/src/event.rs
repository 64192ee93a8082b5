use serde::{Deserialize, Serialize};

use apm_core::{AgentId, ErrorKind, ProcessId, StepId, TemplateId};

/// A named, immutable fact about the APM core.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "apm.process.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;
}

/// Observable lifecycle events of templates, agents and processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ApmEvent {
    TemplateRegistered {
        template_id: TemplateId,
        steps: usize,
    },
    AgentRegistered {
        agent_id: AgentId,
        capabilities: Vec<String>,
    },
    ProcessCreated {
        process_id: ProcessId,
        template_id: TemplateId,
    },
    StepStarted {
        process_id: ProcessId,
        step_id: StepId,
        agent_id: AgentId,
    },
    StepCompleted {
        process_id: ProcessId,
        step_id: StepId,
    },
    ProcessCompleted {
        process_id: ProcessId,
    },
    ProcessFailed {
        process_id: ProcessId,
        step_id: StepId,
        kind: ErrorKind,
        error: String,
    },
    ProcessPaused {
        process_id: ProcessId,
    },
    ProcessResumed {
        process_id: ProcessId,
    },
}

impl ApmEvent {
    /// The process this event belongs to (`None` for registry events).
    pub fn process_id(&self) -> Option<&ProcessId> {
        match self {
            ApmEvent::TemplateRegistered { .. } | ApmEvent::AgentRegistered { .. } => None,
            ApmEvent::ProcessCreated { process_id, .. }
            | ApmEvent::StepStarted { process_id, .. }
            | ApmEvent::StepCompleted { process_id, .. }
            | ApmEvent::ProcessCompleted { process_id }
            | ApmEvent::ProcessFailed { process_id, .. }
            | ApmEvent::ProcessPaused { process_id }
            | ApmEvent::ProcessResumed { process_id } => Some(process_id),
        }
    }
}

impl Event for ApmEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ApmEvent::TemplateRegistered { .. } => "apm.template.registered",
            ApmEvent::AgentRegistered { .. } => "apm.agent.registered",
            ApmEvent::ProcessCreated { .. } => "apm.process.created",
            ApmEvent::StepStarted { .. } => "apm.step.started",
            ApmEvent::StepCompleted { .. } => "apm.step.completed",
            ApmEvent::ProcessCompleted { .. } => "apm.process.completed",
            ApmEvent::ProcessFailed { .. } => "apm.process.failed",
            ApmEvent::ProcessPaused { .. } => "apm.process.paused",
            ApmEvent::ProcessResumed { .. } => "apm.process.resumed",
        }
    }

    fn version(&self) -> u32 {
        1
    }
}
