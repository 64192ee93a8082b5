//! Per-instance process state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use apm_core::{
    AgentId, ApmError, ApmResult, ProcessId, ProcessState, StepError, StepId, TemplateId,
};

/// Metadata key naming the template a process executes.
pub const TEMPLATE_ID_KEY: &str = "template_id";

pub type Metadata = HashMap<String, JsonValue>;
pub type Variables = HashMap<String, JsonValue>;

/// Caller-supplied seed for a new process (`{metadata, variables}`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialContext {
    pub metadata: Metadata,
    pub variables: Variables,
}

impl InitialContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with `metadata["template_id"]` already set.
    pub fn for_template(template_id: impl Into<TemplateId>) -> Self {
        let template_id: TemplateId = template_id.into();
        Self::new().with_metadata(TEMPLATE_ID_KEY, template_id.into_inner())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// State of one process instance.
///
/// Step actions and error handlers receive a copy as `&mut ProcessContext` and
/// may change `variables`, which are written back once they return. Lifecycle
/// state and agent assignments are driven by the orchestrator only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessContext {
    process_id: ProcessId,
    start_time: DateTime<Utc>,
    state: ProcessState,
    metadata: Metadata,
    /// agent -> step, non-empty only while a step is executing.
    agent_assignments: HashMap<AgentId, StepId>,
    variables: Variables,
    last_error: Option<StepError>,
}

impl ProcessContext {
    pub fn new(process_id: impl Into<ProcessId>, initial: InitialContext) -> Self {
        Self {
            process_id: process_id.into(),
            start_time: Utc::now(),
            state: ProcessState::Initialized,
            metadata: initial.metadata,
            agent_assignments: HashMap::new(),
            variables: initial.variables,
            last_error: None,
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// `metadata["template_id"]`, if present and a string.
    pub fn template_id(&self) -> Option<TemplateId> {
        self.metadata
            .get(TEMPLATE_ID_KEY)
            .and_then(JsonValue::as_str)
            .map(TemplateId::from)
    }

    pub fn agent_assignments(&self) -> &HashMap<AgentId, StepId> {
        &self.agent_assignments
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub fn variable(&self, key: &str) -> Option<&JsonValue> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.variables.insert(key.into(), value.into());
    }

    /// The step failure that moved this process to `Failed`, if any.
    pub fn last_error(&self) -> Option<&StepError> {
        self.last_error.as_ref()
    }

    pub(crate) fn transition(&mut self, next: ProcessState) -> ApmResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ApmError::InvalidTransition {
                process_id: self.process_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: StepError) -> ApmResult<()> {
        self.transition(ProcessState::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    pub(crate) fn replace_variables(&mut self, variables: Variables) {
        self.variables = variables;
    }

    pub(crate) fn into_variables(self) -> Variables {
        self.variables
    }

    pub(crate) fn assign(&mut self, agent_id: AgentId, step_id: StepId) {
        self.agent_assignments.insert(agent_id, step_id);
    }

    pub(crate) fn unassign(&mut self, agent_id: &AgentId) {
        self.agent_assignments.remove(agent_id);
    }

    pub fn status(&self) -> ProcessStatus {
        let mut active_agents: Vec<_> = self.agent_assignments.keys().cloned().collect();
        active_agents.sort();

        ProcessStatus {
            process_id: self.process_id.clone(),
            state: self.state,
            start_time: self.start_time,
            active_agents,
            template_id: self.template_id(),
            metadata: self.metadata.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view returned by `get_process_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub process_id: ProcessId,
    pub state: ProcessState,
    pub start_time: DateTime<Utc>,
    /// Agents currently assigned to a step of this process, sorted.
    pub active_agents: Vec<AgentId>,
    pub template_id: Option<TemplateId>,
    pub metadata: Metadata,
    pub last_error: Option<StepError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_context_starts_initialized_with_caller_seed() {
        let ctx = ProcessContext::new(
            "P1",
            InitialContext::for_template("T1").with_variable("qty", 3),
        );

        assert_eq!(ctx.state(), ProcessState::Initialized);
        assert_eq!(ctx.template_id(), Some(TemplateId::from("T1")));
        assert_eq!(ctx.variable("qty"), Some(&json!(3)));
        assert!(ctx.agent_assignments().is_empty());
        assert!(ctx.last_error().is_none());
    }

    #[test]
    fn template_id_must_be_a_string() {
        let initial = InitialContext::new().with_metadata(TEMPLATE_ID_KEY, 7);
        let ctx = ProcessContext::new("P1", initial);
        assert_eq!(ctx.template_id(), None);
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let mut ctx = ProcessContext::new("P1", InitialContext::new());

        assert!(matches!(
            ctx.transition(ProcessState::Completed),
            Err(ApmError::InvalidTransition {
                from: ProcessState::Initialized,
                to: ProcessState::Completed,
                ..
            })
        ));

        ctx.transition(ProcessState::Running).unwrap();
        ctx.transition(ProcessState::Paused).unwrap();
        ctx.transition(ProcessState::Running).unwrap();

        let error = StepError::NoAgentAvailable {
            step_id: "s1".into(),
            required: vec![],
        };
        ctx.fail(error.clone()).unwrap();
        assert_eq!(ctx.state(), ProcessState::Failed);
        assert_eq!(ctx.last_error(), Some(&error));
        assert!(ctx.transition(ProcessState::Running).is_err());
    }

    #[test]
    fn status_lists_assigned_agents_sorted() {
        let mut ctx = ProcessContext::new("P1", InitialContext::for_template("T1"));
        ctx.assign("B".into(), "s1".into());
        ctx.assign("A".into(), "s1".into());

        let status = ctx.status();
        assert_eq!(status.active_agents, vec![AgentId::from("A"), AgentId::from("B")]);
        assert_eq!(status.metadata[TEMPLATE_ID_KEY], json!("T1"));

        ctx.unassign(&"A".into());
        ctx.unassign(&"B".into());
        assert!(ctx.status().active_agents.is_empty());
    }
}
