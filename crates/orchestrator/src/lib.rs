//! `apm-orchestrator`: agent process management.
//!
//! **Responsibility:** turn registered templates into running processes:
//! claim capability-matched agents for each step, gate steps with validation
//! rules, run step actions, and recover failures through per-kind handlers.
//!
//! ```ignore
//! let orch = Orchestrator::new(OrchestratorConfig::from_env());
//! orch.register_agent("A1", ["pack"]);
//!
//! let mut template = ProcessTemplate::new("T1", "pack order");
//! template.add_step(StepSpec::new("s1").requires("pack").with_action(action_fn(|ctx, _| {
//!     ctx.set_variable("done", true);
//!     Ok(())
//! })));
//! orch.register_template(template)?;
//!
//! orch.create_process("T1", "P1", InitialContext::for_template("T1"))?;
//! assert_eq!(orch.execute_process("P1").await?, ProcessState::Completed);
//! ```
//!
//! Transport (HTTP/CLI), persistence and authentication live elsewhere.

pub mod agents;
pub mod config;
pub mod context;
pub mod orchestrator;
pub mod templates;

pub use agents::{AgentLease, AgentRecord, AgentRegistry, AgentStatus};
pub use config::OrchestratorConfig;
pub use context::{
    InitialContext, Metadata, ProcessContext, ProcessStatus, TEMPLATE_ID_KEY, Variables,
};
pub use orchestrator::{ApmEnvelope, Orchestrator, OrchestratorStats};
pub use templates::{
    ErrorHandler, ProcessTemplate, StepAction, StepSpec, TemplateRegistry, ValidationRule,
    action_fn, handler_fn, rule_fn,
};

pub use apm_core::{
    AgentId, ApmError, ApmResult, ErrorKind, ProcessId, ProcessState, StepError, StepId,
    TemplateId,
};
pub use apm_events::{ApmEvent, EventBus, EventEnvelope, InMemoryEventBus, Subscription};
