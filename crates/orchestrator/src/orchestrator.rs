//! Process orchestration (the step loop).
//!
//! ## Execution flow
//!
//! ```text
//! execute_process(id)
//!   ↓
//! resolve template from metadata["template_id"], state → Running
//!   ↓
//! for each step, in declaration order:
//!   1. claim a capable agent (atomic match + mark busy)   ─┐
//!   2. evaluate every template validation rule            │ assignment cleared and
//!   3. run the step action, if any                        │ agent released on every
//!                                                        ─┘ exit path (StepGuard)
//!   on failure: state → Failed, run the handler for the error kind, stop
//!   ↓
//! state → Completed
//! ```
//!
//! ## Concurrency
//!
//! One task per process; many processes run concurrently against the same
//! [`AgentRegistry`].
//!
//! Each process lives in a `ProcessSlot`:
//!
//! - the context sits behind a std mutex that is only held for short,
//!   synchronous reads and writes, never across an `.await`. Status queries
//!   and `pause_process` therefore answer immediately, even mid-step.
//! - rules, actions and handlers work on a copy of the context; the variables
//!   they produce are written back when they return.
//! - an async `runner` lock is held by the step loop for a whole run, so at
//!   most one loop drives a process at any time.
//!
//! Every entry into `Running` starts a new run number. A loop whose run was
//! paused and then resumed elsewhere finishes its in-flight step and stops;
//! the resumed run waits on `runner` until then.
//!
//! A step that is in flight when the process is paused still completes (or
//! fails). The loop stops before the next step.
//!
//! No timeouts or cancellation: a step action that never returns blocks its
//! process indefinitely. A panicking action leaves the process `Running` with
//! its agent released; `pause_process` followed by `resume_process` starts it
//! over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use apm_core::{AgentId, ApmError, ApmResult, ProcessId, ProcessState, StepError};
use apm_events::{ApmEvent, Event, EventBus, EventEnvelope, InMemoryEventBus, Subscription};

use crate::agents::{AgentLease, AgentRecord, AgentRegistry};
use crate::config::OrchestratorConfig;
use crate::context::{InitialContext, ProcessContext, ProcessStatus, TEMPLATE_ID_KEY};
use crate::templates::{ProcessTemplate, StepSpec, TemplateRegistry};

/// Envelope type published by the orchestrator.
pub type ApmEnvelope = EventEnvelope<ApmEvent>;

/// Process counts per lifecycle state plus registry sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub templates: usize,
    pub agents: usize,
    pub busy_agents: usize,
    pub initialized: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

struct ProcessCell {
    context: ProcessContext,
    /// Bumped on every entry into `Running`.
    run: u64,
}

impl ProcessCell {
    /// Why run `run` must not start another step, if it must not.
    ///
    /// A run that was superseded by a resume reports `Paused`: that is how it
    /// ended from its caller's point of view.
    fn stopped(&self, run: u64) -> Option<ProcessState> {
        if self.run != run {
            return Some(ProcessState::Paused);
        }
        match self.context.state() {
            ProcessState::Running => None,
            other => Some(other),
        }
    }

    /// Move to `Running` and open a new run.
    fn start_run(&mut self) -> ApmResult<u64> {
        self.context.transition(ProcessState::Running)?;
        self.run += 1;
        Ok(self.run)
    }
}

struct ProcessSlot {
    process_id: ProcessId,
    cell: Mutex<ProcessCell>,
    runner: AsyncMutex<()>,
}

impl ProcessSlot {
    fn new(context: ProcessContext) -> Self {
        Self {
            process_id: context.process_id().clone(),
            cell: Mutex::new(ProcessCell { context, run: 0 }),
            runner: AsyncMutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProcessCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_back(&self, work: ProcessContext) {
        self.lock().context.replace_variables(work.into_variables());
    }
}

/// Agent claimed by one in-flight step.
///
/// Dropping it clears the process's assignment, then frees the agent.
struct StepGuard<'a> {
    slot: &'a ProcessSlot,
    agent_id: AgentId,
    _lease: AgentLease,
}

impl<'a> StepGuard<'a> {
    fn assign(slot: &'a ProcessSlot, lease: AgentLease, step: &StepSpec) -> Self {
        let agent_id = lease.agent_id().clone();
        slot.lock().context.assign(agent_id.clone(), step.step_id.clone());
        Self {
            slot,
            agent_id,
            _lease: lease,
        }
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().context.unassign(&self.agent_id);
    }
}

/// Owns the agent registry, the template registry and the active processes.
///
/// Share it by reference (or `Arc`) between the tasks that drive processes.
pub struct Orchestrator<B = InMemoryEventBus<ApmEnvelope>>
where
    B: EventBus<ApmEnvelope>,
{
    config: OrchestratorConfig,
    agents: AgentRegistry,
    templates: TemplateRegistry,
    processes: RwLock<HashMap<ProcessId, Arc<ProcessSlot>>>,
    bus: B,
    sequence: AtomicU64,
}

impl Orchestrator {
    /// Orchestrator publishing to a fresh in-memory bus.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_bus(config, InMemoryEventBus::new())
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

impl<B> Orchestrator<B>
where
    B: EventBus<ApmEnvelope>,
{
    pub fn with_bus(config: OrchestratorConfig, bus: B) -> Self {
        Self {
            config,
            agents: AgentRegistry::new(),
            templates: TemplateRegistry::new(),
            processes: RwLock::new(HashMap::new()),
            bus,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Registered templates (`contains`, `template_ids`).
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Subscription<ApmEnvelope> {
        self.bus.subscribe()
    }

    /// Receive the events of one process only.
    pub fn subscribe_process(
        &self,
        process_id: impl Into<ProcessId>,
    ) -> Subscription<ApmEnvelope> {
        let process_id = process_id.into();
        self.bus
            .subscribe()
            .filtered(move |env: &ApmEnvelope| env.payload().process_id() == Some(&process_id))
    }

    fn emit(&self, event: ApmEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event_type = event.event_type();

        if let Err(e) = self.bus.publish(EventEnvelope::now(sequence, event)) {
            warn!(
                orchestrator = %self.config.name,
                event_type,
                sequence,
                error = ?e,
                "failed to publish event"
            );
        }
    }

    fn process(&self, process_id: &str) -> ApmResult<Arc<ProcessSlot>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(process_id)
            .cloned()
            .ok_or_else(|| ApmError::ProcessNotFound {
                process_id: process_id.into(),
            })
    }

    fn template_for(&self, context: &ProcessContext) -> ApmResult<Arc<ProcessTemplate>> {
        let template_id = context
            .template_id()
            .ok_or_else(|| ApmError::MissingTemplateId {
                process_id: context.process_id().clone(),
            })?;
        self.templates.get_template(template_id.as_str())
    }

    pub fn register_template(&self, template: ProcessTemplate) -> ApmResult<()> {
        let template = self.templates.register_template(template)?;

        info!(
            orchestrator = %self.config.name,
            template_id = %template.template_id(),
            steps = template.steps().len(),
            "template registered"
        );
        self.emit(ApmEvent::TemplateRegistered {
            template_id: template.template_id().clone(),
            steps: template.steps().len(),
        });
        Ok(())
    }

    pub fn register_agent<I, S>(&self, agent_id: impl Into<AgentId>, capabilities: I) -> AgentRecord
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let record = self.agents.register_agent(agent_id, capabilities);
        let capabilities: Vec<String> = record.capabilities.iter().cloned().collect();

        info!(
            orchestrator = %self.config.name,
            agent_id = %record.agent_id,
            capabilities = ?capabilities,
            "agent registered"
        );
        self.emit(ApmEvent::AgentRegistered {
            agent_id: record.agent_id.clone(),
            capabilities,
        });
        record
    }

    pub fn heartbeat(&self, agent_id: &str) -> ApmResult<()> {
        self.agents.heartbeat(agent_id)?;
        debug!(orchestrator = %self.config.name, agent_id, "agent heartbeat");
        Ok(())
    }

    /// Create a process in state `Initialized`.
    ///
    /// `initial.metadata` must name the template under `"template_id"`
    /// (`execute_process` reads it from there) unless the orchestrator was
    /// configured with `seed_template_id`.
    pub fn create_process(
        &self,
        template_id: &str,
        process_id: impl Into<ProcessId>,
        initial: InitialContext,
    ) -> ApmResult<()> {
        let template = self.templates.get_template(template_id)?;
        let process_id = process_id.into();

        let mut initial = initial;
        if self.config.seed_template_id {
            initial
                .metadata
                .entry(TEMPLATE_ID_KEY.to_string())
                .or_insert_with(|| JsonValue::from(template.template_id().as_str()));
        }

        let context = ProcessContext::new(process_id.clone(), initial);
        if context.template_id().is_none() {
            warn!(
                orchestrator = %self.config.name,
                process_id = %process_id,
                "process created without metadata.template_id; execution will fail"
            );
        }

        {
            let mut processes = self
                .processes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if processes.contains_key(&process_id) {
                return Err(ApmError::DuplicateProcess { process_id });
            }
            processes.insert(process_id.clone(), Arc::new(ProcessSlot::new(context)));
        }

        info!(
            orchestrator = %self.config.name,
            process_id = %process_id,
            template_id = %template.template_id(),
            "process created"
        );
        self.emit(ApmEvent::ProcessCreated {
            process_id,
            template_id: template.template_id().clone(),
        });
        Ok(())
    }

    /// Run every step of an `Initialized` process's template in order.
    ///
    /// Returns the state the process ended in:
    ///
    /// - `Completed` when every step succeeded
    /// - `Failed` when a step failed and the template's handler for that error
    ///   kind recovered it
    /// - `Paused` when a pause was observed between steps
    ///
    /// A step failure without a handler is returned as `ApmError::Step`; a
    /// handler that raises is returned as `ApmError::HandlerError`. Either way
    /// the process stays `Failed`.
    ///
    /// A process that is already running, paused or finished is rejected with
    /// `InvalidTransition`; paused processes continue through `resume_process`.
    pub async fn execute_process(&self, process_id: &str) -> ApmResult<ProcessState> {
        let slot = self.process(process_id)?;

        let (template, run) = {
            let mut cell = slot.lock();
            let state = cell.context.state();
            if state != ProcessState::Initialized {
                return Err(ApmError::InvalidTransition {
                    process_id: slot.process_id.clone(),
                    from: state,
                    to: ProcessState::Running,
                });
            }
            let template = self.template_for(&cell.context)?;
            (template, cell.start_run()?)
        };

        info!(
            orchestrator = %self.config.name,
            process_id,
            template_id = %template.template_id(),
            steps = template.steps().len(),
            run,
            "process running"
        );

        self.run_steps(&slot, &template, run).await
    }

    async fn run_steps(
        &self,
        slot: &ProcessSlot,
        template: &ProcessTemplate,
        run: u64,
    ) -> ApmResult<ProcessState> {
        let _runner = slot.runner.lock().await;
        let process_id = &slot.process_id;

        for step in template.steps() {
            let stopped = slot.lock().stopped(run);
            if let Some(state) = stopped {
                debug!(
                    orchestrator = %self.config.name,
                    process_id = %process_id,
                    state = %state,
                    run,
                    next_step = %step.step_id,
                    "step loop stopped"
                );
                return Ok(state);
            }

            match self.run_step(slot, template, step).await {
                Ok(()) => {
                    debug!(
                        orchestrator = %self.config.name,
                        process_id = %process_id,
                        step_id = %step.step_id,
                        "step completed"
                    );
                    self.emit(ApmEvent::StepCompleted {
                        process_id: process_id.clone(),
                        step_id: step.step_id.clone(),
                    });
                }
                Err(error) => return self.fail(slot, template, run, error).await,
            }
        }

        {
            let mut cell = slot.lock();
            if let Some(state) = cell.stopped(run) {
                return Ok(state);
            }
            cell.context.transition(ProcessState::Completed)?;
        }

        info!(
            orchestrator = %self.config.name,
            process_id = %process_id,
            "process completed"
        );
        self.emit(ApmEvent::ProcessCompleted {
            process_id: process_id.clone(),
        });
        Ok(ProcessState::Completed)
    }

    async fn run_step(
        &self,
        slot: &ProcessSlot,
        template: &ProcessTemplate,
        step: &StepSpec,
    ) -> Result<(), StepError> {
        let lease = self
            .agents
            .try_acquire(&step.required_capabilities, &step.step_id)
            .ok_or_else(|| StepError::NoAgentAvailable {
                step_id: step.step_id.clone(),
                required: step.required_capabilities.iter().cloned().collect(),
            })?;
        let guard = StepGuard::assign(slot, lease, step);
        let agent_id = guard.agent_id.clone();

        debug!(
            orchestrator = %self.config.name,
            process_id = %slot.process_id,
            step_id = %step.step_id,
            agent_id = %agent_id,
            "step started"
        );
        self.emit(ApmEvent::StepStarted {
            process_id: slot.process_id.clone(),
            step_id: step.step_id.clone(),
            agent_id: agent_id.clone(),
        });

        let mut work = slot.lock().context.clone();
        let outcome = self.validate_and_act(&mut work, template, step, &agent_id).await;
        slot.write_back(work);

        drop(guard);
        outcome
    }

    async fn validate_and_act(
        &self,
        ctx: &mut ProcessContext,
        template: &ProcessTemplate,
        step: &StepSpec,
        agent_id: &AgentId,
    ) -> Result<(), StepError> {
        for rule in template.validation_rules() {
            let reason = match rule.validate(ctx).await {
                Ok(true) => continue,
                Ok(false) => None,
                Err(e) => Some(format!("{e:#}")),
            };
            return Err(StepError::ValidationFailed {
                step_id: step.step_id.clone(),
                rule: rule.name().to_string(),
                reason,
            });
        }

        if let Some(action) = &step.action {
            action
                .run(ctx, agent_id)
                .await
                .map_err(|e| StepError::StepActionError {
                    step_id: step.step_id.clone(),
                    agent_id: agent_id.clone(),
                    message: format!("{e:#}"),
                })?;
        }

        Ok(())
    }

    async fn fail(
        &self,
        slot: &ProcessSlot,
        template: &ProcessTemplate,
        run: u64,
        error: StepError,
    ) -> ApmResult<ProcessState> {
        let process_id = slot.process_id.clone();
        let kind = error.kind();

        let mut work = {
            let mut cell = slot.lock();
            if cell.run != run {
                warn!(
                    orchestrator = %self.config.name,
                    process_id = %process_id,
                    step_id = %error.step_id(),
                    error = %error,
                    "step failed after its run was superseded by a resume; ignored"
                );
                return Ok(ProcessState::Paused);
            }
            cell.context.fail(error.clone())?;
            cell.context.clone()
        };

        error!(
            orchestrator = %self.config.name,
            process_id = %process_id,
            step_id = %error.step_id(),
            kind = %kind,
            error = %error,
            "process failed"
        );
        self.emit(ApmEvent::ProcessFailed {
            process_id: process_id.clone(),
            step_id: error.step_id().clone(),
            kind,
            error: error.to_string(),
        });

        let Some(handler) = template.error_handler(kind) else {
            return Err(ApmError::Step { process_id, error });
        };

        let handled = handler.handle(&mut work, &error).await;
        slot.write_back(work);
        handled.map_err(|e| ApmError::HandlerError {
            process_id: process_id.clone(),
            kind,
            message: format!("{e:#}"),
        })?;

        info!(
            orchestrator = %self.config.name,
            process_id = %process_id,
            kind = %kind,
            "error handler completed"
        );
        Ok(ProcessState::Failed)
    }

    /// `Running -> Paused`; any other state is left alone.
    ///
    /// Takes effect immediately. A step already in flight runs to its end and
    /// the step loop stops before the next one.
    pub fn pause_process(&self, process_id: &str) -> ApmResult<()> {
        let slot = self.process(process_id)?;

        {
            let mut cell = slot.lock();
            let state = cell.context.state();
            if state != ProcessState::Running {
                debug!(
                    orchestrator = %self.config.name,
                    process_id,
                    state = %state,
                    "pause ignored"
                );
                return Ok(());
            }
            cell.context.transition(ProcessState::Paused)?;
        }

        info!(orchestrator = %self.config.name, process_id, "process paused");
        self.emit(ApmEvent::ProcessPaused {
            process_id: slot.process_id.clone(),
        });
        Ok(())
    }

    /// `Paused -> Running`, then execute the process again **from its first
    /// step** (no checkpoint of the paused position is kept).
    ///
    /// If the paused run still has a step in flight, the new run starts once
    /// that step has finished. Any other state is left alone and returned
    /// as-is.
    pub async fn resume_process(&self, process_id: &str) -> ApmResult<ProcessState> {
        let slot = self.process(process_id)?;

        let (template, run) = {
            let mut cell = slot.lock();
            let state = cell.context.state();
            if state != ProcessState::Paused {
                debug!(
                    orchestrator = %self.config.name,
                    process_id,
                    state = %state,
                    "resume ignored"
                );
                return Ok(state);
            }
            let template = self.template_for(&cell.context)?;
            (template, cell.start_run()?)
        };

        info!(orchestrator = %self.config.name, process_id, run, "process resumed");
        self.emit(ApmEvent::ProcessResumed {
            process_id: slot.process_id.clone(),
        });

        self.run_steps(&slot, &template, run).await
    }

    pub fn get_process_status(&self, process_id: &str) -> ApmResult<ProcessStatus> {
        let slot = self.process(process_id)?;
        let status = slot.lock().context.status();
        Ok(status)
    }

    /// Known process ids, sorted.
    pub fn process_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self
            .processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> OrchestratorStats {
        let slots: Vec<Arc<ProcessSlot>> = self
            .processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let agents = self.agents.snapshot();
        let mut stats = OrchestratorStats {
            templates: self.templates.len(),
            agents: agents.len(),
            busy_agents: agents.iter().filter(|a| !a.is_available()).count(),
            ..OrchestratorStats::default()
        };

        for slot in slots {
            let state = slot.lock().context.state();
            match state {
                ProcessState::Initialized => stats.initialized += 1,
                ProcessState::Running => stats.running += 1,
                ProcessState::Paused => stats.paused += 1,
                ProcessState::Completed => stats.completed += 1,
                ProcessState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

impl<B> Orchestrator<B>
where
    B: EventBus<ApmEnvelope> + 'static,
{
    /// Execute a process on its own tokio task.
    pub fn spawn_process(
        self: &Arc<Self>,
        process_id: impl Into<ProcessId>,
    ) -> JoinHandle<ApmResult<ProcessState>> {
        let orchestrator = Arc::clone(self);
        let process_id = process_id.into();

        tokio::spawn(async move { orchestrator.execute_process(process_id.as_str()).await })
    }
}
