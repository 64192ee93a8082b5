//! Process templates and the registry that holds them.
//!
//! A template is assembled with [`ProcessTemplate::add_step`],
//! [`add_validation_rule`](ProcessTemplate::add_validation_rule) and
//! [`add_error_handler`](ProcessTemplate::add_error_handler), then handed to
//! [`TemplateRegistry::register_template`] by value. From that point on it is
//! only reachable behind an `Arc`, so it cannot change anymore.
//!
//! Step actions, validation rules and error handlers are supplied by the
//! embedding application through the async traits below. Synchronous closures
//! can be adapted with [`action_fn`], [`rule_fn`] and [`handler_fn`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use apm_core::{AgentId, ApmError, ApmResult, ErrorKind, StepError, StepId, TemplateId};

use crate::context::ProcessContext;

/// Work performed by an agent for one step.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, context: &mut ProcessContext, agent_id: &AgentId) -> anyhow::Result<()>;
}

/// Predicate gating every step of a template.
///
/// Returning `Err` counts as `false`.
#[async_trait]
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str {
        "validation_rule"
    }

    async fn validate(&self, context: &ProcessContext) -> anyhow::Result<bool>;
}

/// Recovery callback for one [`ErrorKind`].
///
/// Runs after the process has been marked failed.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, context: &mut ProcessContext, error: &StepError) -> anyhow::Result<()>;
}

pub struct FnAction<F>(F);

#[async_trait]
impl<F> StepAction for FnAction<F>
where
    F: Fn(&mut ProcessContext, &AgentId) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, context: &mut ProcessContext, agent_id: &AgentId) -> anyhow::Result<()> {
        (self.0)(context, agent_id)
    }
}

pub fn action_fn<F>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(&mut ProcessContext, &AgentId) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

pub struct FnRule<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> ValidationRule for FnRule<F>
where
    F: Fn(&ProcessContext) -> anyhow::Result<bool> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, context: &ProcessContext) -> anyhow::Result<bool> {
        (self.f)(context)
    }
}

pub fn rule_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn ValidationRule>
where
    F: Fn(&ProcessContext) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnRule {
        name: name.into(),
        f,
    })
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F> ErrorHandler for FnHandler<F>
where
    F: Fn(&mut ProcessContext, &StepError) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, context: &mut ProcessContext, error: &StepError) -> anyhow::Result<()> {
        (self.0)(context, error)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn ErrorHandler>
where
    F: Fn(&mut ProcessContext, &StepError) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// One ordered unit of work in a template.
#[derive(Clone)]
pub struct StepSpec {
    pub step_id: StepId,
    pub required_capabilities: BTreeSet<String>,
    /// `None` means the step only claims an agent and passes validation.
    pub action: Option<Arc<dyn StepAction>>,
}

impl StepSpec {
    pub fn new(step_id: impl Into<StepId>) -> Self {
        Self {
            step_id: step_id.into(),
            required_capabilities: BTreeSet::new(),
            action: None,
        }
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_action(mut self, action: Arc<dyn StepAction>) -> Self {
        self.action = Some(action);
        self
    }
}

impl core::fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepSpec")
            .field("step_id", &self.step_id)
            .field("required_capabilities", &self.required_capabilities)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

/// Named, ordered definition of steps, validation rules and error handlers.
#[derive(Clone)]
pub struct ProcessTemplate {
    template_id: TemplateId,
    description: String,
    steps: Vec<StepSpec>,
    validation_rules: Vec<Arc<dyn ValidationRule>>,
    error_handlers: HashMap<ErrorKind, Arc<dyn ErrorHandler>>,
}

impl ProcessTemplate {
    pub fn new(template_id: impl Into<TemplateId>, description: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            description: description.into(),
            steps: Vec::new(),
            validation_rules: Vec::new(),
            error_handlers: HashMap::new(),
        }
    }

    pub fn add_step(&mut self, step: StepSpec) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn add_validation_rule(&mut self, rule: Arc<dyn ValidationRule>) -> &mut Self {
        self.validation_rules.push(rule);
        self
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn add_error_handler(
        &mut self,
        kind: ErrorKind,
        handler: Arc<dyn ErrorHandler>,
    ) -> &mut Self {
        self.error_handlers.insert(kind, handler);
        self
    }

    pub fn template_id(&self) -> &TemplateId {
        &self.template_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn validation_rules(&self) -> &[Arc<dyn ValidationRule>] {
        &self.validation_rules
    }

    pub fn error_handler(&self, kind: ErrorKind) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handlers.get(&kind)
    }
}

impl core::fmt::Debug for ProcessTemplate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut handled: Vec<_> = self.error_handlers.keys().copied().collect();
        handled.sort_by_key(|k| k.as_str());

        f.debug_struct("ProcessTemplate")
            .field("template_id", &self.template_id)
            .field("description", &self.description)
            .field("steps", &self.steps)
            .field("validation_rules", &self.validation_rules.len())
            .field("error_handlers", &handled)
            .finish()
    }
}

/// Registry of immutable templates (read-mostly after startup).
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<TemplateId, Arc<ProcessTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `DuplicateTemplate` if the id is taken; the registered
    /// template is left untouched in that case.
    pub fn register_template(&self, template: ProcessTemplate) -> ApmResult<Arc<ProcessTemplate>> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if templates.contains_key(template.template_id()) {
            return Err(ApmError::DuplicateTemplate {
                template_id: template.template_id,
            });
        }

        let template = Arc::new(template);
        templates.insert(template.template_id.clone(), template.clone());
        Ok(template)
    }

    pub fn get_template(&self, template_id: &str) -> ApmResult<Arc<ProcessTemplate>> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(template_id)
            .cloned()
            .ok_or_else(|| ApmError::TemplateNotFound {
                template_id: template_id.into(),
            })
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(template_id)
    }

    /// Registered ids, sorted.
    pub fn template_ids(&self) -> Vec<TemplateId> {
        let mut ids: Vec<_> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str, description: &str) -> ProcessTemplate {
        let mut t = ProcessTemplate::new(id, description);
        t.add_step(StepSpec::new("s1").requires("pack"));
        t
    }

    #[test]
    fn duplicate_registration_keeps_the_first_template() {
        let registry = TemplateRegistry::new();
        registry.register_template(template("T1", "first")).unwrap();

        let err = registry
            .register_template(template("T1", "second"))
            .unwrap_err();
        assert_eq!(
            err,
            ApmError::DuplicateTemplate {
                template_id: "T1".into()
            }
        );
        assert_eq!(registry.get_template("T1").unwrap().description(), "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_template_is_reported() {
        let registry = TemplateRegistry::new();
        assert_eq!(
            registry.get_template("nope").unwrap_err(),
            ApmError::TemplateNotFound {
                template_id: "nope".into()
            }
        );
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn builder_preserves_step_order_and_last_handler_wins() {
        let mut t = ProcessTemplate::new("T1", "order picking");
        t.add_step(StepSpec::new("pick").requires("warehouse"))
            .add_step(StepSpec::new("pack").with_capabilities(["pack", "label"]))
            .add_step(StepSpec::new("ship"))
            .add_validation_rule(rule_fn("always", |_| Ok(true)))
            .add_error_handler(ErrorKind::NoAgentAvailable, handler_fn(|_, _| Ok(())))
            .add_error_handler(
                ErrorKind::NoAgentAvailable,
                handler_fn(|_, _| Err(anyhow::anyhow!("second"))),
            );

        let ids: Vec<_> = t.steps().iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["pick", "pack", "ship"]);
        assert!(t.steps()[2].required_capabilities.is_empty());
        assert!(t.steps()[2].action.is_none());
        assert_eq!(t.validation_rules().len(), 1);
        assert_eq!(t.validation_rules()[0].name(), "always");
        assert!(t.error_handler(ErrorKind::NoAgentAvailable).is_some());
        assert!(t.error_handler(ErrorKind::ValidationFailed).is_none());
    }

    #[test]
    fn template_ids_are_sorted() {
        let registry = TemplateRegistry::new();
        registry.register_template(template("b", "")).unwrap();
        registry.register_template(template("a", "")).unwrap();

        let ids: Vec<_> = registry.template_ids().into_iter().map(TemplateId::into_inner).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
