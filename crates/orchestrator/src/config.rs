//! Orchestrator configuration.

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Name for logging
    pub name: String,
    /// Write the template id into `metadata["template_id"]` on
    /// `create_process` when the caller left it out.
    ///
    /// Off by default: callers are expected to provide it themselves and
    /// `execute_process` reports `MissingTemplateId` otherwise.
    pub seed_template_id: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "apm-orchestrator".to_string(),
            seed_template_id: false,
        }
    }
}

impl OrchestratorConfig {
    /// Read `APM_ORCHESTRATOR_NAME` and `APM_SEED_TEMPLATE_ID`, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = std::env::var("APM_ORCHESTRATOR_NAME").unwrap_or(defaults.name);
        let seed_template_id = match std::env::var("APM_SEED_TEMPLATE_ID") {
            Ok(value) => parse_flag(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "APM_SEED_TEMPLATE_ID is not a boolean; ignoring");
                defaults.seed_template_id
            }),
            Err(_) => defaults.seed_template_id,
        };

        Self {
            name,
            seed_template_id,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_seeded_template_id(mut self, seed: bool) -> Self {
        self.seed_template_id = seed;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
