use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::{ConfigTemplate, ModuleConfig};
use crate::context::RunContext;
use crate::error::{ConfigError, ExecuteError};
use crate::finding::Severity;
use crate::module::{Module, ModuleFactory, ModuleState};

const DESCRIPTION: &str = "drops findings below a severity threshold";

pub struct MinSeverityFactory;

impl ModuleFactory for MinSeverityFactory {
    fn name(&self) -> &'static str {
        "min_severity"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn validate_config(&self, config: &Map<String, Value>) -> Result<(), ConfigError> {
        let raw = config
            .get("severity")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::missing_key("severity"))?;
        raw.parse::<Severity>().map_err(ConfigError::new)?;
        Ok(())
    }

    fn fill_config(&self, template: &mut ConfigTemplate) {
        template.add("severity", "medium", "lowest severity to keep");
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        Arc::new(MinSeverityProcessor {
            category: category.to_string(),
            config,
            state: ModuleState::new(),
        })
    }
}

pub struct MinSeverityProcessor {
    category: String,
    config: ModuleConfig,
    state: ModuleState,
}

impl MinSeverityProcessor {
    fn threshold(&self) -> anyhow::Result<Severity> {
        self.config
            .get("severity")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()
            .map_err(anyhow::Error::msg)
    }
}

#[async_trait]
impl Module for MinSeverityProcessor {
    fn name(&self) -> &str {
        "min_severity"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    // Suppression should see the full finding set, so this filter yields
    // to a false_positive sibling when one is configured.
    fn run_after(&self) -> Vec<String> {
        vec!["false_positive".to_string()]
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecuteError> {
        let threshold = self.threshold().map_err(ExecuteError::from)?;
        let removed = ctx.retain_results(|finding| finding.severity >= threshold);
        tracing::info!("Dropped {} finding(s) below {}", removed, threshold);
        self.state.set_meta("dropped", Value::from(removed));
        Ok(())
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}
