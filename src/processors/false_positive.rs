use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::{ConfigTemplate, ModuleConfig};
use crate::context::RunContext;
use crate::error::{ConfigError, ExecuteError};
use crate::module::{Module, ModuleFactory, ModuleState};

const DESCRIPTION: &str = "drops findings listed in a suppression file";

pub struct FalsePositiveFactory;

impl ModuleFactory for FalsePositiveFactory {
    fn name(&self) -> &'static str {
        "false_positive"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn validate_config(&self, config: &Map<String, Value>) -> Result<(), ConfigError> {
        match config.get("file").and_then(Value::as_str) {
            Some(file) if !file.is_empty() => Ok(()),
            _ => Err(ConfigError::missing_key("file")),
        }
    }

    fn fill_config(&self, template: &mut ConfigTemplate) {
        template.add(
            "file",
            "/path/to/false_positive.config",
            "file with finding fingerprints, one per line",
        );
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        Arc::new(FalsePositiveProcessor {
            category: category.to_string(),
            config,
            state: ModuleState::new(),
        })
    }
}

/// Removes findings whose fingerprint appears in the suppression file.
/// Blank lines and `#` comments in the file are ignored.
pub struct FalsePositiveProcessor {
    category: String,
    config: ModuleConfig,
    state: ModuleState,
}

impl FalsePositiveProcessor {
    fn file(&self) -> &str {
        self.config
            .get("file")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn process(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let path = self.file();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read suppression file {}", path))?;
        let suppressed: HashSet<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        tracing::info!(
            "Processing false positives ({} suppression entries)",
            suppressed.len()
        );
        let removed = ctx.retain_results(|finding| !suppressed.contains(&finding.fingerprint()));
        if removed > 0 {
            tracing::info!("Suppressed {} known false positive(s)", removed);
        }
        self.state.set_meta("suppressed", Value::from(removed));
        Ok(())
    }
}

#[async_trait]
impl Module for FalsePositiveProcessor {
    fn name(&self) -> &str {
        "false_positive"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecuteError> {
        self.process(ctx).map_err(ExecuteError::from)
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}
