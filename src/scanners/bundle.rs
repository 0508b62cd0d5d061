use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{ConfigTemplate, ModuleConfig};
use crate::context::RunContext;
use crate::error::{ConfigError, ExecuteError, PrepareError};
use crate::module::{Module, ModuleFactory, ModuleState};
use crate::performer::StageScheduler;

const DESCRIPTION: &str = "schedules a configured set of modules as one unit";

/// One bundled entry. Everything besides category and name is passed
/// through as that module's config overrides.
#[derive(Debug, Clone, Deserialize)]
struct BundleMember {
    category: String,
    name: String,
    #[serde(flatten)]
    config: ModuleConfig,
}

fn parse_members(config: &Map<String, Value>) -> anyhow::Result<Vec<BundleMember>> {
    let members = config
        .get("members")
        .cloned()
        .context("required config key 'members' is missing")?;
    serde_json::from_value(members).context("invalid members list")
}

pub struct BundleFactory;

impl ModuleFactory for BundleFactory {
    fn name(&self) -> &'static str {
        "bundle"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn validate_config(&self, config: &Map<String, Value>) -> Result<(), ConfigError> {
        parse_members(config).map_err(|err| ConfigError::new(format!("{:#}", err)))?;
        Ok(())
    }

    fn fill_config(&self, template: &mut ConfigTemplate) {
        template.add(
            "members",
            serde_json::json!([
                {"category": "dast", "name": "headers", "target": "https://app.example.com"}
            ]),
            "modules to schedule, with their config overrides inline",
        );
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        Arc::new(BundleScanner {
            category: category.to_string(),
            config,
            state: ModuleState::new(),
        })
    }
}

/// Expands into its members at preparation time. Has no body of its own:
/// the scheduled members run as ordinary modules of this stage.
pub struct BundleScanner {
    category: String,
    config: ModuleConfig,
    state: ModuleState,
}

#[async_trait]
impl Module for BundleScanner {
    fn name(&self) -> &str {
        "bundle"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn prepare(&self, scheduler: &StageScheduler<'_>) -> Result<(), PrepareError> {
        let members = parse_members(&self.config).map_err(PrepareError::from)?;
        tracing::info!("Bundle expands into {} module(s)", members.len());
        for member in members {
            scheduler.schedule(&member.category, &member.name, member.config);
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        Ok(())
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_members_parse_with_inline_overrides() {
        let mut config = ModuleConfig::new();
        config.insert(
            "members".to_string(),
            json!([{"category": "sast", "name": "secrets", "code": "/src"}]),
        );
        let members = parse_members(&config).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].category, "sast");
        assert_eq!(members[0].name, "secrets");
        assert_eq!(members[0].config.get("code"), Some(&json!("/src")));
    }

    #[test]
    fn test_validation_rejects_malformed_members() {
        let factory = BundleFactory;
        assert!(factory.validate_config(&ModuleConfig::new()).is_err());
        let mut config = ModuleConfig::new();
        config.insert("members".to_string(), json!([{"category": "sast"}]));
        assert!(factory.validate_config(&config).is_err());
        config.insert(
            "members".to_string(),
            json!([{"category": "sast", "name": "secrets"}]),
        );
        assert!(factory.validate_config(&config).is_ok());
    }
}
