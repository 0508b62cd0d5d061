use std::fs;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::{ConfigTemplate, ModuleConfig};
use crate::context::{RunContext, Stage};
use crate::error::{ConfigError, ExecuteError};
use crate::finding::Severity;
use crate::module::{Module, ModuleFactory, ModuleState};

const DESCRIPTION: &str = "writes a machine-readable JSON report file";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

pub struct JsonFileFactory;

impl ModuleFactory for JsonFileFactory {
    fn name(&self) -> &'static str {
        "json"
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
        template.add("file", "/path/to/report.json", "output file path");
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        Arc::new(JsonReporter {
            category: category.to_string(),
            config,
            state: ModuleState::new(),
        })
    }
}

/// Serializes the whole run: findings, errors, severity summary and links
/// to sibling report artifacts. Runs after the HTML reporter so it can
/// reference that report's path.
pub struct JsonReporter {
    category: String,
    config: ModuleConfig,
    state: ModuleState,
}

impl JsonReporter {
    fn file(&self) -> &str {
        self.config
            .get("file")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn report(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let file = self.file();
        let findings = ctx.results();

        let mut summary = Map::new();
        for severity in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Info,
        ] {
            let count = findings.iter().filter(|f| f.severity == severity).count();
            summary.insert(severity.label().to_string(), Value::from(count));
        }

        let mut artifacts = Map::new();
        if let Some(performer) = ctx.performer(Stage::Reporting) {
            if let Some(path) = performer.get_module_meta(ctx, "html", "report_file") {
                artifacts.insert("html_report".to_string(), path);
            }
        }

        let report = json!({
            "suite": ctx.suite,
            "project_name": ctx.get_meta("project_name"),
            "generated_at": unix_now(),
            "summary": summary,
            "findings": findings,
            "errors": ctx.errors(),
            "artifacts": artifacts,
        });
        let body = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        fs::write(file, body).with_context(|| format!("failed to write JSON report {}", file))?;
        tracing::info!("Wrote JSON report to {}", file);
        self.state.set_meta("report_file", Value::from(file));
        Ok(())
    }
}

#[async_trait]
impl Module for JsonReporter {
    fn name(&self) -> &str {
        "json"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn run_after(&self) -> Vec<String> {
        vec!["html".to_string()]
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecuteError> {
        self.report(ctx).map_err(ExecuteError::from)
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;
    use crate::error::ErrorRecord;
    use crate::finding::Finding;

    #[tokio::test]
    async fn test_report_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let ctx = RunContext::new("ci", SuiteConfig::default());
        ctx.append_result(Finding::new("a", "d", Severity::High));
        ctx.append_result(Finding::new("b", "d", Severity::High));
        ctx.append_error("secrets", ErrorRecord::new("secrets", "failed", ""));

        let mut config = ModuleConfig::new();
        config.insert("file".to_string(), Value::from(path.to_str().unwrap()));
        let reporter = JsonReporter {
            category: "file".to_string(),
            config,
            state: ModuleState::new(),
        };
        reporter.execute(&ctx).await.unwrap();

        let parsed: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["suite"], "ci");
        assert_eq!(parsed["summary"]["HIGH"], 2);
        assert_eq!(parsed["findings"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["errors"]["secrets"][0]["message"], "failed");
        // no reporting performer registered, so no artifact links
        assert!(parsed["artifacts"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_runs_after_html() {
        let reporter = JsonReporter {
            category: "file".to_string(),
            config: ModuleConfig::new(),
            state: ModuleState::new(),
        };
        assert_eq!(reporter.run_after(), vec!["html"]);
    }
}
