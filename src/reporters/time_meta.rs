use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::{RunContext, Stage};
use crate::error::{ConfigError, ExecuteError};
use crate::module::{Module, ModuleFactory, ModuleState};

const DESCRIPTION: &str = "records start and finish times for stages and modules";

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

pub struct TimeMetaFactory;

impl ModuleFactory for TimeMetaFactory {
    fn name(&self) -> &'static str {
        "time_meta"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn validate_config(&self, _config: &Map<String, Value>) -> Result<(), ConfigError> {
        // takes no config
        Ok(())
    }

    fn create(&self, category: &str, _config: Map<String, Value>) -> Arc<dyn Module> {
        Arc::new(TimeMetaReporter {
            category: category.to_string(),
            state: ModuleState::new(),
        })
    }
}

/// Live reporter driven entirely by observer hooks. Stage timings land in
/// this module's own meta under `{stage}_start_time` / `{stage}_finish_time`;
/// per-module timings land in the observed module's meta under `start_time` /
/// `finish_time`.
pub struct TimeMetaReporter {
    category: String,
    state: ModuleState,
}

#[async_trait]
impl Module for TimeMetaReporter {
    fn name(&self) -> &str {
        "time_meta"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        Ok(())
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn on_start(&self, _ctx: &RunContext, stage: Stage) {
        self.set_meta(
            &format!("{}_start_time", stage.label()),
            Value::from(unix_now()),
        );
        tracing::debug!("Marked {} stage start", stage);
    }

    fn on_finish(&self, _ctx: &RunContext, stage: Stage) {
        let finished = unix_now();
        let key = format!("{}_finish_time", stage.label());
        self.set_meta(&key, Value::from(finished));
        let seconds = self
            .meta(&format!("{}_start_time", stage.label()))
            .and_then(|value| value.as_u64())
            .map(|start| finished.saturating_sub(start))
            .unwrap_or_default();
        tracing::info!("{} stage took {} seconds", stage, seconds);
    }

    fn on_module_start(&self, ctx: &RunContext, stage: Stage, name: &str) {
        let module = { ctx.registry(stage).lock().get(name) };
        if let Some(module) = module {
            module.set_meta("start_time", Value::from(unix_now()));
            tracing::debug!("Started {} with {}", stage, name);
        }
    }

    fn on_module_finish(&self, ctx: &RunContext, stage: Stage, name: &str) {
        let module = { ctx.registry(stage).lock().get(name) };
        let Some(module) = module else { return };
        let finished = unix_now();
        module.set_meta("finish_time", Value::from(finished));
        let seconds = module
            .meta("start_time")
            .and_then(|value| value.as_u64())
            .map(|start| finished.saturating_sub(start))
            .unwrap_or_default();
        tracing::info!(
            "Finished {} with {} ({} seconds, {} result(s), {} error(s))",
            stage,
            name,
            seconds,
            module.results().len(),
            module.errors().len()
        );
    }

    async fn flush(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        let start = self
            .meta("scanning_start_time")
            .and_then(|value| value.as_u64());
        let finish = self
            .meta("reporting_finish_time")
            .and_then(|value| value.as_u64());
        if let (Some(start), Some(finish)) = (start, finish) {
            tracing::info!("Run finished ({} seconds)", finish.saturating_sub(start));
        }
        Ok(())
    }
}
