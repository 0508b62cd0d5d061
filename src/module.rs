use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::config::ConfigTemplate;
use crate::context::{RunContext, Stage};
use crate::error::{ConfigError, ErrorRecord, ExecuteError, PrepareError};
use crate::finding::Finding;
use crate::performer::StageScheduler;

/// A named unit of work: scanner, result processor or report generator.
///
/// Instances are created by a [`ModuleFactory`] during stage preparation and
/// live until the end of the run. `prepare` runs once, synchronously, before
/// the concurrent phase; `execute` runs at most once inside a worker task.
/// Observer hooks and `flush` default to no-ops so only reporting modules
/// that care need to implement them.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique name within the module's stage.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Category used for worker pool selection (e.g. "dast", "sast").
    fn category(&self) -> &str;

    /// Names of modules that must reach a terminal state before this
    /// module's body runs. Missing names are dropped, never escalated.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names used only to bias execution ordering. A soft dependency that
    /// is present waits like a hard one; an absent one changes nothing.
    fn run_after(&self) -> Vec<String> {
        Vec::new()
    }

    /// One-time setup. May register further modules into the same stage
    /// through the scheduler handle. A failure is recorded but the module
    /// stays registered and will still be submitted.
    fn prepare(&self, _scheduler: &StageScheduler<'_>) -> Result<(), PrepareError> {
        Ok(())
    }

    /// The unit of work. A failure here is captured as an Error record;
    /// results produced before the failure are still collected.
    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecuteError>;

    fn state(&self) -> &ModuleState;

    // Observer hooks, invoked by any stage's performer on every module
    // registered in the reporting stage.

    fn on_start(&self, _ctx: &RunContext, _stage: Stage) {}

    fn on_finish(&self, _ctx: &RunContext, _stage: Stage) {}

    fn on_module_start(&self, _ctx: &RunContext, _stage: Stage, _name: &str) {}

    fn on_module_finish(&self, _ctx: &RunContext, _stage: Stage, _name: &str) {}

    /// Called once after all stages completed. Buffered reporters write
    /// out here.
    async fn flush(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        Ok(())
    }

    fn results(&self) -> Vec<Finding> {
        self.state().results()
    }

    fn errors(&self) -> Vec<ErrorRecord> {
        self.state().errors()
    }

    fn meta(&self, name: &str) -> Option<Value> {
        self.state().meta(name)
    }

    fn set_meta(&self, name: &str, value: Value) {
        self.state().set_meta(name, value)
    }
}

/// The static side of a module: config validation and construction,
/// registered in a [`crate::registry::FactoryRegistry`] under
/// (stage, category, name).
pub trait ModuleFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Checks required config keys before the module is created. A failure
    /// excludes the module from the run; the run continues.
    fn validate_config(&self, config: &Map<String, Value>) -> Result<(), ConfigError>;

    /// Writes a documented sample config for this module.
    fn fill_config(&self, _template: &mut ConfigTemplate) {}

    /// Builds the module instance. Config has been validated; heavy or
    /// fallible setup belongs in `prepare`.
    fn create(&self, category: &str, config: Map<String, Value>) -> std::sync::Arc<dyn Module>;
}

/// Per-module mutable state: findings, errors and the meta store. Findings
/// and errors are written by the module during execution and collected by
/// the engine once the task reaches a terminal state. Meta may be read
/// cross-stage, but only after the owning module's task has completed.
#[derive(Default)]
pub struct ModuleState {
    results: Mutex<Vec<Finding>>,
    errors: Mutex<Vec<ErrorRecord>>,
    meta: Mutex<Map<String, Value>>,
}

impl ModuleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_finding(&self, finding: Finding) {
        self.results.lock().push(finding);
    }

    pub fn record_error(&self, error: ErrorRecord) {
        self.errors.lock().push(error);
    }

    pub fn results(&self) -> Vec<Finding> {
        self.results.lock().clone()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().clone()
    }

    pub fn meta(&self, name: &str) -> Option<Value> {
        self.meta.lock().get(name).cloned()
    }

    pub fn set_meta(&self, name: &str, value: Value) {
        self.meta.lock().insert(name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::Severity;
    use serde_json::json;

    #[test]
    fn test_state_records_findings_and_errors() {
        let state = ModuleState::new();
        state.record_finding(Finding::new("a", "b", Severity::Low));
        state.record_error(ErrorRecord::new("m", "failed", ""));
        assert_eq!(state.results().len(), 1);
        assert_eq!(state.errors().len(), 1);
        // accessors clone; state is untouched
        assert_eq!(state.results().len(), 1);
    }

    #[test]
    fn test_state_meta_roundtrip() {
        let state = ModuleState::new();
        assert_eq!(state.meta("k"), None);
        state.set_meta("k", json!(42));
        assert_eq!(state.meta("k"), Some(json!(42)));
        state.set_meta("k", json!("v"));
        assert_eq!(state.meta("k"), Some(json!("v")));
    }
}
