use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::config::SuiteConfig;
use crate::error::ErrorRecord;
use crate::finding::Finding;
use crate::performer::Performer;
use crate::registry::ModuleRegistry;

/// A phase of the run. Each stage owns one module registry and one performer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Scanning,
    Processing,
    Reporting,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Scanning, Stage::Processing, Stage::Reporting];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Scanning => "scanning",
            Stage::Processing => "processing",
            Stage::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared state for one invocation: the selected suite config, the
/// aggregated results and errors, one module registry per stage, the
/// performer map and free-form run metadata.
///
/// The config is read-only for the whole run. Results and errors are
/// appended from many worker tasks and sit behind mutexes; registries are
/// mutated only during the sequential preparation phase but stay lockable
/// for cross-stage meta lookups during execution.
pub struct RunContext {
    pub suite: String,
    pub config: SuiteConfig,
    results: Mutex<Vec<Finding>>,
    errors: Mutex<BTreeMap<String, Vec<ErrorRecord>>>,
    scanning: Mutex<ModuleRegistry>,
    processing: Mutex<ModuleRegistry>,
    reporting: Mutex<ModuleRegistry>,
    performers: RwLock<HashMap<Stage, Arc<Performer>>>,
    meta: Mutex<Map<String, Value>>,
}

impl RunContext {
    pub fn new(suite: impl Into<String>, config: SuiteConfig) -> Self {
        tracing::debug!("initializing run context");
        Self {
            suite: suite.into(),
            config,
            results: Mutex::new(Vec::new()),
            errors: Mutex::new(BTreeMap::new()),
            scanning: Mutex::new(ModuleRegistry::new()),
            processing: Mutex::new(ModuleRegistry::new()),
            reporting: Mutex::new(ModuleRegistry::new()),
            performers: RwLock::new(HashMap::new()),
            meta: Mutex::new(Map::new()),
        }
    }

    pub fn registry(&self, stage: Stage) -> &Mutex<ModuleRegistry> {
        match stage {
            Stage::Scanning => &self.scanning,
            Stage::Processing => &self.processing,
            Stage::Reporting => &self.reporting,
        }
    }

    pub fn set_performer(&self, stage: Stage, performer: Arc<Performer>) {
        self.performers.write().insert(stage, performer);
    }

    pub fn performer(&self, stage: Stage) -> Option<Arc<Performer>> {
        self.performers.read().get(&stage).cloned()
    }

    pub fn append_result(&self, finding: Finding) {
        self.results.lock().push(finding);
    }

    pub fn append_results(&self, findings: Vec<Finding>) {
        if findings.is_empty() {
            return;
        }
        self.results.lock().extend(findings);
    }

    /// Snapshot of the aggregated findings. Order is completion order of
    /// the producing tasks, not submission order.
    pub fn results(&self) -> Vec<Finding> {
        self.results.lock().clone()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().len()
    }

    /// Keeps only findings matching the predicate; returns how many were
    /// dropped. Used by processing modules to filter the shared sequence.
    pub fn retain_results<F>(&self, f: F) -> usize
    where
        F: FnMut(&Finding) -> bool,
    {
        let mut results = self.results.lock();
        let before = results.len();
        results.retain(f);
        before - results.len()
    }

    pub fn append_error(&self, producer: impl Into<String>, error: ErrorRecord) {
        self.errors.lock().entry(producer.into()).or_default().push(error);
    }

    pub fn append_module_errors(&self, producer: impl Into<String>, errors: Vec<ErrorRecord>) {
        if errors.is_empty() {
            return;
        }
        self.errors.lock().entry(producer.into()).or_default().extend(errors);
    }

    pub fn errors(&self) -> BTreeMap<String, Vec<ErrorRecord>> {
        self.errors.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().values().map(Vec::len).sum()
    }

    pub fn set_meta(&self, name: &str, value: Value) {
        self.meta.lock().insert(name.to_string(), value);
    }

    pub fn get_meta(&self, name: &str) -> Option<Value> {
        self.meta.lock().get(name).cloned()
    }
}
