use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Stage;
use crate::module::{Module, ModuleFactory};

/// Insertion-ordered map from module name to live instance. Iteration order
/// is registration order; registering an already-present name is a no-op and
/// does not move the module or reset its state.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
    order: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the name was already present (no-op).
    pub fn insert(&mut self, module: Arc<dyn Module>) -> bool {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            return false;
        }
        self.order.push(name.clone());
        self.modules.insert(name, module);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Snapshot of all modules in registration order.
    pub fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.order
            .iter()
            .filter_map(|name| self.modules.get(name).cloned())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Compile-time registry of module factories keyed by (stage, category,
/// name), populated at startup and injected into each performer. Replaces
/// filesystem plugin discovery with an explicit lookup.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<(Stage, String, String), Arc<dyn ModuleFactory>>,
    order: Vec<(Stage, String, String)>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, category: &str, factory: Arc<dyn ModuleFactory>) {
        let key = (stage, category.to_string(), factory.name().to_string());
        if self.factories.contains_key(&key) {
            return;
        }
        self.order.push(key.clone());
        self.factories.insert(key, factory);
    }

    pub fn get(&self, stage: Stage, category: &str, name: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories
            .get(&(stage, category.to_string(), name.to_string()))
            .cloned()
    }

    /// Registered (category, factory) pairs for one stage, in registration
    /// order. Used by the sample-config generator.
    pub fn stage_entries(&self, stage: Stage) -> Vec<(String, Arc<dyn ModuleFactory>)> {
        self.order
            .iter()
            .filter(|(s, _, _)| *s == stage)
            .filter_map(|key| {
                self.factories
                    .get(key)
                    .map(|factory| (key.1.clone(), factory.clone()))
            })
            .collect()
    }

    /// All shipped modules.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            Stage::Scanning,
            "dast",
            Arc::new(crate::scanners::headers::HeadersFactory),
        );
        registry.register(
            Stage::Scanning,
            "dast",
            Arc::new(crate::scanners::bundle::BundleFactory),
        );
        registry.register(
            Stage::Scanning,
            "sast",
            Arc::new(crate::scanners::secrets::SecretsFactory),
        );
        registry.register(
            Stage::Processing,
            "filter",
            Arc::new(crate::processors::false_positive::FalsePositiveFactory),
        );
        registry.register(
            Stage::Processing,
            "filter",
            Arc::new(crate::processors::min_severity::MinSeverityFactory),
        );
        registry.register(
            Stage::Reporting,
            "file",
            Arc::new(crate::reporters::html::HtmlFactory),
        );
        registry.register(
            Stage::Reporting,
            "file",
            Arc::new(crate::reporters::json_file::JsonFileFactory),
        );
        registry.register(
            Stage::Reporting,
            "live",
            Arc::new(crate::reporters::time_meta::TimeMetaFactory),
        );
        registry
    }
}
