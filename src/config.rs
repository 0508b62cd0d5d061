use std::collections::{BTreeMap, HashMap};
use std::fs;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::context::Stage;
use crate::registry::FactoryRegistry;

/// Free-form config block owned by one module instance. Modules interpret
/// their own keys; the engine only merges and hands the block over.
pub type ModuleConfig = Map<String, Value>;

/// Instance name to config, one map per category.
pub type CategorySection = BTreeMap<String, ModuleConfig>;

/// Category to named instances. A missing stage section is the one fatal
/// config error; an empty one is a valid no-module stage. BTreeMap keys
/// make registration order deterministic across runs.
pub type StageSection = BTreeMap<String, CategorySection>;

/// Top-level config document: named suites.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub suites: BTreeMap<String, SuiteConfig>,
}

/// One selectable suite.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub general: GeneralSection,
    pub scanning: Option<StageSection>,
    pub processing: Option<StageSection>,
    pub reporting: Option<StageSection>,
}

/// Suite-wide settings plus per-stage category defaults that are merged
/// under every module of that category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralSection {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub scanning: BTreeMap<String, ModuleConfig>,
    #[serde(default)]
    pub processing: BTreeMap<String, ModuleConfig>,
    #[serde(default)]
    pub reporting: BTreeMap<String, ModuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    pub project_name: Option<String>,
    /// stage label -> category -> worker limit.
    #[serde(default)]
    pub max_concurrent_modules: BTreeMap<String, BTreeMap<String, usize>>,
}

impl SuiteConfig {
    pub fn stage_section(&self, stage: Stage) -> Option<&StageSection> {
        match stage {
            Stage::Scanning => self.scanning.as_ref(),
            Stage::Processing => self.processing.as_ref(),
            Stage::Reporting => self.reporting.as_ref(),
        }
    }

    pub fn general_defaults(&self, stage: Stage) -> &BTreeMap<String, ModuleConfig> {
        match stage {
            Stage::Scanning => &self.general.scanning,
            Stage::Processing => &self.general.processing,
            Stage::Reporting => &self.general.reporting,
        }
    }

    /// Effective config for one module: the general section's category
    /// defaults, overlaid with the instance config from the stage section,
    /// overlaid with dynamic overrides. Overlays replace whole keys; nested
    /// values are never deep-merged.
    pub fn merged_module_config(
        &self,
        stage: Stage,
        category: &str,
        name: &str,
        overrides: ModuleConfig,
    ) -> ModuleConfig {
        let mut merged = self
            .general_defaults(stage)
            .get(category)
            .cloned()
            .unwrap_or_default();
        if let Some(instance) = self
            .stage_section(stage)
            .and_then(|section| section.get(category))
            .and_then(|modules| modules.get(name))
        {
            for (key, value) in instance {
                merged.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in overrides {
            merged.insert(key, value);
        }
        merged
    }

    /// Worker limits for one stage from
    /// `general.settings.max_concurrent_modules`. Unlisted categories fall
    /// back to the engine's single-worker default.
    pub fn concurrency_limits(&self, stage: Stage) -> HashMap<String, usize> {
        self.general
            .settings
            .max_concurrent_modules
            .get(stage.label())
            .map(|limits| limits.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }
}

/// Raw config text: the environment variable wins when set and non-empty,
/// which is how pipelines inject config without a checkout. Falls back to
/// the config file.
fn read_raw(config_variable: &str, config_file: &str) -> anyhow::Result<String> {
    if let Ok(raw) = std::env::var(config_variable) {
        if !raw.trim().is_empty() {
            tracing::debug!("Loading config from environment variable {}", config_variable);
            return Ok(raw);
        }
    }
    tracing::debug!("Loading config from file {}", config_file);
    fs::read_to_string(config_file)
        .with_context(|| format!("failed to read config file {}", config_file))
}

fn parse(raw: &str) -> anyhow::Result<ConfigFile> {
    serde_json::from_str(raw).context("failed to parse config")
}

pub fn load_suite(
    config_variable: &str,
    config_file: &str,
    suite: &str,
) -> anyhow::Result<SuiteConfig> {
    let parsed = parse(&read_raw(config_variable, config_file)?)?;
    match parsed.suites.get(suite) {
        Some(config) => Ok(config.clone()),
        None => {
            let available = parsed.suites.keys().cloned().collect::<Vec<_>>();
            anyhow::bail!(
                "no suite named '{}' in config (available: {})",
                suite,
                available.join(", ")
            )
        }
    }
}

pub fn list_suites(config_variable: &str, config_file: &str) -> anyhow::Result<Vec<String>> {
    let parsed = parse(&read_raw(config_variable, config_file)?)?;
    Ok(parsed.suites.keys().cloned().collect())
}

/// Documented sample entries for one module's config block, filled in by
/// `ModuleFactory::fill_config`.
#[derive(Default)]
pub struct ConfigTemplate {
    entries: Vec<TemplateEntry>,
}

pub struct TemplateEntry {
    pub key: String,
    pub value: Value,
    pub comment: String,
}

impl ConfigTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, value: impl Into<Value>, comment: &str) {
        self.entries.push(TemplateEntry {
            key: key.to_string(),
            value: value.into(),
            comment: comment.to_string(),
        });
    }

    pub fn entries(&self) -> &[TemplateEntry] {
        &self.entries
    }

    fn as_map(&self) -> ModuleConfig {
        self.entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    }
}

/// Distinct categories registered for one stage, in registration order.
fn stage_categories(factories: &FactoryRegistry, stage: Stage) -> Vec<String> {
    let mut categories = Vec::new();
    for (category, _) in factories.stage_entries(stage) {
        if !categories.contains(&category) {
            categories.push(category);
        }
    }
    categories
}

/// Full sample document covering every registered factory, shaped exactly
/// like a real config file.
pub fn sample_tree(factories: &FactoryRegistry) -> Value {
    let mut suite = Map::new();

    let mut general = Map::new();
    general.insert(
        "settings".to_string(),
        serde_json::json!({
            "project_name": "example-project",
            "max_concurrent_modules": {"scanning": {"dast": 1}},
        }),
    );
    for stage in Stage::ALL {
        let mut defaults = Map::new();
        for category in stage_categories(factories, stage) {
            defaults.insert(category, Value::Object(Map::new()));
        }
        general.insert(stage.label().to_string(), Value::Object(defaults));
    }
    suite.insert("general".to_string(), Value::Object(general));

    for stage in Stage::ALL {
        let mut section = Map::new();
        for (category, factory) in factories.stage_entries(stage) {
            let mut template = ConfigTemplate::new();
            factory.fill_config(&mut template);
            let entry = section
                .entry(category)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(modules) = entry {
                modules.insert(factory.name().to_string(), Value::Object(template.as_map()));
            }
        }
        suite.insert(stage.label().to_string(), Value::Object(section));
    }

    serde_json::json!({"suites": {"example": suite}})
}

/// Sample config as commented text. Not strict JSON because of the
/// comments; stripping `//` comments yields the same document
/// `sample_tree` builds.
pub fn render_annotated(factories: &FactoryRegistry) -> String {
    let mut out = String::new();
    out.push_str("{\n  \"suites\": {\n    \"example\": {\n");

    out.push_str("      \"general\": {\n");
    out.push_str("        \"settings\": {\n");
    out.push_str("          \"project_name\": \"example-project\", // used in report headers\n");
    out.push_str(
        "          \"max_concurrent_modules\": {\"scanning\": {\"dast\": 1}} // stage -> category -> workers\n",
    );
    out.push_str("        },\n");
    for stage in Stage::ALL {
        let body = stage_categories(factories, stage)
            .iter()
            .map(|category| format!("\"{}\": {{}}", category))
            .collect::<Vec<_>>()
            .join(", ");
        let comma = if stage == Stage::Reporting { "" } else { "," };
        out.push_str(&format!(
            "        \"{}\": {{{}}}{} // defaults for every module of a category\n",
            stage.label(),
            body,
            comma
        ));
    }
    out.push_str("      },\n");

    for stage in Stage::ALL {
        out.push_str(&format!("      \"{}\": {{\n", stage.label()));
        let categories = stage_categories(factories, stage);
        for (category_index, category) in categories.iter().enumerate() {
            out.push_str(&format!("        \"{}\": {{\n", category));
            let entries: Vec<_> = factories
                .stage_entries(stage)
                .into_iter()
                .filter(|(c, _)| c == category)
                .collect();
            for (factory_index, (_, factory)) in entries.iter().enumerate() {
                out.push_str(&format!(
                    "          \"{}\": {{ // {}\n",
                    factory.name(),
                    factory.description()
                ));
                let mut template = ConfigTemplate::new();
                factory.fill_config(&mut template);
                for (entry_index, entry) in template.entries().iter().enumerate() {
                    let comma = if entry_index + 1 == template.entries().len() { "" } else { "," };
                    out.push_str(&format!(
                        "            \"{}\": {}{} // {}\n",
                        entry.key, entry.value, comma, entry.comment
                    ));
                }
                let comma = if factory_index + 1 == entries.len() { "" } else { "," };
                out.push_str(&format!("          }}{}\n", comma));
            }
            let comma = if category_index + 1 == categories.len() { "" } else { "," };
            out.push_str(&format!("        }}{}\n", comma));
        }
        let comma = if stage == Stage::Reporting { "" } else { "," };
        out.push_str(&format!("      }}{}\n", comma));
    }

    out.push_str("    }\n  }\n}\n");
    out
}
