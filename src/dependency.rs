use std::collections::BTreeMap;

use crate::registry::ModuleRegistry;

/// Per-module assignment of declared hard dependencies, split into the
/// subset currently present in the registry and the subset that is not.
///
/// Absent names are dropped rather than escalated: a module whose hard
/// dependency never registers still executes, it just waits on nothing.
/// Cycles are not detected; they cannot stall execution because a task only
/// ever waits on modules submitted before it.
#[derive(Debug, Default)]
pub struct Resolution {
    resolved: BTreeMap<String, Vec<String>>,
    missing: BTreeMap<String, Vec<String>>,
}

impl Resolution {
    /// Hard dependencies of `name` that were present at resolution time.
    pub fn resolved_for(&self, name: &str) -> &[String] {
        self.resolved.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hard dependencies of `name` that were declared but absent.
    pub fn missing_for(&self, name: &str) -> &[String] {
        self.missing.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Warns once per module about dependencies that will be ignored.
    /// Called after preparation settles, not on every intermediate
    /// resolution, since modules registered later would show up as missing
    /// transiently.
    pub fn warn_missing(&self) {
        for (module, names) in &self.missing {
            tracing::warn!(
                "module {} depends on {}, which is not registered; dependency ignored",
                module,
                names.join(", ")
            );
        }
    }
}

/// Recomputes the dependency assignment for every module in the registry.
/// Invoked after each registry mutation. The resolved set for a module only
/// grows as the registry grows. No global topological order is computed;
/// ordering is enforced at execution time by waiting on dependency futures.
pub fn resolve(registry: &ModuleRegistry) -> Resolution {
    let mut resolution = Resolution::default();
    for module in registry.modules() {
        let mut present = Vec::new();
        let mut absent = Vec::new();
        for dep in module.depends_on() {
            if registry.contains(&dep) {
                present.push(dep);
            } else {
                absent.push(dep);
            }
        }
        if !absent.is_empty() {
            resolution.missing.insert(module.name().to_string(), absent);
        }
        resolution.resolved.insert(module.name().to_string(), present);
    }
    tracing::debug!(
        "resolved dependencies for {} module(s), {} with missing names",
        resolution.resolved.len(),
        resolution.missing.len()
    );
    resolution
}
