use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};

use crate::config::ModuleConfig;
use crate::context::{RunContext, Stage};
use crate::dependency;
use crate::error::ErrorRecord;
use crate::registry::FactoryRegistry;

/// Hooks fired around stage and module execution. Every performer relays
/// them to the modules registered in the reporting stage, which lets live
/// reporters watch the whole run without polling.
pub trait Observer: Send + Sync {
    fn on_start(&self, ctx: &RunContext, stage: Stage);

    fn on_finish(&self, ctx: &RunContext, stage: Stage);

    fn on_module_start(&self, ctx: &RunContext, stage: Stage, name: &str);

    fn on_module_finish(&self, ctx: &RunContext, stage: Stage, name: &str);
}

/// Completion signal for one submitted module. Cloned into the wait set of
/// every later submission that depends on it.
type Completion = Shared<BoxFuture<'static, ()>>;

/// Worker pool sizing is a capacity property of the run, not a scheduling
/// property of a module.
const DEFAULT_POOL_SIZE: usize = 1;

/// Per-category semaphores, created lazily on first use. Categories absent
/// from the suite's limits table run one module at a time.
struct CategoryPools {
    limits: HashMap<String, usize>,
    pools: DashMap<String, Arc<Semaphore>>,
}

impl CategoryPools {
    fn new(limits: HashMap<String, usize>) -> Self {
        Self {
            limits,
            pools: DashMap::new(),
        }
    }

    fn pool_for(&self, category: &str) -> Arc<Semaphore> {
        if let Some(pool) = self.pools.get(category) {
            return pool.value().clone();
        }
        let size = self.limits.get(category).copied().unwrap_or(DEFAULT_POOL_SIZE);
        tracing::info!("Made {} pool with {} workers", category.to_uppercase(), size);
        let pool = Arc::new(Semaphore::new(size));
        self.pools.insert(category.to_string(), pool.clone());
        pool
    }
}

/// Drives one stage: schedules modules from config during preparation and
/// runs them through bounded worker pools during execution. Holds no run
/// state of its own; everything lives in the [`RunContext`].
pub struct Performer {
    stage: Stage,
    factories: Arc<FactoryRegistry>,
}

/// Registration handle passed into `Module::prepare`. Borrowing the
/// performer and context keeps scheduling confined to the synchronous
/// preparation phase; there is no way to hold one into the concurrent
/// phase.
pub struct StageScheduler<'a> {
    performer: &'a Performer,
    ctx: &'a RunContext,
}

impl<'a> StageScheduler<'a> {
    pub fn context(&self) -> &RunContext {
        self.ctx
    }

    /// Schedules another module into the same stage. Dynamic overrides win
    /// over the suite file's instance config.
    pub fn schedule(&self, category: &str, name: &str, overrides: ModuleConfig) {
        self.performer.schedule(self.ctx, category, name, overrides);
    }
}

impl Performer {
    pub fn new(stage: Stage, factories: Arc<FactoryRegistry>) -> Self {
        Self { stage, factories }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The one fatal config check: the stage's section must exist, even if
    /// empty. Every other problem degrades to a recorded error.
    pub fn validate_config(&self, ctx: &RunContext) -> anyhow::Result<()> {
        if ctx.config.stage_section(self.stage).is_none() {
            anyhow::bail!("no {} configuration present", self.stage);
        }
        Ok(())
    }

    /// Walks the stage's config section and schedules each referenced
    /// module. Modules may schedule further modules from their own
    /// `prepare`; those land in the registry before this returns.
    pub fn prepare(&self, ctx: &RunContext) {
        let section = match ctx.config.stage_section(self.stage) {
            Some(section) => section.clone(),
            None => return,
        };
        for (category, modules) in &section {
            for name in modules.keys() {
                self.schedule(ctx, category, name, ModuleConfig::new());
            }
        }
        let resolution = dependency::resolve(&ctx.registry(self.stage).lock());
        resolution.warn_missing();
        tracing::info!(
            "Prepared {} stage: {} module(s) registered",
            self.stage,
            ctx.registry(self.stage).lock().len()
        );
    }

    /// Schedules one module: factory lookup, config merge, validation,
    /// creation, registration, then its `prepare`. Scheduling an
    /// already-registered name is a no-op. All failures are recorded against
    /// the module name; a prepare failure leaves the module registered.
    fn schedule(&self, ctx: &RunContext, category: &str, name: &str, overrides: ModuleConfig) {
        if ctx.registry(self.stage).lock().contains(name) {
            tracing::debug!("Module {} already scheduled, skipping", name);
            return;
        }
        let factory = match self.factories.get(self.stage, category, name) {
            Some(factory) => factory,
            None => {
                tracing::warn!("No {} module {} in category {}", self.stage, name, category);
                ctx.append_error(
                    name,
                    ErrorRecord::new(
                        name,
                        format!("failed to schedule {} module {}", self.stage, name),
                        format!("no module '{}' in category '{}'", name, category),
                    ),
                );
                return;
            }
        };
        let config = ctx.config.merged_module_config(self.stage, category, name, overrides);
        if let Err(err) = factory.validate_config(&config) {
            tracing::warn!("Invalid config for {} module {}: {}", self.stage, name, err);
            ctx.append_error(
                name,
                ErrorRecord::new(
                    name,
                    format!("invalid config for {} module {}", self.stage, name),
                    err.to_string(),
                ),
            );
            return;
        }
        let module = factory.create(category, config);
        {
            let mut registry = ctx.registry(self.stage).lock();
            if !registry.insert(module.clone()) {
                return;
            }
            dependency::resolve(&registry);
        }
        tracing::debug!("Scheduled {} module {} ({})", self.stage, name, category);
        let scheduler = StageScheduler { performer: self, ctx };
        if let Err(err) = module.prepare(&scheduler) {
            let err = anyhow::Error::from(err);
            tracing::warn!("Prepare failed for {} module {}: {:#}", self.stage, name, err);
            ctx.append_error(
                name,
                ErrorRecord::new(
                    name,
                    format!("failed to prepare {} module {}", self.stage, name),
                    format!("{:#}", err),
                ),
            );
        }
    }

    /// Runs every registered module of this stage, bounded per category,
    /// honoring dependency order. Results and errors drain into the
    /// context as each task reaches a terminal state; a module failure
    /// never escapes this method.
    pub async fn perform(&self, ctx: &Arc<RunContext>) {
        let observer = observer_for(ctx);
        if let Some(observer) = &observer {
            observer.on_start(ctx, self.stage);
        }

        let modules = ctx.registry(self.stage).lock().modules();
        let resolution = dependency::resolve(&ctx.registry(self.stage).lock());
        tracing::info!("Starting {} stage with {} module(s)", self.stage, modules.len());

        let pools = CategoryPools::new(ctx.config.concurrency_limits(self.stage));
        let mut completions: HashMap<String, Completion> = HashMap::new();
        let mut tasks = FuturesUnordered::new();

        for module in modules {
            let name = module.name().to_string();

            // A task only ever waits on modules submitted before it, so a
            // dependency cycle cannot stall the stage. Soft dependencies
            // wait the same way when present and change nothing when not.
            let mut waits: Vec<Completion> = Vec::new();
            for dep in resolution.resolved_for(&name).iter().chain(module.run_after().iter()) {
                if let Some(done) = completions.get(dep.as_str()) {
                    waits.push(done.clone());
                }
            }

            // A dropped sender still completes the shared future, so
            // dependents never hang on an aborted task.
            let (done_tx, done_rx) = oneshot::channel::<()>();
            let done: Completion = done_rx.map(|_| ()).boxed().shared();
            completions.insert(name.clone(), done);

            let pool = pools.pool_for(module.category());
            let stage = self.stage;
            let task_ctx = ctx.clone();
            let task_module = module.clone();
            let task_observer = observer.clone();
            let handle = tokio::spawn(async move {
                for wait in waits {
                    wait.await;
                }
                // Dependencies settle before the permit is requested;
                // holding a permit while waiting could deadlock a
                // single-worker pool.
                let _permit = pool.acquire_owned().await.expect("category pool closed");
                if let Some(observer) = &task_observer {
                    observer.on_module_start(&task_ctx, stage, task_module.name());
                }
                let started = Instant::now();
                let outcome = AssertUnwindSafe(task_module.execute(&task_ctx))
                    .catch_unwind()
                    .await;
                if let Some(observer) = &task_observer {
                    observer.on_module_finish(&task_ctx, stage, task_module.name());
                }
                let _ = done_tx.send(());
                match outcome {
                    Ok(Ok(())) => {
                        tracing::debug!(
                            "Module {} finished in {:.2?}",
                            task_module.name(),
                            started.elapsed()
                        );
                        None
                    }
                    Ok(Err(err)) => {
                        let err = anyhow::Error::from(err);
                        Some(ErrorRecord::new(
                            task_module.name(),
                            format!("failed to run {} module {}", stage, task_module.name()),
                            format!("{:#}", err),
                        ))
                    }
                    Err(panic) => Some(ErrorRecord::new(
                        task_module.name(),
                        format!("{} module {} panicked", stage, task_module.name()),
                        panic_message(panic),
                    )),
                }
            });
            tasks.push(handle.map(move |joined| (module, joined)));
        }

        while let Some((module, joined)) = tasks.next().await {
            let name = module.name().to_string();
            let mut findings = module.results();
            for finding in &mut findings {
                finding.set_meta("category", module.category());
            }
            ctx.append_results(findings);
            ctx.append_module_errors(&name, module.errors());
            match joined {
                Ok(Some(error)) => {
                    tracing::warn!("{}", error.message);
                    ctx.append_error(&name, error);
                }
                Ok(None) => {}
                // Join errors surface only when the runtime aborts a task;
                // panics are already caught inside.
                Err(err) => {
                    ctx.append_error(
                        &name,
                        ErrorRecord::new(
                            &name,
                            format!("failed to run {} module {}", self.stage, name),
                            err.to_string(),
                        ),
                    );
                }
            }
        }

        if let Some(observer) = &observer {
            observer.on_finish(ctx, self.stage);
        }
        tracing::info!(
            "Finished {} stage: {} result(s), {} error(s) so far",
            self.stage,
            ctx.result_count(),
            ctx.error_count()
        );
    }

    /// Final pass over this stage's modules after all stages completed.
    /// Runs in registration order; a flush failure is recorded like an
    /// execution failure.
    pub async fn flush(&self, ctx: &Arc<RunContext>) {
        let modules = ctx.registry(self.stage).lock().modules();
        for module in modules {
            if let Err(err) = module.flush(ctx).await {
                let err = anyhow::Error::from(err);
                tracing::warn!("Flush failed for {} module {}: {:#}", self.stage, module.name(), err);
                ctx.append_error(
                    module.name(),
                    ErrorRecord::new(
                        module.name(),
                        format!("failed to flush {} module {}", self.stage, module.name()),
                        format!("{:#}", err),
                    ),
                );
            }
        }
    }

    /// Reads a meta value from a named module of this performer's stage.
    /// Reliable only after the owning module's task completed.
    pub fn get_module_meta(&self, ctx: &RunContext, module: &str, name: &str) -> Option<Value> {
        let instance = ctx.registry(self.stage).lock().get(module)?;
        instance.meta(name)
    }

    pub fn set_module_meta(&self, ctx: &RunContext, module: &str, name: &str, value: Value) {
        match ctx.registry(self.stage).lock().get(module) {
            Some(instance) => instance.set_meta(name, value),
            None => tracing::debug!("No {} module {} to set meta on", self.stage, module),
        }
    }
}

/// A performer relays observer hooks to the modules registered in its own
/// stage. Only the reporting performer is wired up as an observer.
///
/// The registry guard is dropped before any hook runs; hooks are free to
/// look modules up themselves.
impl Observer for Performer {
    fn on_start(&self, ctx: &RunContext, stage: Stage) {
        let modules = ctx.registry(self.stage).lock().modules();
        for module in modules {
            module.on_start(ctx, stage);
        }
    }

    fn on_finish(&self, ctx: &RunContext, stage: Stage) {
        let modules = ctx.registry(self.stage).lock().modules();
        for module in modules {
            module.on_finish(ctx, stage);
        }
    }

    fn on_module_start(&self, ctx: &RunContext, stage: Stage, name: &str) {
        let modules = ctx.registry(self.stage).lock().modules();
        for module in modules {
            module.on_module_start(ctx, stage, name);
        }
    }

    fn on_module_finish(&self, ctx: &RunContext, stage: Stage, name: &str) {
        let modules = ctx.registry(self.stage).lock().modules();
        for module in modules {
            module.on_module_finish(ctx, stage, name);
        }
    }
}

/// All stages report to the reporting performer, including the reporting
/// stage itself. None until that performer is installed.
fn observer_for(ctx: &Arc<RunContext>) -> Option<Arc<dyn Observer>> {
    ctx.performer(Stage::Reporting)
        .map(|performer| performer as Arc<dyn Observer>)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_from_limits() {
        let mut limits = HashMap::new();
        limits.insert("dast".to_string(), 4);
        let pools = CategoryPools::new(limits);
        assert_eq!(pools.pool_for("dast").available_permits(), 4);
        // unlisted categories get the single-worker default
        assert_eq!(pools.pool_for("sast").available_permits(), 1);
        // repeated lookups return the same pool
        assert!(Arc::ptr_eq(&pools.pool_for("dast"), &pools.pool_for("dast")));
    }

    #[test]
    fn test_panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42usize)), "unknown panic");
    }
}
