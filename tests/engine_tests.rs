use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use scanflow::config::{ModuleConfig, SuiteConfig};
use scanflow::context::{RunContext, Stage};
use scanflow::dependency;
use scanflow::error::{ConfigError, ExecuteError, PrepareError};
use scanflow::finding::{Finding, Severity};
use scanflow::module::{Module, ModuleFactory, ModuleState};
use scanflow::performer::{Performer, StageScheduler};
use scanflow::registry::FactoryRegistry;

/// Shared event log; tests assert on relative positions, never wall time.
#[derive(Default)]
struct Board(Mutex<Vec<String>>);

impl Board {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }
}

/// Tracks how many module bodies run at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct Behavior {
    hard: Vec<String>,
    soft: Vec<String>,
    sleep_ms: u64,
    fail: bool,
    panics: bool,
    prepare_fail: bool,
    schedules: Vec<(String, String, ModuleConfig)>,
    barrier: Option<Arc<tokio::sync::Barrier>>,
}

struct Probe {
    name: String,
    category: String,
    behavior: Behavior,
    board: Arc<Board>,
    gauge: Arc<Gauge>,
    state: ModuleState,
}

#[async_trait]
impl Module for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test probe"
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn depends_on(&self) -> Vec<String> {
        self.behavior.hard.clone()
    }

    fn run_after(&self) -> Vec<String> {
        self.behavior.soft.clone()
    }

    fn prepare(&self, scheduler: &StageScheduler<'_>) -> Result<(), PrepareError> {
        for (category, name, overrides) in &self.behavior.schedules {
            scheduler.schedule(category, name, overrides.clone());
        }
        if self.behavior.prepare_fail {
            return Err(anyhow::anyhow!("prepare exploded").into());
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        self.gauge.enter();
        self.board.push(format!("start:{}", self.name));
        if self.behavior.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.behavior.sleep_ms)).await;
        }
        if let Some(barrier) = &self.behavior.barrier {
            barrier.wait().await;
        }
        self.state.record_finding(Finding::new(
            format!("finding from {}", self.name),
            "test",
            Severity::Low,
        ));
        self.board.push(format!("end:{}", self.name));
        self.gauge.exit();
        if self.behavior.panics {
            panic!("{} blew up", self.name);
        }
        if self.behavior.fail {
            return Err(anyhow::anyhow!("{} failed on purpose", self.name).into());
        }
        Ok(())
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}

struct ProbeFactory {
    name: &'static str,
    behavior: Behavior,
    board: Arc<Board>,
    gauge: Arc<Gauge>,
    require_key: Option<&'static str>,
    created: Mutex<Vec<ModuleConfig>>,
}

impl ModuleFactory for ProbeFactory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "test probe"
    }

    fn validate_config(&self, config: &Map<String, Value>) -> Result<(), ConfigError> {
        match self.require_key {
            Some(key) if !config.contains_key(key) => Err(ConfigError::missing_key(key)),
            _ => Ok(()),
        }
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        self.created.lock().push(config);
        Arc::new(Probe {
            name: self.name.to_string(),
            category: category.to_string(),
            behavior: self.behavior.clone(),
            board: self.board.clone(),
            gauge: self.gauge.clone(),
            state: ModuleState::new(),
        })
    }
}

fn probe_in(
    factories: &mut FactoryRegistry,
    board: &Arc<Board>,
    gauge: &Arc<Gauge>,
    category: &str,
    name: &'static str,
    behavior: Behavior,
) -> Arc<ProbeFactory> {
    let factory = Arc::new(ProbeFactory {
        name,
        behavior,
        board: board.clone(),
        gauge: gauge.clone(),
        require_key: None,
        created: Mutex::new(Vec::new()),
    });
    factories.register(Stage::Scanning, category, factory.clone());
    factory
}

fn probe(
    factories: &mut FactoryRegistry,
    board: &Arc<Board>,
    gauge: &Arc<Gauge>,
    name: &'static str,
    behavior: Behavior,
) -> Arc<ProbeFactory> {
    probe_in(factories, board, gauge, "dast", name, behavior)
}

fn context(config: Value) -> Arc<RunContext> {
    let suite: SuiteConfig = serde_json::from_value(config).unwrap();
    Arc::new(RunContext::new("test", suite))
}

fn scanning_performer(factories: FactoryRegistry, ctx: &Arc<RunContext>) -> Arc<Performer> {
    let performer = Arc::new(Performer::new(Stage::Scanning, Arc::new(factories)));
    ctx.set_performer(Stage::Scanning, performer.clone());
    performer
}

/// Suite config listing `modules` under scanning/dast with a worker limit.
fn scanning_suite(limit: usize, modules: &[&str]) -> Value {
    let mut section = Map::new();
    for name in modules {
        section.insert(name.to_string(), json!({}));
    }
    json!({
        "general": {
            "settings": { "max_concurrent_modules": { "scanning": { "dast": limit } } }
        },
        "scanning": { "dast": section }
    })
}

#[tokio::test]
async fn independent_modules_both_collected() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(&mut factories, &board, &gauge, "a", Behavior::default());
    probe(&mut factories, &board, &gauge, "b", Behavior::default());

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    // completion order of independent modules is unconstrained
    let results = ctx.results();
    assert_eq!(results.len(), 2);
    assert!(results.iter().any(|f| f.title == "finding from a"));
    assert!(results.iter().any(|f| f.title == "finding from b"));
    for finding in &results {
        assert_eq!(finding.get_meta("category"), Some(&json!("dast")));
    }
    assert!(ctx.errors().is_empty());
}

#[tokio::test]
async fn dependent_starts_after_dependency_completes() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            sleep_ms: 25,
            ..Behavior::default()
        },
    );
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            hard: vec!["a".to_string()],
            ..Behavior::default()
        },
    );

    // two workers, so only the dependency wait can order these
    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    assert!(board.position("end:a").unwrap() < board.position("start:b").unwrap());
    assert_eq!(ctx.results().len(), 2);
}

#[tokio::test]
async fn dependency_is_waited_out_before_taking_a_worker_slot() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            sleep_ms: 25,
            ..Behavior::default()
        },
    );
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            hard: vec!["a".to_string()],
            ..Behavior::default()
        },
    );

    // one worker: a deadlock here would mean the slot was taken before
    // the dependency wait
    let ctx = context(scanning_suite(1, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    tokio::time::timeout(Duration::from_secs(5), performer.perform(&ctx))
        .await
        .expect("stage hung");

    assert!(board.position("end:a").unwrap() < board.position("start:b").unwrap());
    assert_eq!(ctx.results().len(), 2);
}

#[tokio::test]
async fn dependency_failure_does_not_block_dependent() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            sleep_ms: 25,
            fail: true,
            ..Behavior::default()
        },
    );
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            hard: vec!["a".to_string()],
            ..Behavior::default()
        },
    );

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    // the failed dependency reached a terminal state, which is all b waits for
    assert!(board.position("end:a").unwrap() < board.position("start:b").unwrap());
    assert_eq!(ctx.results().len(), 2);
    let errors = ctx.errors();
    assert_eq!(errors.get("a").map(Vec::len), Some(1));
    assert!(errors.get("b").is_none());
}

#[tokio::test]
async fn missing_hard_dependency_is_dropped() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(&mut factories, &board, &gauge, "a", Behavior::default());
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            hard: vec!["ghost".to_string()],
            ..Behavior::default()
        },
    );

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);

    let resolution = dependency::resolve(&ctx.registry(Stage::Scanning).lock());
    assert_eq!(resolution.missing_for("b"), ["ghost".to_string()]);
    assert!(resolution.resolved_for("b").is_empty());

    performer.perform(&ctx).await;

    // b executes normally and no error is recorded for the absent name
    assert_eq!(ctx.results().len(), 2);
    assert!(ctx.errors().is_empty());
}

#[tokio::test]
async fn failing_module_is_isolated() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            fail: true,
            ..Behavior::default()
        },
    );
    probe(&mut factories, &board, &gauge, "b", Behavior::default());

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    // partial results produced before the failure are still collected
    assert_eq!(ctx.results().len(), 2);
    let errors = ctx.errors();
    let records = errors.get("a").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].producer, "a");
    assert_eq!(records[0].message, "failed to run scanning module a");
    assert!(records[0].details.contains("a failed on purpose"));
}

#[tokio::test]
async fn panicking_module_becomes_error_record() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            panics: true,
            ..Behavior::default()
        },
    );
    probe(&mut factories, &board, &gauge, "b", Behavior::default());

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    assert_eq!(ctx.results().len(), 2);
    let errors = ctx.errors();
    let records = errors.get("a").unwrap();
    assert_eq!(records[0].message, "scanning module a panicked");
    assert_eq!(records[0].details, "a blew up");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_pool_serializes_category() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    for name in ["a", "b", "c"] {
        probe(
            &mut factories,
            &board,
            &gauge,
            name,
            Behavior {
                sleep_ms: 15,
                ..Behavior::default()
            },
        );
    }

    let ctx = context(scanning_suite(1, &["a", "b", "c"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    assert_eq!(gauge.peak(), 1);
    assert_eq!(ctx.results().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_limit_allows_parallel_execution() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let barrier = Arc::new(tokio::sync::Barrier::new(3));
    let mut factories = FactoryRegistry::new();
    for name in ["a", "b", "c"] {
        probe(
            &mut factories,
            &board,
            &gauge,
            name,
            Behavior {
                barrier: Some(barrier.clone()),
                ..Behavior::default()
            },
        );
    }

    // all three must be inside execute() at once to pass the barrier
    let ctx = context(scanning_suite(3, &["a", "b", "c"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    tokio::time::timeout(Duration::from_secs(5), performer.perform(&ctx))
        .await
        .expect("stage hung");

    assert_eq!(gauge.peak(), 3);
    assert_eq!(ctx.results().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_category_limits_are_independent() {
    let board = Arc::new(Board::default());
    let dast_gauge = Arc::new(Gauge::default());
    let sast_gauge = Arc::new(Gauge::default());
    let barrier = Arc::new(tokio::sync::Barrier::new(3));
    let mut factories = FactoryRegistry::new();
    for name in ["a", "b", "c"] {
        probe_in(
            &mut factories,
            &board,
            &dast_gauge,
            "dast",
            name,
            Behavior {
                sleep_ms: 10,
                ..Behavior::default()
            },
        );
    }
    for name in ["x", "y", "z"] {
        probe_in(
            &mut factories,
            &board,
            &sast_gauge,
            "sast",
            name,
            Behavior {
                barrier: Some(barrier.clone()),
                ..Behavior::default()
            },
        );
    }

    let ctx = context(json!({
        "general": {
            "settings": {
                "max_concurrent_modules": { "scanning": { "dast": 1, "sast": 3 } }
            }
        },
        "scanning": {
            "dast": { "a": {}, "b": {}, "c": {} },
            "sast": { "x": {}, "y": {}, "z": {} }
        }
    }));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    // the sast barrier needs all three of its modules in flight at once,
    // which a pool shared across categories could never satisfy
    tokio::time::timeout(Duration::from_secs(5), performer.perform(&ctx))
        .await
        .expect("stage hung");

    assert_eq!(dast_gauge.peak(), 1);
    assert_eq!(sast_gauge.peak(), 3);
    assert_eq!(ctx.results().len(), 6);
}

#[tokio::test]
async fn soft_dependency_orders_but_never_blocks() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            sleep_ms: 25,
            ..Behavior::default()
        },
    );
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            soft: vec!["a".to_string()],
            ..Behavior::default()
        },
    );
    probe(
        &mut factories,
        &board,
        &gauge,
        "c",
        Behavior {
            soft: vec!["ghost".to_string()],
            ..Behavior::default()
        },
    );

    let ctx = context(scanning_suite(3, &["a", "b", "c"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    assert!(board.position("end:a").unwrap() < board.position("start:b").unwrap());
    assert_eq!(ctx.results().len(), 3);
    assert!(ctx.errors().is_empty());
}

#[tokio::test]
async fn duplicate_registration_is_a_noop() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(&mut factories, &board, &gauge, "a", Behavior::default());
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            schedules: vec![("dast".to_string(), "a".to_string(), ModuleConfig::new())],
            ..Behavior::default()
        },
    );

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);

    assert_eq!(ctx.registry(Stage::Scanning).lock().names(), ["a", "b"]);

    performer.perform(&ctx).await;
    assert_eq!(board.count("start:a"), 1);
    assert_eq!(ctx.results().len(), 2);
    assert!(ctx.errors().is_empty());
}

#[tokio::test]
async fn dynamically_scheduled_modules_run() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            schedules: vec![("dast".to_string(), "b".to_string(), ModuleConfig::new())],
            ..Behavior::default()
        },
    );
    probe(
        &mut factories,
        &board,
        &gauge,
        "b",
        Behavior {
            schedules: vec![("dast".to_string(), "c".to_string(), ModuleConfig::new())],
            ..Behavior::default()
        },
    );
    probe(&mut factories, &board, &gauge, "c", Behavior::default());

    // only "a" appears in the config; b and c arrive during preparation
    let ctx = context(scanning_suite(2, &["a"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);

    assert_eq!(ctx.registry(Stage::Scanning).lock().names(), ["a", "b", "c"]);

    performer.perform(&ctx).await;
    assert_eq!(ctx.results().len(), 3);
    assert!(ctx.errors().is_empty());
}

#[tokio::test]
async fn config_merge_precedence_at_create_time() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    let overrides = json!({"y": "dynamic"}).as_object().unwrap().clone();
    let factory_a = probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            schedules: vec![("dast".to_string(), "c".to_string(), overrides)],
            ..Behavior::default()
        },
    );
    let factory_c = probe(&mut factories, &board, &gauge, "c", Behavior::default());

    let ctx = context(json!({
        "general": {
            "scanning": { "dast": { "x": "general", "y": "general" } }
        },
        "scanning": { "dast": { "a": { "y": "instance" } } }
    }));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);

    let created_a = factory_a.created.lock();
    assert_eq!(created_a[0].get("x"), Some(&json!("general")));
    assert_eq!(created_a[0].get("y"), Some(&json!("instance")));

    let created_c = factory_c.created.lock();
    assert_eq!(created_c[0].get("x"), Some(&json!("general")));
    assert_eq!(created_c[0].get("y"), Some(&json!("dynamic")));
}

#[tokio::test]
async fn validation_failure_excludes_module() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    let factory = Arc::new(ProbeFactory {
        name: "a",
        behavior: Behavior::default(),
        board: board.clone(),
        gauge: gauge.clone(),
        require_key: Some("target"),
        created: Mutex::new(Vec::new()),
    });
    factories.register(Stage::Scanning, "dast", factory);

    let ctx = context(scanning_suite(1, &["a"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);

    assert!(!ctx.registry(Stage::Scanning).lock().contains("a"));
    let errors = ctx.errors();
    let records = errors.get("a").unwrap();
    assert_eq!(records[0].message, "invalid config for scanning module a");
    assert!(records[0].details.contains("required config key 'target'"));

    performer.perform(&ctx).await;
    assert_eq!(ctx.results().len(), 0);
}

#[tokio::test]
async fn prepare_failure_keeps_module_registered() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            prepare_fail: true,
            ..Behavior::default()
        },
    );

    let ctx = context(scanning_suite(1, &["a"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);

    let errors = ctx.errors();
    let records = errors.get("a").unwrap();
    assert_eq!(records[0].message, "failed to prepare scanning module a");
    assert!(ctx.registry(Stage::Scanning).lock().contains("a"));

    // the module is still submitted and runs
    performer.perform(&ctx).await;
    assert_eq!(ctx.results().len(), 1);
}

#[tokio::test]
async fn scheduling_unknown_module_records_error() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(&mut factories, &board, &gauge, "a", Behavior::default());

    let ctx = context(scanning_suite(1, &["a", "ghost"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    assert_eq!(ctx.results().len(), 1);
    let errors = ctx.errors();
    let records = errors.get("ghost").unwrap();
    assert_eq!(records[0].message, "failed to schedule scanning module ghost");
    assert_eq!(records[0].details, "no module 'ghost' in category 'dast'");
}

#[tokio::test]
async fn missing_stage_section_is_fatal() {
    let factories = FactoryRegistry::new();
    let ctx = context(json!({ "processing": {}, "reporting": {} }));
    let performer = scanning_performer(factories, &ctx);

    let err = performer.validate_config(&ctx).unwrap_err();
    assert!(err.to_string().contains("no scanning configuration present"));

    // present but empty is fine
    let ctx = context(json!({ "scanning": {} }));
    let performer = scanning_performer(FactoryRegistry::new(), &ctx);
    assert!(performer.validate_config(&ctx).is_ok());
}

/// Relays observer hooks into the shared board.
struct Recorder {
    board: Arc<Board>,
    seen_at_finish: AtomicUsize,
    state: ModuleState,
}

#[async_trait]
impl Module for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn description(&self) -> &str {
        "records observer hooks"
    }

    fn category(&self) -> &str {
        "live"
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        Ok(())
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }

    fn on_start(&self, _ctx: &RunContext, stage: Stage) {
        self.board.push(format!("on_start:{}", stage));
    }

    fn on_finish(&self, ctx: &RunContext, stage: Stage) {
        self.seen_at_finish.store(ctx.result_count(), Ordering::SeqCst);
        self.board.push(format!("on_finish:{}", stage));
    }

    fn on_module_start(&self, _ctx: &RunContext, stage: Stage, name: &str) {
        self.board.push(format!("module_start:{}:{}", stage, name));
    }

    fn on_module_finish(&self, _ctx: &RunContext, stage: Stage, name: &str) {
        self.board.push(format!("module_finish:{}:{}", stage, name));
    }
}

fn install_recorder(ctx: &Arc<RunContext>, board: &Arc<Board>) -> Arc<Recorder> {
    let recorder = Arc::new(Recorder {
        board: board.clone(),
        seen_at_finish: AtomicUsize::new(0),
        state: ModuleState::new(),
    });
    ctx.registry(Stage::Reporting).lock().insert(recorder.clone());
    let reporting = Arc::new(Performer::new(
        Stage::Reporting,
        Arc::new(FactoryRegistry::new()),
    ));
    ctx.set_performer(Stage::Reporting, reporting);
    recorder
}

#[tokio::test]
async fn observer_hooks_fire_once_in_order_even_on_failure() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(
        &mut factories,
        &board,
        &gauge,
        "a",
        Behavior {
            fail: true,
            ..Behavior::default()
        },
    );

    let ctx = context(scanning_suite(1, &["a"]));
    install_recorder(&ctx, &board);
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    for event in [
        "on_start:scanning",
        "module_start:scanning:a",
        "module_finish:scanning:a",
        "on_finish:scanning",
    ] {
        assert_eq!(board.count(event), 1, "missing or repeated {}", event);
    }
    let on_start = board.position("on_start:scanning").unwrap();
    let module_start = board.position("module_start:scanning:a").unwrap();
    let body_start = board.position("start:a").unwrap();
    let body_end = board.position("end:a").unwrap();
    let module_finish = board.position("module_finish:scanning:a").unwrap();
    let on_finish = board.position("on_finish:scanning").unwrap();
    assert!(on_start < module_start);
    assert!(module_start < body_start);
    assert!(body_start < body_end);
    assert!(body_end < module_finish);
    assert!(module_finish < on_finish);
}

#[tokio::test]
async fn stage_finish_hook_sees_collected_results() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(&mut factories, &board, &gauge, "a", Behavior::default());
    probe(&mut factories, &board, &gauge, "b", Behavior::default());

    let ctx = context(scanning_suite(2, &["a", "b"]));
    let recorder = install_recorder(&ctx, &board);
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    assert_eq!(recorder.seen_at_finish.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn module_meta_readable_through_performer() {
    let board = Arc::new(Board::default());
    let gauge = Arc::new(Gauge::default());
    let mut factories = FactoryRegistry::new();
    probe(&mut factories, &board, &gauge, "a", Behavior::default());

    let ctx = context(scanning_suite(1, &["a"]));
    let performer = scanning_performer(factories, &ctx);
    performer.prepare(&ctx);
    performer.perform(&ctx).await;

    performer.set_module_meta(&ctx, "a", "visited", json!(true));
    assert_eq!(performer.get_module_meta(&ctx, "a", "visited"), Some(json!(true)));
    assert_eq!(performer.get_module_meta(&ctx, "ghost", "visited"), None);
}
