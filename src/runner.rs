use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use crate::cli::{Cli, Commands};
use crate::config;
use crate::context::{RunContext, Stage};
use crate::finding::Severity;
use crate::performer::Performer;
use crate::registry::FactoryRegistry;

pub async fn run_from_cli(cli: Cli) -> anyhow::Result<()> {
    // Configure logging based on global flags.
    // Keep external crates (reqwest/hyper) at INFO to avoid flooding the CLI.
    use tracing_subscriber::EnvFilter;
    let crate_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter_str = format!(
        "scanflow={level},reqwest=info,hyper=info,h2=info",
        level = crate_level
    );
    let env_filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new(crate_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            suite,
            config_file,
            config_variable,
            list_suites,
        } => execute_run(&config_variable, &config_file, suite.as_deref(), list_suites).await,
        Commands::SampleConfig { json, out } => write_sample_config(json, out),
    }
}

fn write_sample_config(json: bool, out: Option<String>) -> anyhow::Result<()> {
    let factories = FactoryRegistry::builtin();
    let body = if json {
        serde_json::to_string_pretty(&config::sample_tree(&factories))?
    } else {
        config::render_annotated(&factories)
    };
    match out {
        Some(path) => {
            std::fs::write(&path, &body)
                .with_context(|| format!("failed to write sample config {}", path))?;
            println!("[=] Sample config written to: {}", path);
        }
        None => println!("{}", body),
    }
    Ok(())
}

/// Runs one suite end to end: config load, performer validation, module
/// preparation, the three stages in order and the final reporting flush.
///
/// Module failures of any kind are collected as Error records on the run
/// context; the only errors surfaced here are config-level ones (unreadable
/// config, unknown suite, missing stage section).
pub async fn execute_run(
    config_variable: &str,
    config_file: &str,
    suite: Option<&str>,
    list_suites: bool,
) -> anyhow::Result<()> {
    if list_suites {
        let suites = config::list_suites(config_variable, config_file)?;
        tracing::info!("Available suites: {}", suites.join(", "));
        println!("[*] Available suites: {}", suites.join(", "));
        return Ok(());
    }
    let suite = suite.ok_or_else(|| {
        anyhow::anyhow!("no suite selected (use --suite, or --list-suites to see what is defined)")
    })?;

    let suite_config = config::load_suite(config_variable, config_file, suite)?;
    tracing::info!("Starting run for suite {}", suite);
    println!("[>] Suite: {}", suite);
    if let Some(project) = &suite_config.general.settings.project_name {
        println!("[>] Project: {}", project);
    }
    println!("\n{}\n", "-".repeat(60));

    let ctx = Arc::new(RunContext::new(suite, suite_config));
    let factories = Arc::new(FactoryRegistry::builtin());
    for stage in Stage::ALL {
        ctx.set_performer(stage, Arc::new(Performer::new(stage, factories.clone())));
    }

    // A stage section missing from the suite is the one fatal config error;
    // everything after this point degrades into Error records instead.
    for stage in Stage::ALL {
        if let Some(performer) = ctx.performer(stage) {
            performer.validate_config(&ctx)?;
        }
    }

    fill_run_meta(&ctx);

    for stage in Stage::ALL {
        if let Some(performer) = ctx.performer(stage) {
            performer.prepare(&ctx);
        }
    }

    for stage in Stage::ALL {
        if let Some(performer) = ctx.performer(stage) {
            performer.perform(&ctx).await;
        }
    }

    if let Some(performer) = ctx.performer(Stage::Reporting) {
        performer.flush(&ctx).await;
    }

    print_summary(&ctx);
    Ok(())
}

/// Seeds run-level meta that reporters may reference: project name, tool
/// version, the scan categories in play and per-category defaults such as
/// a dast target URL or a sast code path.
fn fill_run_meta(ctx: &RunContext) {
    if let Some(project) = &ctx.config.general.settings.project_name {
        ctx.set_meta("project_name", Value::from(project.clone()));
    }
    ctx.set_meta("scanflow_version", Value::from(env!("CARGO_PKG_VERSION")));

    let categories: Vec<Value> = ctx
        .config
        .stage_section(Stage::Scanning)
        .map(|section| {
            section
                .iter()
                .filter(|(_, modules)| !modules.is_empty())
                .map(|(category, _)| Value::from(category.clone()))
                .collect()
        })
        .unwrap_or_default();
    ctx.set_meta("scan_categories", Value::Array(categories));

    for (category, defaults) in &ctx.config.general.scanning {
        for key in ["target", "code"] {
            if let Some(value) = defaults.get(key) {
                ctx.set_meta(&format!("{}_{}", category, key), value.clone());
            }
        }
    }
}

fn print_summary(ctx: &RunContext) {
    let results = ctx.results();
    let errors = ctx.errors();
    let error_count: usize = errors.values().map(Vec::len).sum();

    let mut severity_counts: BTreeMap<Severity, usize> = BTreeMap::new();
    for finding in &results {
        *severity_counts.entry(finding.severity).or_insert(0) += 1;
    }

    println!("\n{}", "=".repeat(60));
    println!("              RUN COMPLETE");
    println!("{}", "=".repeat(60));
    println!("\n[*] Summary:");
    println!("   Suite: {}", ctx.suite);
    println!("   Findings: {}", results.len());
    for (severity, count) in severity_counts.iter().rev() {
        println!("   {} {}: {}", severity.emoji(), severity.label(), count);
    }
    if severity_counts.is_empty() {
        println!("   [OK] No findings");
    }
    if error_count > 0 {
        println!("\n[!] Errors: {}", error_count);
        for (producer, records) in &errors {
            println!("    [-] {}: {} error(s)", producer, records.len());
        }
    }
    println!();
}
