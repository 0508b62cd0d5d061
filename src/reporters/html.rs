use std::fs;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use html_escape::encode_text;
use serde_json::{Map, Value};

use crate::config::{ConfigTemplate, ModuleConfig};
use crate::context::RunContext;
use crate::error::{ConfigError, ExecuteError};
use crate::finding::Severity;
use crate::module::{Module, ModuleFactory, ModuleState};

const DESCRIPTION: &str = "writes an HTML report file";

const SEVERITY_ORDER: [Severity; 5] = [
    Severity::Critical,
    Severity::High,
    Severity::Medium,
    Severity::Low,
    Severity::Info,
];

pub struct HtmlFactory;

impl ModuleFactory for HtmlFactory {
    fn name(&self) -> &'static str {
        "html"
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
        template.add("file", "/path/to/report.html", "output file path");
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        Arc::new(HtmlReporter {
            category: category.to_string(),
            config,
            state: ModuleState::new(),
        })
    }
}

/// Renders the aggregated findings and errors into a standalone HTML page.
/// Publishes the written path as meta `report_file` for downstream
/// reporters.
pub struct HtmlReporter {
    category: String,
    config: ModuleConfig,
    state: ModuleState,
}

impl HtmlReporter {
    fn file(&self) -> &str {
        self.config
            .get("file")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn severity_class(severity: Severity) -> &'static str {
        match severity {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    fn render(&self, ctx: &RunContext) -> String {
        let project = ctx
            .get_meta("project_name")
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| ctx.suite.clone());
        let mut findings = ctx.results();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));
        let errors = ctx.errors();

        let mut page = String::new();
        page.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        page.push_str(&format!("<title>{} scan report</title>\n", encode_text(&project)));
        page.push_str("<style>\n");
        page.push_str("body { font-family: sans-serif; margin: 2em; }\n");
        page.push_str("table { border-collapse: collapse; width: 100%; }\n");
        page.push_str("td, th { border: 1px solid #ccc; padding: 4px 8px; text-align: left; }\n");
        page.push_str(".critical { color: #b71c1c; font-weight: bold; }\n");
        page.push_str(".high { color: #e65100; font-weight: bold; }\n");
        page.push_str(".medium { color: #f9a825; }\n");
        page.push_str(".low { color: #1565c0; }\n");
        page.push_str(".info { color: #616161; }\n");
        page.push_str("</style>\n</head>\n<body>\n");
        page.push_str(&format!("<h1>{} scan report</h1>\n", encode_text(&project)));

        page.push_str("<h2>Summary</h2>\n<table>\n<tr>");
        for severity in SEVERITY_ORDER {
            page.push_str(&format!("<th>{}</th>", severity.label()));
        }
        page.push_str("</tr>\n<tr>");
        for severity in SEVERITY_ORDER {
            let count = findings.iter().filter(|f| f.severity == severity).count();
            page.push_str(&format!("<td>{}</td>", count));
        }
        page.push_str("</tr>\n</table>\n");

        page.push_str("<h2>Findings</h2>\n");
        if findings.is_empty() {
            page.push_str("<p>No findings.</p>\n");
        } else {
            page.push_str("<table>\n<tr><th>Severity</th><th>Category</th><th>Title</th><th>Description</th></tr>\n");
            for finding in &findings {
                let category = finding
                    .get_meta("category")
                    .and_then(Value::as_str)
                    .unwrap_or("-");
                page.push_str(&format!(
                    "<tr><td class=\"{}\">{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    Self::severity_class(finding.severity),
                    finding.severity.label(),
                    encode_text(category),
                    encode_text(&finding.title),
                    encode_text(&finding.description),
                ));
            }
            page.push_str("</table>\n");
        }

        page.push_str("<h2>Errors</h2>\n");
        if errors.is_empty() {
            page.push_str("<p>No errors.</p>\n");
        } else {
            page.push_str("<table>\n<tr><th>Producer</th><th>Message</th><th>Details</th></tr>\n");
            for (producer, records) in &errors {
                for record in records {
                    page.push_str(&format!(
                        "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                        encode_text(producer),
                        encode_text(&record.message),
                        encode_text(&record.details),
                    ));
                }
            }
            page.push_str("</table>\n");
        }

        page.push_str("</body>\n</html>\n");
        page
    }

    fn report(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let file = self.file();
        let page = self.render(ctx);
        fs::write(file, page).with_context(|| format!("failed to write HTML report {}", file))?;
        tracing::info!("Wrote HTML report to {}", file);
        self.state.set_meta("report_file", Value::from(file));
        Ok(())
    }
}

#[async_trait]
impl Module for HtmlReporter {
    fn name(&self) -> &str {
        "html"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn execute(&self, ctx: &RunContext) -> Result<(), ExecuteError> {
        self.report(ctx).map_err(ExecuteError::from)
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}
