use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::{ConfigTemplate, ModuleConfig};
use crate::context::RunContext;
use crate::error::{ConfigError, ExecuteError};
use crate::finding::{Finding, Severity};
use crate::module::{Module, ModuleFactory, ModuleState};

const DESCRIPTION: &str = "checks security response headers on a live target";

/// Header rows: lowercase wire name, display name, impact, severity.
const REQUIRED_HEADERS: [(&str, &str, &str, Severity); 6] = [
    (
        "strict-transport-security",
        "Strict-Transport-Security",
        "HTTPS is not enforced on returning visits",
        Severity::Medium,
    ),
    (
        "content-security-policy",
        "Content-Security-Policy",
        "script sources are unrestricted, XSS impact is unmitigated",
        Severity::Medium,
    ),
    (
        "x-frame-options",
        "X-Frame-Options",
        "the page can be framed for clickjacking",
        Severity::Medium,
    ),
    (
        "x-content-type-options",
        "X-Content-Type-Options",
        "browsers may MIME-sniff responses",
        Severity::Low,
    ),
    (
        "referrer-policy",
        "Referrer-Policy",
        "full URLs may leak through the Referer header",
        Severity::Low,
    ),
    (
        "permissions-policy",
        "Permissions-Policy",
        "no browser feature restrictions are declared",
        Severity::Low,
    ),
];

/// Flags response headers that are missing or leak implementation detail.
/// Header names are expected lowercase.
pub fn evaluate_headers(headers: &HashMap<String, String>) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (header, display, impact, severity) in REQUIRED_HEADERS {
        // feature-policy is the legacy spelling of permissions-policy
        if header == "permissions-policy" && headers.contains_key("feature-policy") {
            continue;
        }
        if !headers.contains_key(header) {
            let mut finding = Finding::new(
                format!("Missing {} header", display),
                format!("The response does not set {}; {}", display, impact),
                severity,
            );
            finding.set_meta("header", display);
            findings.push(finding);
        }
    }
    if let Some(server) = headers.get("server") {
        if server.contains('/') {
            let mut finding = Finding::new(
                "Server header leaks version",
                format!("The Server header exposes a product version: {}", server),
                Severity::Low,
            );
            finding.set_meta("header", "Server");
            findings.push(finding);
        }
    }
    if let Some(powered) = headers.get("x-powered-by") {
        let mut finding = Finding::new(
            "X-Powered-By leaks technology",
            format!("The X-Powered-By header exposes the stack: {}", powered),
            Severity::Info,
        );
        finding.set_meta("header", "X-Powered-By");
        findings.push(finding);
    }
    findings
}

pub struct HeadersFactory;

impl ModuleFactory for HeadersFactory {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn validate_config(&self, config: &Map<String, Value>) -> Result<(), ConfigError> {
        let target = config
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::missing_key("target"))?;
        url::Url::parse(target)
            .map_err(|err| ConfigError::new(format!("invalid target '{}': {}", target, err)))?;
        Ok(())
    }

    fn fill_config(&self, template: &mut ConfigTemplate) {
        template.add("target", "https://app.example.com", "base URL to request");
        template.add("timeout", 30, "request timeout in seconds");
    }

    fn create(&self, category: &str, config: ModuleConfig) -> Arc<dyn Module> {
        Arc::new(HeadersScanner {
            category: category.to_string(),
            config,
            state: ModuleState::new(),
        })
    }
}

pub struct HeadersScanner {
    category: String,
    config: ModuleConfig,
    state: ModuleState,
}

impl HeadersScanner {
    fn target(&self) -> &str {
        self.config
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn timeout(&self) -> u64 {
        self.config.get("timeout").and_then(Value::as_u64).unwrap_or(30)
    }

    async fn scan(&self) -> anyhow::Result<()> {
        let target = self.target();
        tracing::info!("Fetching {} for header inspection", target);
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(self.timeout()))
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(5))
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP client")?;
        let response = client
            .get(target)
            .send()
            .await
            .with_context(|| format!("request to {} failed", target))?;
        self.state
            .set_meta("status", Value::from(response.status().as_u16()));
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        for mut finding in evaluate_headers(&headers) {
            finding.set_meta("endpoint", target);
            self.state.record_finding(finding);
        }
        Ok(())
    }
}

#[async_trait]
impl Module for HeadersScanner {
    fn name(&self) -> &str {
        "headers"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<(), ExecuteError> {
        self.scan().await.map_err(ExecuteError::from)
    }

    fn state(&self) -> &ModuleState {
        &self.state
    }
}
