use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Non-fatal failure captured as data. Once recorded, an error is never
/// re-raised across the engine boundary; reporters render it like any other
/// run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub producer: String,
    pub message: String,
    pub details: String,
}

impl ErrorRecord {
    pub fn new(
        producer: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            producer: producer.into(),
            message: message.into(),
            details: details.into(),
        }
    }
}

/// Config validation failure. The module is excluded from the run; the run
/// itself continues.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn missing_key(key: &str) -> Self {
        Self(format!("required config key '{}' is missing", key))
    }
}

/// Failure raised from Module::prepare. The module stays registered.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct PrepareError(#[from] anyhow::Error);

impl PrepareError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(anyhow::Error::msg(message.to_string()))
    }
}

/// Failure raised from Module::execute. Converted into an ErrorRecord by the
/// engine; partial results produced before the failure are still collected.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ExecuteError(#[from] anyhow::Error);

impl ExecuteError {
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(anyhow::Error::msg(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::missing_key("target");
        assert_eq!(err.to_string(), "required config key 'target' is missing");
    }

    #[test]
    fn test_execute_error_keeps_cause_chain() {
        let cause = anyhow::anyhow!("connection refused").context("fetching target");
        let err = ExecuteError::from(cause);
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert!(rendered.contains("fetching target"));
        assert!(rendered.contains("connection refused"));
    }
}
