use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::writer::WriterConfig;

pub const DEBOUNCE_ENV: &str = "INTAKE_DEBOUNCE_MS";
pub const RETRY_DELAY_ENV: &str = "INTAKE_RETRY_DELAY_MS";
pub const COMPLETION_WARNING_ENV: &str = "INTAKE_COMPLETION_WARNING";
pub const SUBMIT_TIMEOUT_ENV: &str = "INTAKE_SUBMIT_TIMEOUT_MS";

/// Runtime tuning for an intake session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub debounce_ms: u64,
    pub retry_delay_ms: u64,
    /// Document completion ratio below which the flow should warn before
    /// letting the applicant continue.
    pub completion_warning_threshold: f64,
    pub submit_timeout_ms: Option<u64>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 400,
            retry_delay_ms: 2000,
            completion_warning_threshold: 0.8,
            submit_timeout_ms: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a whole number of milliseconds, got '{value}'")]
    InvalidMillis { key: &'static str, value: String },
    #[error("{key} must be a ratio between 0 and 1, got '{value}'")]
    InvalidRatio { key: &'static str, value: String },
}

impl IntakeConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(DEBOUNCE_ENV) {
            config.debounce_ms = parse_millis(DEBOUNCE_ENV, &value)?;
        }
        if let Some(value) = lookup(RETRY_DELAY_ENV) {
            config.retry_delay_ms = parse_millis(RETRY_DELAY_ENV, &value)?;
        }
        if let Some(value) = lookup(COMPLETION_WARNING_ENV) {
            let ratio = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|ratio| (0.0..=1.0).contains(ratio))
                .ok_or_else(|| ConfigError::InvalidRatio {
                    key: COMPLETION_WARNING_ENV,
                    value: value.clone(),
                })?;
            config.completion_warning_threshold = ratio;
        }
        if let Some(value) = lookup(SUBMIT_TIMEOUT_ENV) {
            config.submit_timeout_ms = Some(parse_millis(SUBMIT_TIMEOUT_ENV, &value)?);
        }
        Ok(config)
    }

    pub fn writer(&self) -> WriterConfig {
        WriterConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidMillis {
            key,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = IntakeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, IntakeConfig::default());
        assert_eq!(config.writer().debounce, Duration::from_millis(400));
        assert!(config.submit_timeout().is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = IntakeConfig::from_lookup(lookup(&[
            (DEBOUNCE_ENV, "50"),
            (COMPLETION_WARNING_ENV, "0.5"),
            (SUBMIT_TIMEOUT_ENV, " 1500 "),
        ]))
        .unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.retry_delay_ms, 2000);
        assert_eq!(config.completion_warning_threshold, 0.5);
        assert_eq!(config.submit_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            IntakeConfig::from_lookup(lookup(&[(DEBOUNCE_ENV, "soon")])),
            Err(ConfigError::InvalidMillis { .. })
        ));
        assert!(matches!(
            IntakeConfig::from_lookup(lookup(&[(COMPLETION_WARNING_ENV, "1.5")])),
            Err(ConfigError::InvalidRatio { .. })
        ));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: IntakeConfig =
            serde_json::from_str(r#"{ "completion_warning_threshold": 0.9 }"#).unwrap();
        assert_eq!(config.completion_warning_threshold, 0.9);
        assert_eq!(config.debounce_ms, 400);
    }
}
