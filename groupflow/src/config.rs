//! Orchestrator configuration
//!
//! Defaults match the parallel execution mode: four implementation groups
//! and two research groups in flight, five investigation iterations with one
//! restart. Values can be overridden from the environment or a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::review::ChangeRouting;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Admission caps per work category. The two pools never share slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyPolicy {
    pub max_implementation: usize,
    pub max_research: usize,
}

impl ConcurrencyPolicy {
    /// Parallel mode: 4 implementation, 2 research
    pub fn parallel() -> Self {
        Self {
            max_implementation: 4,
            max_research: 2,
        }
    }

    /// Simple mode: one group of each category at a time
    pub fn sequential() -> Self {
        Self {
            max_implementation: 1,
            max_research: 1,
        }
    }
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self::parallel()
    }
}

/// Bounds on the investigation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationPolicy {
    /// Investigator iterations before the loop exits as exhausted
    pub max_iterations: u32,
    /// Times a reviewer may restart an exhausted investigation
    pub max_restarts: u32,
    /// Investigations a group may open over its lifetime
    pub max_per_group: u32,
}

impl Default for InvestigationPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_restarts: 1,
            max_per_group: 3,
        }
    }
}

/// Behaviour when the store or the invoker is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraPolicy {
    /// Pause before retrying a tick that failed closed
    pub retry_delay_ms: u64,
    /// Consecutive failed ticks before the driver gives up
    pub max_consecutive_failures: u32,
}

impl InfraPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for InfraPolicy {
    fn default() -> Self {
        Self {
            retry_delay_ms: 250,
            max_consecutive_failures: 20,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub concurrency: ConcurrencyPolicy,
    pub investigation: InvestigationPolicy,
    /// Where CHANGES_REQUESTED is routed
    pub change_routing: ChangeRouting,
    pub infra: InfraPolicy,
}

impl OrchestratorConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Sequential preset (simple mode)
    pub fn sequential() -> Self {
        Self {
            concurrency: ConcurrencyPolicy::sequential(),
            ..Self::default()
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("GROUPFLOW_MAX_IMPLEMENTATION")? {
            self.concurrency.max_implementation = v;
        }
        if let Some(v) = env_parse("GROUPFLOW_MAX_RESEARCH")? {
            self.concurrency.max_research = v;
        }
        if let Some(v) = env_parse("GROUPFLOW_MAX_INVESTIGATION_ITERATIONS")? {
            self.investigation.max_iterations = v;
        }
        if let Some(v) = env_parse("GROUPFLOW_INFRA_RETRY_DELAY_MS")? {
            self.infra.retry_delay_ms = v;
        }
        if let Ok(raw) = std::env::var("GROUPFLOW_CHANGE_ROUTING") {
            self.change_routing = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "GROUPFLOW_CHANGE_ROUTING".into(),
                value: raw.clone(),
            })?;
        }
        self.validate()
    }

    /// Reject configurations that would stall or never terminate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.max_implementation == 0 || self.concurrency.max_research == 0 {
            return Err(ConfigError::Invalid(
                "admission caps must be at least 1".into(),
            ));
        }
        if self.investigation.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "investigation.max_iterations must be at least 1".into(),
            ));
        }
        if self.infra.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "infra.max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_parallel_mode() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.concurrency.max_implementation, 4);
        assert_eq!(config.concurrency.max_research, 2);
        assert_eq!(config.investigation.max_iterations, 5);
        assert_eq!(config.investigation.max_restarts, 1);
        assert_eq!(config.change_routing, ChangeRouting::ByDefectKind);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sequential_preset_only_changes_caps() {
        let config = OrchestratorConfig::sequential();
        assert_eq!(config.concurrency, ConcurrencyPolicy::sequential());
        assert_eq!(config.investigation, InvestigationPolicy::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            change_routing = "always_implementer"

            [concurrency]
            max_research = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.concurrency.max_implementation, 4);
        assert_eq!(config.concurrency.max_research, 1);
        assert_eq!(config.change_routing, ChangeRouting::AlwaysImplementer);
    }

    #[test]
    fn test_zero_cap_rejected() {
        let err = OrchestratorConfig::from_toml_str("[concurrency]\nmax_implementation = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groupflow.toml");
        std::fs::write(&path, "[investigation]\nmax_iterations = 3\n").unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.investigation.max_iterations, 3);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = OrchestratorConfig::load("/nonexistent/groupflow.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
