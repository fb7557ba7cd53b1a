//! Layered configuration loading and validation.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::models::config::Config;
use crate::domain::models::ResourceType;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Scheduler ceiling below one.
    #[error("Invalid max_concurrent_tasks: {0}. Must be at least 1")]
    InvalidMaxConcurrentTasks(usize),

    /// Engine ceiling below one.
    #[error("Invalid max_concurrent_cycles: {0}. Must be at least 1")]
    InvalidMaxConcurrentCycles(usize),

    /// Threshold outside `0.0..=1.0`.
    #[error("Invalid quality_threshold: {0}. Must be between 0 and 1")]
    InvalidQualityThreshold(f64),

    /// A duration or multiplier that must be positive.
    #[error("Invalid {name}: {value}. Must be positive")]
    NonPositive {
        /// Setting path.
        name: String,
        /// Rejected value.
        value: f64,
    },

    /// A loop period of zero.
    #[error("Invalid {0}: must be greater than zero")]
    ZeroInterval(&'static str),

    /// Two rules share an id.
    #[error("Duplicate safety rule id: {0}")]
    DuplicateRule(String),

    /// Two protocols share an id.
    #[error("Duplicate emergency protocol id: {0}")]
    DuplicateProtocol(String),

    /// Unknown level name.
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    /// Unknown format name.
    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    /// Unknown rotation name.
    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    /// Any other validation failure.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive {
            name: name.to_string(),
            value,
        })
    }
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .autolab/config.yaml (project config)
    /// 3. .autolab/local.yaml (local overrides, optional)
    /// 4. Environment variables (AUTOLAB_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".autolab/config.yaml"))
            .merge(Yaml::file(".autolab/local.yaml"))
            .merge(Env::prefixed("AUTOLAB_").split("__"))
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let scheduler = &config.scheduler;
        if scheduler.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidMaxConcurrentTasks(0));
        }
        if scheduler.dispatch_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("scheduler.dispatch_interval_ms"));
        }
        if scheduler.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("scheduler.cleanup_interval_secs"));
        }
        for resource_type in ResourceType::ALL {
            positive(
                &format!("resource_limits.{}", resource_type.as_str()),
                scheduler.resource_limits.get(resource_type),
            )?;
        }

        let engine = &config.engine;
        if engine.max_concurrent_cycles == 0 {
            return Err(ConfigError::InvalidMaxConcurrentCycles(0));
        }
        if !(0.0..=1.0).contains(&engine.quality_threshold) {
            return Err(ConfigError::InvalidQualityThreshold(engine.quality_threshold));
        }
        positive("engine.step_timeout_multiplier", engine.step_timeout_multiplier)?;
        if engine.step_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("engine.step_poll_interval_ms"));
        }

        let safety = &config.safety;
        if safety.monitoring_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("safety.monitoring_interval_ms"));
        }
        if safety.risk_assessment_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("safety.risk_assessment_interval_ms"));
        }
        positive("safety.step_timeout_multiplier", safety.step_timeout_multiplier)?;
        positive("safety.cycle_timeout_hours", safety.cycle_timeout_hours)?;
        positive(
            "safety.agent_response_timeout_minutes",
            safety.agent_response_timeout_minutes,
        )?;

        let mut rule_ids = HashSet::new();
        for rule in &safety.rules {
            if rule.rule_id.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "safety rule id cannot be empty".to_string(),
                ));
            }
            if !rule_ids.insert(rule.rule_id.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.rule_id.clone()));
            }
        }
        let mut protocol_ids = HashSet::new();
        for protocol in &safety.protocols {
            if !protocol_ids.insert(protocol.protocol_id.as_str()) {
                return Err(ConfigError::DuplicateProtocol(protocol.protocol_id.clone()));
            }
            if protocol.emergency_actions.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "emergency protocol '{}' has no actions",
                    protocol.protocol_id
                )));
            }
        }

        let mut provider_ids = HashSet::new();
        for provider in &config.providers {
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RuleAction;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 50);
        assert_eq!(config.scheduler.dispatch_interval_ms, 10_000);
        assert!((config.engine.quality_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.safety.rules.len(), 6);
        assert_eq!(config.safety.protocols.len(), 3);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
scheduler:
  max_concurrent_tasks: 8
  resource_limits:
    compute: 100
engine:
  quality_threshold: 0.9
safety:
  rules:
    - rule_id: cpu_guard
      rule_name: CPU Guard
      rule_class: resource
      condition:
        kind: metric_above
        metric: cpu_percent
        max: 70
      action: pause
logging:
  level: debug
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.scheduler.max_concurrent_tasks, 8);
        assert!((config.scheduler.resource_limits.compute - 100.0).abs() < f64::EPSILON);
        assert!((config.scheduler.resource_limits.memory - 16384.0).abs() < f64::EPSILON);
        assert!((config.engine.quality_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.safety.rules.len(), 1);
        assert_eq!(config.safety.rules[0].action, RuleAction::Pause);
        assert_eq!(config.safety.protocols.len(), 3);
        assert_eq!(config.logging.level, "debug");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = Config::default();
        config.scheduler.max_concurrent_tasks = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConcurrentTasks(0))
        ));

        let mut config = Config::default();
        config.engine.max_concurrent_cycles = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConcurrentCycles(0))
        ));
    }

    #[test]
    fn test_validate_quality_threshold_range() {
        let mut config = Config::default();
        config.engine.quality_threshold = 1.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidQualityThreshold(_))
        ));
    }

    #[test]
    fn test_validate_non_positive_values() {
        let mut config = Config::default();
        config.scheduler.resource_limits.network = 0.0;
        match ConfigLoader::validate(&config) {
            Err(ConfigError::NonPositive { name, .. }) => assert_eq!(name, "resource_limits.network"),
            other => panic!("Expected NonPositive error, got {other:?}"),
        }

        let mut config = Config::default();
        config.safety.step_timeout_multiplier = -1.0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::NonPositive { .. })
        ));
    }

    #[test]
    fn test_validate_duplicate_rule() {
        let mut config = Config::default();
        let first = config.safety.rules[0].clone();
        config.safety.rules.push(first);
        match ConfigLoader::validate(&config) {
            Err(ConfigError::DuplicateRule(id)) => assert_eq!(id, "cpu_usage_limit"),
            other => panic!("Expected DuplicateRule error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_settings() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));

        let mut config = Config::default();
        config.logging.rotation = "weekly".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogRotation(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "engine:\n  max_concurrent_cycles: 2\nlogging:\n  format: json").unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.engine.max_concurrent_cycles, 2);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.scheduler.max_concurrent_tasks, 50);
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "engine:\n  quality_threshold: 2.0").unwrap();
        file.flush().unwrap();
        assert!(ConfigLoader::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            [
                ("AUTOLAB_SCHEDULER__MAX_CONCURRENT_TASKS", Some("12")),
                ("AUTOLAB_LOGGING__LEVEL", Some("debug")),
            ],
            || {
                let config: Config = ConfigLoader::figment().extract().unwrap();
                assert_eq!(config.scheduler.max_concurrent_tasks, 12);
                assert_eq!(config.logging.level, "debug");
            },
        );
    }

    #[test]
    fn test_hierarchical_merging() {
        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "scheduler:\n  max_concurrent_tasks: 5\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "scheduler:\n  max_concurrent_tasks: 15\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.scheduler.max_concurrent_tasks, 15, "Override should win");
        assert_eq!(config.logging.level, "debug", "Override should win for nested fields");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }
}
