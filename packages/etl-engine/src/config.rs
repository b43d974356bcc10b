//! Engine configuration (YAML / env loading)

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_VERSION: u32 = 1;

pub const ENV_MAX_SINK_WORKERS: &str = "ETL_ENGINE_MAX_SINK_WORKERS";
pub const ENV_LOG_EXECUTION_PLAN: &str = "ETL_ENGINE_LOG_EXECUTION_PLAN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Schema version (always 1)
    pub version: u32,

    /// Upper bound on concurrently running sink tasks (default: one per task)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sink_workers: Option<usize>,

    /// Log the phase's execution plan at the start of every run
    pub log_execution_plan: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            max_sink_workers: None,
            log_execution_plan: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply `ETL_ENGINE_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_SINK_WORKERS) {
            let workers = value.trim().parse::<usize>().map_err(|e| {
                PipelineError::config(format!("{}='{}': {}", ENV_MAX_SINK_WORKERS, value, e))
            })?;
            self.max_sink_workers = Some(workers);
        }

        if let Some(value) = lookup(ENV_LOG_EXECUTION_PLAN) {
            self.log_execution_plan = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(PipelineError::config(format!(
                        "{}='{}': expected true or false",
                        ENV_LOG_EXECUTION_PLAN, other
                    )))
                }
            };
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(PipelineError::config(format!(
                "Unsupported configuration version {}. Supported versions: {}",
                self.version, CONFIG_VERSION
            )));
        }

        if self.max_sink_workers == Some(0) {
            return Err(PipelineError::config(
                "max_sink_workers must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.log_execution_plan);
        assert_eq!(config.max_sink_workers, None);
    }

    #[test]
    fn test_yaml_loading() {
        let yaml = r#"
version: 1
max_sink_workers: 4
log_execution_plan: false
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let config = EngineConfig::from_yaml_file(temp_file.path()).unwrap();
        assert_eq!(config.max_sink_workers, Some(4));
        assert!(!config.log_execution_plan);
    }

    #[test]
    fn test_yaml_defaults_missing_fields() {
        let config = EngineConfig::from_yaml_str("max_sink_workers: 2").unwrap();
        assert_eq!(config.version, 1);
        assert!(config.log_execution_plan);
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result = EngineConfig::from_yaml_str("max_sink_worker: 2");
        assert!(matches!(result, Err(PipelineError::Yaml(_))));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = EngineConfig::from_yaml_str("version: 2");
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(EngineConfig::from_yaml_str("max_sink_workers: 0").is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = EngineConfig {
            max_sink_workers: Some(3),
            ..Default::default()
        };
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("max_sink_workers: 3"));
        assert_eq!(EngineConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_SINK_WORKERS, "6"),
            (ENV_LOG_EXECUTION_PLAN, "false"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.max_sink_workers, Some(6));
        assert!(!config.log_execution_plan);
    }

    #[test]
    fn test_env_override_invalid_number() {
        let result = EngineConfig::default().with_overrides(|key| {
            (key == ENV_MAX_SINK_WORKERS).then(|| "many".to_string())
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
