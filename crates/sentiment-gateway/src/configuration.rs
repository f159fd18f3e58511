use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_KEY_PREFIX: &str = "sa";
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Gateway settings. Lives in the same YAML file as pingora's own options.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// SQLite database file, relative to the config file unless absolute.
    pub database: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Plan assigned when a signup does not name one.
    pub default_plan: String,
    pub plans: Vec<PlanConfig>,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    pub name: String,
    pub monthly_quota: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub endpoint: String,
    /// Bucket the uploaded videos live in; only used to build the video path.
    pub bucket: String,
    #[serde(default = "default_inference_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_inference_timeout_ms() -> u64 {
    DEFAULT_INFERENCE_TIMEOUT_MS
}

impl ServerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plans.is_empty() {
            return Err(ConfigError::Invalid("at least one plan is required".into()));
        }
        if let Some(plan) = self.plans.iter().find(|p| p.monthly_quota < 0) {
            return Err(ConfigError::Invalid(format!(
                "plan '{}' has a negative monthly_quota",
                plan.name
            )));
        }
        if !self.plans.iter().any(|p| p.name == self.default_plan) {
            return Err(ConfigError::Invalid(format!(
                "default_plan '{}' is not declared in plans",
                self.default_plan
            )));
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains('_') {
            return Err(ConfigError::Invalid(
                "key_prefix must be non-empty and must not contain '_'".into(),
            ));
        }
        if self.inference.endpoint.is_empty() {
            return Err(ConfigError::Invalid("inference.endpoint is required".into()));
        }
        Ok(())
    }

    /// Resolve the database path against the directory of the config file.
    pub fn database_path(&self, config_base_path: &Path) -> PathBuf {
        let path = Path::new(&self.database);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_base_path.join(path)
        }
    }
}
