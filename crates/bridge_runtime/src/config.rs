//! Bridge configuration (bridge.toml)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::attach::{DEFAULT_ATTACH_LIMIT, DEFAULT_WARN_RATIO};
use crate::error::ConfigError;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub attach: AttachConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Thread attachment pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachConfig {
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Fraction of `limit` at which pool pressure is logged
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            warn_ratio: default_warn_ratio(),
        }
    }
}

fn default_limit() -> usize {
    DEFAULT_ATTACH_LIMIT
}

fn default_warn_ratio() -> f64 {
    DEFAULT_WARN_RATIO
}

/// Embedded runtime start settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_module_path")]
    pub module_path: String,
    #[serde(default = "default_redirect_output")]
    pub redirect_output: bool,
    #[serde(default)]
    pub args: Vec<String>,
    pub data_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            module_path: default_module_path(),
            redirect_output: default_redirect_output(),
            args: Vec::new(),
            data_dir: None,
        }
    }
}

fn default_module_path() -> String {
    "builtin_modules".to_string()
}

fn default_redirect_output() -> bool {
    true
}

impl BridgeConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attach.limit == 0 {
            return Err(ConfigError::Invalid(
                "attach.limit must be at least 1".to_string(),
            ));
        }
        let ratio = self.attach.warn_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "attach.warn_ratio must be in (0, 1], got {ratio}"
            )));
        }
        Ok(())
    }
}
