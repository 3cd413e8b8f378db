// This module handles config.toml.
// It's read once at startup; every field has a default, so a missing section or an empty file is fine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Where the ComfyUI engine lives and how long we wait for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Overall wall-clock limit for one generation, in seconds.
    pub timeout_secs: u64,
    /// Submission attempts before giving up.
    pub retries: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8188,
            timeout_secs: 300,
            retries: 5,
        }
    }
}

impl BackendConfig {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn ws_url(&self, client_id: &str) -> String {
        format!("ws://{}:{}/ws?clientId={}", self.host, self.port, client_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("outputs"),
        }
    }
}

/// Reads the config, falling back to defaults when the file doesn't exist.
pub fn read_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        log::info!("{} not found, using defaults", path.display());
        return Ok(FlowConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

#[cfg(test)]
pub fn testconfig() -> FlowConfig {
    toml::from_str(include_str!("../testdata/config.toml")).unwrap()
}
