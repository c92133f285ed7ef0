// This module handles comfy.toml.
// A missing file is fine: everything has a default, and COMFY_URL can point the client elsewhere.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::client::WaitOptions;

pub const DEFAULT_CONFIG_PATH: &str = "comfy.toml";
pub const URL_ENV_VAR: &str = "COMFY_URL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Workflow used when a command doesn't name one.
    #[serde(default = "default_workflow")]
    pub default_workflow: String,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub wait_timeout_secs: u64,
    pub submit_retries: usize,
}

fn default_workflow() -> String {
    "workflows/default.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_workflow: default_workflow(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            request_timeout_secs: 30,
            poll_interval_ms: 1000,
            wait_timeout_secs: 300,
            submit_retries: 3,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.wait_timeout_secs),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Error parsing config")
    }

    /// Reads the config file if it exists, then applies COMFY_URL.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Error reading {}", path.display()))?;
            Self::parse(&text).with_context(|| format!("in {}", path.display()))?
        } else {
            debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            config.apply_url_override(&url);
        }
        Ok(config)
    }

    pub fn apply_url_override(&mut self, url: &str) {
        let url = url.trim();
        if !url.is_empty() {
            info!("Using server {}", url);
            self.server.base_url = url.to_owned();
        }
    }
}

#[cfg(test)]
pub fn testconfig() -> Config {
    Config::parse(include_str!("../testdata/config.toml")).unwrap()
}
