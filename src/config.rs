//! Runtime configuration, loaded from a TOML file with per-field defaults
//! so a minimal config only names the capability endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::graph::EngineConfig;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DraftflowConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub review: ReviewSection,
    /// Stage capability name -> HTTP endpoint.
    #[serde(default)]
    pub stages: HashMap<String, String>,
    /// Quality check name -> HTTP endpoint.
    #[serde(default)]
    pub checks: HashMap<String, String>,
    #[serde(default)]
    pub notify: NotifySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewSection {
    /// Base URL embedded in reviewer-facing links.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// How often the SLA sweep runs.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifySection {
    /// Webhook endpoint messages are posted to.
    #[serde(default = "default_webhook")]
    pub webhook_url: String,
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8700".parse().unwrap()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("draftflow.db")
}

fn default_max_stage_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_base_url() -> String {
    "http://127.0.0.1:8700".to_string()
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_webhook() -> String {
    "http://127.0.0.1:8701/notify".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            db_path: default_db_path(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_stage_attempts: default_max_stage_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            webhook_url: default_webhook(),
        }
    }
}

impl DraftflowConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load from the given path, or fall back to defaults when absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_stage_attempts: self.engine.max_stage_attempts,
            retry_backoff: Duration::from_millis(self.engine.retry_backoff_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.review.tick_interval_secs)
    }
}
