//! Configuration loading for Spinq.
//!
//! YAML config with per-section defaults. Sections owned by other modules
//! (admission, breaker, retry, reconciler, selection) reuse those modules'
//! serde structs so the knobs live next to the code they tune.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::reconciler::ReconcilerConfig;
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::scheduler::{AdmissionConfig, SelectionConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub provider: ProviderSection,
    pub scheduler: SchedulerSection,
    pub admission: AdmissionConfig,
    pub generation: GenerationSection,
    pub breaker: BreakerConfig,
    pub reconciler: ReconcilerConfig,
    pub reputation: ReputationSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the API server.
    pub bind_addr: String,
    /// Public base URL handed to the provider for webhooks.
    pub public_url: String,
    /// Shared secret for webhook signatures.
    pub webhook_secret: String,
    /// Broadcast collaborator endpoint for artifact handoffs, if any.
    pub broadcast_endpoint: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8750".to_string(),
            public_url: "http://127.0.0.1:8750".to_string(),
            webhook_secret: "change-me".to_string(),
            broadcast_endpoint: None,
        }
    }
}

impl ServerConfig {
    /// The webhook URL the provider should call back.
    pub fn callback_url(&self) -> String {
        format!("{}/webhooks/generation", self.public_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Provider API base URL.
    pub base_url: String,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Artifact storage service endpoint; provider URLs are used directly
    /// as handles when unset.
    pub storage_endpoint: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.songforge.io/v1".to_string(),
            api_key_env: "SPINQ_PROVIDER_API_KEY".to_string(),
            timeout_ms: 30_000,
            storage_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Milliseconds between scheduling ticks.
    pub tick_interval_ms: u64,
    /// Seconds between priority rescoring passes.
    pub rescore_interval_secs: u64,
    /// Candidate selection knobs.
    pub selection: SelectionConfig,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            rescore_interval_secs: 120,
            selection: SelectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    /// Retry envelope for the provider submission call.
    pub retry: RetryPolicy,
    /// Seconds before the polling fallback starts.
    pub poll_grace_secs: u64,
    /// Seconds between polls.
    pub poll_interval_secs: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_grace_secs: 30,
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationSection {
    /// Reputation floor.
    pub min: i32,
    /// Reputation ceiling.
    pub max: i32,
}

impl Default for ReputationSection {
    fn default() -> Self {
        Self { min: -100, max: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Data directory for the store and logs.
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("spinq"),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit path, then `~/.config/spinq/spinq.yml`, then
    /// `./spinq.yml`, then built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let primary = config_dir.join("spinq").join("spinq.yml");
            if primary.exists() {
                match Self::load_from_file(&primary) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary.display(), e);
                    }
                }
            }
        }

        let fallback = PathBuf::from("spinq.yml");
        if fallback.exists() {
            match Self::load_from_file(&fallback) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback.display(), e);
                }
            }
        }

        Ok(Self::default())
    }

    /// Load from a specific file.
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Provider API key from the configured environment variable.
    pub fn provider_api_key(&self) -> Option<String> {
        std::env::var(&self.provider.api_key_env).ok()
    }
}
