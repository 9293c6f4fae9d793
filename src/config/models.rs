// src/config/models.rs
use std::net::SocketAddr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Selection algorithm, as named in the config file's `algorithm` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds. Represented unsigned so "ExpirationPeriod >= 0" holds by
    /// construction.
    #[serde(default)]
    pub expiration_period: u64,
}

impl Default for SessionPersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expiration_period: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub dial_timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            dial_timeout_secs: 5,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn dial_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9001,
            path: "/metrics".to_string(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 9000).into()
}

fn default_override_backend_path() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub algorithm: Algorithm,
    #[serde(default, rename = "session_persistence")]
    pub session_persistence: SessionPersistenceConfig,
    #[serde(rename = "backend_urls")]
    pub backend_urls: Vec<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Whether the backend URL's path replaces the client's request path
    /// during rewrite, as opposed to forwarding the client's original path.
    #[serde(default = "default_override_backend_path")]
    pub override_backend_path: bool,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Config {
    /// Validates non-empty, parseable backend URLs and a non-negative
    /// expiration period (guaranteed by the `u64` representation, checked
    /// here for documentation/clarity).
    pub fn validate(&self) -> Result<()> {
        if self.backend_urls.is_empty() {
            bail!("backend_urls must be non-empty");
        }
        for raw in &self.backend_urls {
            url::Url::parse(raw).map_err(|e| {
                anyhow::anyhow!("invalid backend url {:?}: {}", raw, e)
            })?;
        }
        if self.session_persistence.enabled && self.session_persistence.expiration_period == 0 {
            bail!("session_persistence.expiration_period must be > 0 when enabled");
        }
        Ok(())
    }
}
