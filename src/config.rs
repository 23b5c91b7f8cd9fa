//! Proxy configuration file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ca::{CA_CERT_FILE, CA_KEY_FILE};

/// Forged leaves are valid for ten years; cached ones must expire well before.
const MAX_LEAF_CACHE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Proxy configuration file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to accept proxy clients on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Directory holding the CA certificate and key.
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,

    /// CA certificate file name, relative to `ca_dir`.
    #[serde(default = "default_ca_cert_file")]
    pub ca_cert_file: String,

    /// CA private key file name, relative to `ca_dir`.
    #[serde(default = "default_ca_key_file")]
    pub ca_key_file: String,

    /// Upper bound on origin TCP dials. Unset means no limit.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// How long forged leaves are reused per host. Unset disables the cache.
    #[serde(default)]
    pub leaf_cache_ttl_secs: Option<u64>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("./certs")
}

fn default_ca_cert_file() -> String {
    CA_CERT_FILE.to_string()
}

fn default_ca_key_file() -> String {
    CA_KEY_FILE.to_string()
}

impl ProxyConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.ca_dir.join(&self.ca_cert_file)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.ca_dir.join(&self.ca_key_file)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn leaf_cache_ttl(&self) -> Option<Duration> {
        self.leaf_cache_ttl_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ca_cert_file.is_empty() || self.ca_key_file.is_empty() {
            return Err(ConfigError::Invalid(
                "CA file names must not be empty".to_string(),
            ));
        }
        if self.connect_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(ttl) = self.leaf_cache_ttl_secs
            && (ttl == 0 || ttl >= MAX_LEAF_CACHE_TTL_SECS)
        {
            return Err(ConfigError::Invalid(format!(
                "leaf_cache_ttl_secs must be between 1 and {}",
                MAX_LEAF_CACHE_TTL_SECS - 1
            )));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ca_dir: default_ca_dir(),
            ca_cert_file: default_ca_cert_file(),
            ca_key_file: default_ca_key_file(),
            connect_timeout_secs: None,
            leaf_cache_ttl_secs: None,
        }
    }
}
