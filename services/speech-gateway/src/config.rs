//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the SPEECH_API_KEYS env var or api_keys_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use voice_keys::KeyLimits;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub pool: PoolConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream speech API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_model")]
    pub default_model: String,
}

/// Key pool and retry settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Path of the shared key metrics store
    pub store_path: PathBuf,
    /// Path to a file with comma-delimited API keys (alternative to
    /// the SPEECH_API_KEYS env var)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Option<Secret>,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-key limit overrides; upstream free-tier defaults apply when absent
    #[serde(default)]
    pub limits: Option<KeyLimits>,
}

impl PoolConfig {
    pub fn limits(&self) -> KeyLimits {
        self.limits.unwrap_or_default()
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_timeout() -> u64 {
    60
}

fn default_model() -> String {
    "speech-2.5-flash-tts".to_string()
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. SPEECH_API_KEYS env var (comma-delimited)
    /// 2. api_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.pool.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // Resolve API keys: env var takes precedence over file
        if let Ok(keys) = std::env::var("SPEECH_API_KEYS") {
            config.pool.api_keys = Some(Secret::new(keys));
        } else if let Some(ref keys_file) = config.pool.api_keys_file {
            let keys = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Keys(format!(
                    "failed to read api_keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            let keys = keys.trim().to_owned();
            if !keys.is_empty() {
                config.pool.api_keys = Some(Secret::new(keys));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("speech-gateway.toml")
    }
}
