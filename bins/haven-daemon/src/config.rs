use haven_core::policy::Policy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HavenConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub cafe: CafeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            polling_interval_ms: default_polling_interval_ms(),
        }
    }
}

/// The local scaffolding cafe the daemon hosts for development setups.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CafeConfig {
    #[serde(default = "default_cafe_token")]
    pub token: String,
}

impl Default for CafeConfig {
    fn default() -> Self {
        Self {
            token: default_cafe_token(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_api_bind_addr(),
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("api.bind_addr"))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {0}")]
    Read(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid field: {0}")]
    Invalid(&'static str),
}

pub fn load_config(path: &Path) -> Result<HavenConfig, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|_| ConfigError::Read(path.display().to_string()))?;
    let config: HavenConfig =
        toml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
    config.api.socket_addr()?;
    if config.node.namespace.trim().is_empty() {
        return Err(ConfigError::Invalid("node.namespace"));
    }
    Ok(config)
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_dispatch_interval_ms() -> u64 {
    500
}

fn default_polling_interval_ms() -> u64 {
    600_000
}

fn default_cafe_token() -> String {
    "dev".to_string()
}

fn default_api_bind_addr() -> String {
    "127.0.0.1:9040".to_string()
}
