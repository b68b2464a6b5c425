use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::pool::PoolConfig;

/// Pool settings as they appear in configuration files. Times are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum open connections across all endpoints (default: 10)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds to wait for a free connection (default: 5)
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,

    /// TCP connect timeout in seconds (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Whole-request timeout in seconds; unset means no limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,

    /// Base seconds a failed endpoint is left out of rotation (default: 60)
    #[serde(default = "default_dead_timeout")]
    pub dead_timeout: u64,

    /// Consecutive failures before a connection is retired (default: 3)
    #[serde(default = "default_max_connection_failures")]
    pub max_connection_failures: u32,
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_dead_timeout() -> u64 {
    60
}

fn default_max_connection_failures() -> u32 {
    3
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            connect_timeout: default_connect_timeout(),
            request_timeout: None,
            dead_timeout: default_dead_timeout(),
            max_connection_failures: default_max_connection_failures(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            request_timeout: self.request_timeout.map(Duration::from_secs),
            dead_timeout: Duration::from_secs(self.dead_timeout),
            max_connection_failures: self.max_connection_failures,
        }
    }
}

/// Everything needed to build a `SearchClient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Servers to spread requests over
    pub endpoints: Vec<Endpoint>,

    /// Index searched by `SearchClient::search`
    #[serde(default)]
    pub index: String,

    /// Document type searched by `SearchClient::search`
    #[serde(default, rename = "type")]
    pub doc_type: String,

    /// Headers sent with every request, e.g. `Authorization`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub pool: PoolSettings,
}

impl ClientConfig {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            index: String::new(),
            doc_type: String::new(),
            headers: BTreeMap::new(),
            pool: PoolSettings::default(),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ClientConfig = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    if config.endpoints.is_empty() {
        anyhow::bail!("configuration lists no endpoints");
    }

    Ok(config)
}

/// Load configuration from environment variables
///
/// - ES_HOSTS (comma-separated list of endpoints)
/// - ES_INDEX, ES_TYPE (optional search target)
/// - ES_MAX_CONNECTIONS (optional, defaults to 10)
/// - ES_AUTHORIZATION (optional, sent as the `Authorization` header)
pub fn load_from_env() -> Result<ClientConfig> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    from_vars(|name| std::env::var(name).ok())
}

fn from_vars<F>(var: F) -> Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let hosts = var("ES_HOSTS").context("ES_HOSTS environment variable not set")?;

    let endpoints = hosts
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Endpoint>().context(format!("Invalid endpoint in ES_HOSTS: {s}")))
        .collect::<Result<Vec<_>>>()?;

    if endpoints.is_empty() {
        anyhow::bail!("ES_HOSTS contains no valid endpoints");
    }

    let mut config = ClientConfig::new(endpoints);

    if let Some(index) = var("ES_INDEX") {
        config.index = index;
    }
    if let Some(doc_type) = var("ES_TYPE") {
        config.doc_type = doc_type;
    }
    if let Some(max) = var("ES_MAX_CONNECTIONS") {
        config.pool.max_connections = max
            .parse::<usize>()
            .context(format!("Invalid ES_MAX_CONNECTIONS: {max}"))?;
    }
    if let Some(auth) = var("ES_AUTHORIZATION") {
        config.headers.insert("Authorization".to_string(), auth);
    }

    Ok(config)
}
