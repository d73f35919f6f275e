use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use arbor_types::ClientError;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../../../config/client.toml");

/// Client settings, layered as: built-in defaults, optional TOML file,
/// then `ARBOR_CLIENT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub hosts: Vec<String>,
    pub keep_alive_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff_max_connections: usize,
    pub backoff_window_ms: u64,
    /// Deadline for configuration changes; 0 waits indefinitely.
    pub admin_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hosts: vec!["127.0.0.1:5254".to_string()],
            keep_alive_interval_ms: 60_000,
            connect_timeout_ms: 1_000,
            backoff_max_connections: 5,
            backoff_window_ms: 100,
            admin_timeout_ms: 0,
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment
            .merge(Env::prefixed("ARBOR_CLIENT_").split("__"))
            .extract()
    }

    /// Defaults with `hosts` taken from a `,` or `;` separated list.
    pub fn from_hosts(hosts: &str) -> Result<Self, ClientError> {
        let hosts: Vec<String> = hosts
            .split(|c: char| c == ',' || c == ';')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(ClientError::InvalidArgument(
                "no cluster hosts given".to_string(),
            ));
        }
        Ok(ClientConfig {
            hosts,
            ..ClientConfig::default()
        })
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn admin_timeout_nanos(&self) -> u64 {
        self.admin_timeout_ms.saturating_mul(1_000_000)
    }
}
