use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const DEFAULT_PATH: &str = "/etc/hopbridge/config.toml";
pub const ENV_VAR: &str = "HOPBRIDGE_CONFIG_PATH";

const DEFAULT_MAX_HOPS: usize = 32;
const DEFAULT_SERVER_NIC_PREFIX: &str = "wgs";
const DEFAULT_CLIENT_NIC_PREFIX: &str = "wgc";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub wireguard: WireguardConfig,
    pub datapath: DatapathConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub server_name: String,
    pub listen: Vec<SocketAddr>,
    #[serde(default)]
    max_hops: usize,
    pub session_dir: PathBuf,
    #[serde(default)]
    pub trust_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub clients: Vec<Credentials>,
    #[serde(default)]
    pub admins: Vec<Credentials>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireguardConfig {
    pub server: WireguardServerConfig,
    #[serde(default)]
    pub client: WireguardClientConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireguardServerConfig {
    pub private_key_file: PathBuf,
    pub listen_port: u16,
    pub subnet4: String,
    #[serde(default)]
    pub subnet6: Option<String>,
    #[serde(default = "default_server_nic_prefix")]
    pub nic_prefix: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireguardClientConfig {
    #[serde(default = "default_client_nic_prefix")]
    pub nic_prefix: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatapathConfig {
    pub bridge_object: PathBuf,
    pub wg_filter_object: PathBuf,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

impl ApiConfig {
    pub fn max_hops(&self) -> usize {
        if self.max_hops == 0 {
            DEFAULT_MAX_HOPS
        } else {
            self.max_hops
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for WireguardClientConfig {
    fn default() -> Self {
        WireguardClientConfig {
            nic_prefix: default_client_nic_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_nic_prefix() -> String {
    DEFAULT_SERVER_NIC_PREFIX.to_string()
}

fn default_client_nic_prefix() -> String {
    DEFAULT_CLIENT_NIC_PREFIX.to_string()
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let config = toml::from_str::<Config>(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[api]
server_name = "node-a"
listen = ["0.0.0.0:8080"]
session_dir = "/var/lib/hopbridge/sessions"

[wireguard.server]
private_key_file = "/etc/hopbridge/server.key"
listen_port = 51820
subnet4 = "10.40.0.0/16"

[datapath]
bridge_object = "/usr/lib/hopbridge/bridge.o"
wg_filter_object = "/usr/lib/hopbridge/wgfilter.o"
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.api.max_hops(), 32);
        assert_eq!(config.wireguard.server.nic_prefix, "wgs");
        assert_eq!(config.wireguard.client.nic_prefix, "wgc");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.api.clients.is_empty());
        assert!(config.wireguard.server.subnet6.is_none());
    }

    #[test]
    fn zero_max_hops_falls_back_to_default() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.api.max_hops = 0;
        assert_eq!(config.api.max_hops(), 32);
        config.api.max_hops = 5;
        assert_eq!(config.api.max_hops(), 5);
    }

    #[test]
    fn parses_clients_and_log_format() {
        let full = format!(
            "{MINIMAL}\n[logging]\nlevel = \"debug\"\nformat = \"json\"\n\n[[api.clients]]\nusername = \"u\"\npassword = \"p\"\n"
        );
        let config: Config = toml::from_str(&full).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.api.clients.len(), 1);
        assert_eq!(config.api.clients[0].username, "u");
    }
}
