//! Persisted node configuration.
//!
//! A single JSON file created with defaults on first run and rewritten when
//! device registration assigns an ID.
//!
//! Location:
//!   1. $PIKONET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pikonet/config.json
//!   3. ~/.config/pikonet/config.json

use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Node configuration. Field names are fixed — they are the on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the rendezvous server.
    #[serde(rename = "Rendezvous")]
    pub rendezvous: String,

    /// Bearer token for the rendezvous API.
    #[serde(rename = "Token")]
    pub token: String,

    /// Server-assigned device ID. 0 means not yet registered.
    #[serde(rename = "DeviceID")]
    pub device_id: i64,

    /// Base64 WireGuard private key.
    #[serde(rename = "PrivateKey")]
    pub private_key: String,

    /// Base64 WireGuard public key.
    #[serde(rename = "PublicKey")]
    pub public_key: String,

    /// Name of the tunnel interface.
    #[serde(rename = "InterfaceName")]
    pub interface_name: String,

    /// WireGuard listen port. 0 picks a random port at startup.
    #[serde(rename = "ListenPort")]
    pub listen_port: u16,

    /// Bind address of the DNS server.
    #[serde(rename = "DnsListen")]
    pub dns_listen: String,

    /// Upstream resolver for non-overlay queries.
    #[serde(rename = "DnsFallback")]
    pub dns_fallback: String,

    /// Overlay DNS suffix.
    #[serde(rename = "DnsSuffix")]
    pub dns_suffix: String,

    /// Local status endpoint port. 0 disables it.
    #[serde(rename = "StatusPort")]
    pub status_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rendezvous: "http://localhost:8080/api".to_string(),
            token: String::new(),
            device_id: 0,
            private_key: String::new(),
            public_key: String::new(),
            interface_name: "pn0".to_string(),
            listen_port: 0,
            dns_listen: "127.0.0.1:53".to_string(),
            dns_fallback: "1.1.1.1:53".to_string(),
            dns_suffix: "pn.local".to_string(),
            status_port: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}

impl Config {
    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PIKONET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.json"))
    }

    /// Load the config file, writing one with defaults if it is missing.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            let config = Config::default();
            config.save()?;
            return Ok(config);
        }

        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Read(path.clone(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path, e))
    }

    /// Write the config back to disk, creating parent directories.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::file_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write(path.clone(), e))?;
        }

        let text = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, text).map_err(|e| ConfigError::Write(path, e))
    }

    /// Pick a random listen port when none is configured.
    /// Returns true if the config changed.
    pub fn ensure_listen_port(&mut self) -> bool {
        if self.listen_port != 0 {
            return false;
        }
        self.listen_port = rand::thread_rng().gen_range(1024..=65535);
        true
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("pikonet")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.interface_name, "pn0");
        assert_eq!(config.device_id, 0);
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.dns_suffix, "pn.local");
        assert_eq!(config.status_port, 0);
    }

    #[test]
    fn ensure_listen_port_picks_unprivileged() {
        let mut config = Config::default();
        assert!(config.ensure_listen_port());
        assert!(config.listen_port >= 1024);

        let picked = config.listen_port;
        assert!(!config.ensure_listen_port());
        assert_eq!(config.listen_port, picked);
    }

    #[test]
    fn json_round_trip_keeps_field_names() {
        let mut config = Config::default();
        config.device_id = 7;
        config.token = "tok".to_string();

        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"DeviceID\":7"));
        assert!(text.contains("\"InterfaceName\":\"pn0\""));

        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.device_id, 7);
        assert_eq!(back.token, "tok");
    }

    #[test]
    fn load_creates_default_file() {
        let dir = std::env::temp_dir().join(format!("pikonet-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        unsafe {
            std::env::set_var("PIKONET_CONFIG", path.to_str().unwrap());
        }

        let config = Config::load().expect("load should create defaults");
        assert!(path.exists());
        assert_eq!(config.interface_name, "pn0");

        unsafe {
            std::env::remove_var("PIKONET_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
