//! Configuration system for snapmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SNAPMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/snapmesh/config.toml
//!   3. ~/.config/snapmesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapmeshConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display alias attached to published snaps.
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name for discovery. Empty = discovery disabled.
    pub interface: String,
    /// TCP port for peer links. 0 = OS-assigned.
    pub listen_port: u16,
    /// Seconds between presence announcements.
    pub announce_interval_secs: u64,
    /// Seconds a discovered peer stays in the registry without a refresh.
    pub peer_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Durable snap storage directory.
    pub storage_path: PathBuf,
    /// Max snaps held in memory. Oldest are evicted past this.
    pub capacity: usize,
    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Default lifetime for locally published snaps, in seconds.
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Piece size in bytes for chunked distribution.
    pub piece_size: u32,
    /// Max in-flight piece requests per content item.
    pub max_pending_requests: usize,
    /// Seconds before an unanswered piece request is released.
    pub request_timeout_secs: u64,
    /// Milliseconds between piece-selection ticks.
    pub tick_millis: u64,
    /// Snaps whose content exceeds this travel via the piece protocol
    /// instead of a single snap packet.
    pub direct_send_max_bytes: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SnapmeshConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            cache: CacheConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            alias: String::from("anonymous"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            listen_port: 0,
            announce_interval_secs: 2,
            peer_ttl_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_path: data_dir().join("snaps"),
            capacity: 50,
            sweep_interval_secs: 60,
            default_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            piece_size: 16_384,
            max_pending_requests: 5,
            request_timeout_secs: 10,
            tick_millis: 500,
            direct_send_max_bytes: 65_536,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("snapmesh")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("snapmesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SnapmeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SnapmeshConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SNAPMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SnapmeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SNAPMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SNAPMESH_IDENTITY__ALIAS") {
            self.identity.alias = v;
        }
        if let Ok(v) = std::env::var("SNAPMESH_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Ok(v) = std::env::var("SNAPMESH_NETWORK__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.network.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("SNAPMESH_CACHE__STORAGE_PATH") {
            self.cache.storage_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPMESH_CACHE__CAPACITY") {
            if let Ok(n) = v.parse() {
                self.cache.capacity = n;
            }
        }
        if let Ok(v) = std::env::var("SNAPMESH_TRANSFER__PIECE_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.piece_size = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SnapmeshConfig::default();
        assert_eq!(config.transfer.piece_size, 16_384);
        assert_eq!(config.transfer.max_pending_requests, 5);
        assert_eq!(config.transfer.request_timeout_secs, 10);
        assert_eq!(config.transfer.tick_millis, 500);
        assert_eq!(config.cache.capacity, 50);
        assert_eq!(config.cache.sweep_interval_secs, 60);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = SnapmeshConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SnapmeshConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.transfer.piece_size, config.transfer.piece_size);
        assert_eq!(parsed.network.peer_ttl_secs, config.network.peer_ttl_secs);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: SnapmeshConfig = toml::from_str(
            r#"
            [network]
            listen_port = 4747
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.listen_port, 4747);
        assert_eq!(parsed.cache.capacity, 50);
    }
}
