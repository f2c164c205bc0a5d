use crate::codes::{PEER_ID_LENGTH, generate_peer_id};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::warn;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "bindrop";
const APP_NAME: &str = "bindrop";
const RELAY_CONFIG_FILE: &str = "relay.json";
const CLIENT_CONFIG_FILE: &str = "client.json";

/// Overrides the platform config directory (used by tests)
pub const CONFIG_DIR_ENV: &str = "BINDROP_CONFIG_DIR";

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_BUFFER_MULTIPLIER: u32 = 1200;
pub const DEFAULT_IDENTIFY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_TRANSFER_TTL_SECS: u64 = 24 * 60 * 60;

/// Share of the smallest buffer a single chunk may occupy
pub const SPLIT_FACTOR: f64 = 0.2;

/// Floor for the target length so a chunk can always carry the AEAD tag
pub const MIN_TARGET_LENGTH: u32 = 1024;

/// Transport buffer capacities the target chunk length is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub write: usize,
    pub object: usize,
}

impl BufferSizes {
    pub fn relay(multiplier: u32) -> Self {
        let m = multiplier.max(1) as usize;
        Self {
            write: m * 16384,
            object: m * 2048,
        }
    }

    pub fn client(multiplier: u32) -> Self {
        let m = multiplier.max(1) as usize;
        Self {
            write: m * 8192,
            object: m * 2048,
        }
    }

    pub fn target_length(&self) -> u32 {
        let smallest = self.write.min(self.object) as f64;
        let target = (smallest * SPLIT_FACTOR) as u64;
        (target.min(u32::MAX as u64) as u32).max(MIN_TARGET_LENGTH)
    }
}

/// Narrow the local target by what the other side declared. Done once per
/// session, on the first identify reply.
pub fn negotiate_target(local: u32, remote: u32) -> u32 {
    local.min(remote).max(MIN_TARGET_LENGTH)
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable config");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                warn!(path = %path.display(), error = %e, "Could not save config");
            }
        }
        Err(e) => warn!(error = %e, "Could not serialise config"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub buffer_size_multiplier: u32,
    pub identify_timeout_ms: u64,
    pub transfer_ttl_secs: u64,
    pub workspace_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            buffer_size_multiplier: DEFAULT_BUFFER_MULTIPLIER,
            identify_timeout_ms: DEFAULT_IDENTIFY_TIMEOUT_MS,
            transfer_ttl_secs: DEFAULT_TRANSFER_TTL_SECS,
            workspace_dir: data_dir().join("relay"),
        }
    }
}

impl RelayConfig {
    /// Load from the config directory, falling back to defaults
    pub fn load() -> Self {
        match config_dir() {
            Some(dir) => Self::load_from(&dir.join(RELAY_CONFIG_FILE)),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        read_json(path).unwrap_or_default()
    }

    pub fn save(&self) {
        if let Some(dir) = config_dir() {
            self.save_to(&dir.join(RELAY_CONFIG_FILE));
        }
    }

    pub fn save_to(&self, path: &Path) {
        write_json(path, self);
    }

    pub fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes::relay(self.buffer_size_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size_multiplier: u32,
    /// Persistent 64-character peer identifier
    pub local_identifier: String,
    pub workspace_dir: PathBuf,
    pub download_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bindrop");

        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            buffer_size_multiplier: DEFAULT_BUFFER_MULTIPLIER,
            local_identifier: String::new(),
            workspace_dir: data_dir().join("client"),
            download_dir,
        }
    }
}

impl ClientConfig {
    /// Load settings and make sure a local identifier exists. A freshly
    /// generated identifier is saved right away so it survives restarts.
    pub fn load() -> Self {
        match config_dir() {
            Some(dir) => Self::load_from(&dir.join(CLIENT_CONFIG_FILE)),
            None => {
                let mut config = Self::default();
                config.local_identifier = generate_peer_id();
                config
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config: Self = read_json(path).unwrap_or_default();
        if config.local_identifier.len() != PEER_ID_LENGTH {
            config.local_identifier = generate_peer_id();
            config.save_to(path);
        }
        config
    }

    pub fn save(&self) {
        if let Some(dir) = config_dir() {
            self.save_to(&dir.join(CLIENT_CONFIG_FILE));
        }
    }

    pub fn save_to(&self, path: &Path) {
        write_json(path, self);
    }

    pub fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes::client(self.buffer_size_multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target_lengths() {
        // min(1200 * 16384, 1200 * 2048) * 0.2
        assert_eq!(BufferSizes::relay(1200).target_length(), 491_520);
        assert_eq!(BufferSizes::client(1200).target_length(), 491_520);
        assert_eq!(BufferSizes::client(1).target_length(), MIN_TARGET_LENGTH);
    }

    #[test]
    fn test_negotiate_takes_smaller() {
        assert_eq!(negotiate_target(500_000, 40_000), 40_000);
        assert_eq!(negotiate_target(40_000, 500_000), 40_000);
        assert_eq!(negotiate_target(10, 20), MIN_TARGET_LENGTH);
    }

    #[test]
    fn test_client_identifier_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLIENT_CONFIG_FILE);

        let first = ClientConfig::load_from(&path);
        assert_eq!(first.local_identifier.len(), PEER_ID_LENGTH);
        let second = ClientConfig::load_from(&path);
        assert_eq!(first.local_identifier, second.local_identifier);
    }

    #[test]
    fn test_garbage_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RELAY_CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();
        let config = RelayConfig::load_from(&path);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.identify_timeout_ms, DEFAULT_IDENTIFY_TIMEOUT_MS);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RELAY_CONFIG_FILE);
        fs::write(&path, r#"{ "port": 6000 }"#).unwrap();
        let config = RelayConfig::load_from(&path);
        assert_eq!(config.port, 6000);
        assert_eq!(config.buffer_size_multiplier, DEFAULT_BUFFER_MULTIPLIER);
    }
}
