//! Daemon configuration.
//!
//! Every knob has a default, so an empty (or absent) file yields a working
//! configuration; the file only needs the sections it overrides. The file
//! format is JSON.

use std::{net::IpAddr, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::token::TokenConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub control: ControlConfig,
    pub ingest: IngestConfig,
    pub viewer: ViewerConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The control (handshake) listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    /// Source addresses allowed to handshake. Empty means nobody can.
    pub whitelist: Vec<IpAddr>,
    pub token: TokenConfig,
    /// Idle lifetime of an issued token; `None` disables expiry.
    pub token_ttl_secs: Option<u64>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 56789,
            whitelist: Vec::new(),
            token: TokenConfig::default(),
            token_ttl_secs: None,
        }
    }
}

impl ControlConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn token_ttl(&self) -> Option<Duration> {
        self.token_ttl_secs.map(Duration::from_secs)
    }
}

/// The datagram (frame) listener and per-feed cache sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub host: String,
    pub port: u16,
    /// Per-feed ring capacity, in whole frames.
    pub cache_size: usize,
    /// Receive tasks sharing the ingest socket.
    pub workers: usize,
    /// Outstanding partially-reassembled frames tolerated per feed.
    pub max_pending_frames: usize,
    /// A feed with no frame for this long is considered finished.
    pub liveness_window_ms: u64,
    /// Framerate estimate before enough frames have arrived to measure one.
    pub initial_framerate: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 56790,
            cache_size: 100,
            workers: 4,
            max_pending_frames: 16,
            liveness_window_ms: 10_000,
            initial_framerate: 30.0,
        }
    }
}

impl IngestConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}

/// The HTTP viewer listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewerConfig {
    pub host: String,
    pub port: u16,
    /// Concurrent viewer streams served before new ones are turned away.
    pub pool_size: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 12345,
            pool_size: 50,
        }
    }
}

impl ViewerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where and how often cached frames are flushed to disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub flush_period_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("storage"),
            flush_period_ms: 1000,
        }
    }
}

impl StorageConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.ingest.cache_size, 100);
        assert_eq!(config.viewer.pool_size, 50);
        assert_eq!(config.storage.flush_period(), Duration::from_secs(1));
        assert!(config.control.whitelist.is_empty());
        assert!(config.control.token_ttl().is_none());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config: Config = serde_json::from_str(
            r#"{
                "control": {
                    "whitelist": ["192.168.101.1"],
                    "token_ttl_secs": 600
                },
                "ingest": { "cache_size": 3 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.control.whitelist.len(), 1);
        assert_eq!(config.control.token_ttl(), Some(Duration::from_secs(600)));
        assert_eq!(config.ingest.cache_size, 3);
        assert_eq!(config.ingest.port, 56790);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> =
            serde_json::from_str(r#"{ "ingest": { "cachesize": 3 } }"#);
        assert!(result.is_err());
    }
}
