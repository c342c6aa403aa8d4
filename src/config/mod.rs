//! Configuration module for fastPort.
//!
//! Loads a structured TOML file into strongly-typed structs using
//! `serde` + `toml`, then applies environment overrides for the handful
//! of keys operators set at deploy time.
//!
//! # Example `fastport.toml`
//! ```toml
//! [server]
//! bind_addr        = "0.0.0.0:7600"
//! max_payload_size = 16_777_216   # frame cap, text and binary alike
//!
//! [storage]
//! backend = "memory"              # "memory" | "sqlite"
//! path    = "fastport.db"         # sqlite only
//!
//! [cleanup]
//! interval_s = 60                 # expiry sweep cadence
//!
//! [notifier]
//! deadline_ms = 5_000             # offline-push batch deadline
//! ```
//!
//! Recognized environment keys: `PORT`, `MAX_PAYLOAD_SIZE`, `DB_TYPE`,
//! `CLEANUP_INTERVAL_S`, `API_RATE_LIMIT` (adapter concern, carried but
//! unused by the core). Unknown keys are ignored.

use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frame cap for both text JSON and binary chunks; oversize frames
    /// close the connection.
    pub max_payload_size: usize,
    /// Outbound queue depth per connection; full queues drop frames.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:7600".into(),
            max_payload_size: 16 * 1024 * 1024,
            outbound_queue: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file, sqlite backend only.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            path: "fastport.db".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CleanupConfig {
    /// How often the expiry sweep runs, in seconds.
    pub interval_s: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig { interval_s: 60 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotifierConfig {
    /// Total deadline for one offline-push batch, in milliseconds.
    pub deadline_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig { deadline_ms: 5_000 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cleanup: CleanupConfig,
    pub notifier: NotifierConfig,
    /// Requests/second hint for an admin adapter; the core ignores it.
    pub api_rate_limit: Option<u64>,
}

/// Load configuration from a TOML file into `Config`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(&path)?;
    let cfg: Config = toml::from_str(&raw)?;
    Ok(cfg)
}

impl Config {
    /// Applies recognized environment overrides on top of the file (or
    /// default) configuration. Malformed values are ignored with the
    /// file value left in place.
    pub fn apply_env(mut self) -> Self {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                let host = self
                    .server
                    .bind_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host.to_string())
                    .unwrap_or_else(|| "0.0.0.0".into());
                self.server.bind_addr = format!("{host}:{port}");
            }
        }
        if let Ok(size) = std::env::var("MAX_PAYLOAD_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                self.server.max_payload_size = size;
            }
        }
        if let Ok(db) = std::env::var("DB_TYPE") {
            match db.to_ascii_lowercase().as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "sqlite" => self.storage.backend = StorageBackend::Sqlite,
                _ => {}
            }
        }
        // both spellings of the seconds suffix are seen in the wild
        let cleanup = std::env::var("CLEANUP_INTERVAL_S")
            .or_else(|_| std::env::var("CLEANUP_INTERVAL_s"));
        if let Ok(interval) = cleanup {
            if let Ok(interval) = interval.parse::<u64>() {
                self.cleanup.interval_s = interval;
            }
        }
        if let Ok(limit) = std::env::var("API_RATE_LIMIT") {
            if let Ok(limit) = limit.parse::<u64>() {
                self.api_rate_limit = Some(limit);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:7600");
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.cleanup.interval_s, 60);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            bind_addr = "127.0.0.1:9000"

            [storage]
            backend = "sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.server.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
        assert_eq!(cfg.storage.path, "fastport.db");
    }
}
