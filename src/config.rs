//! Configuration: tunables for the engine and the TCP server, loadable
//! from `KVLITE_*` environment variables and overridable from the CLI.

use std::time::Duration;

const DEFAULT_MAX_WAL_ENTRIES: u64 = 10_000;
const DEFAULT_MAX_WAL_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_COMPACTION_INTERVAL_SECS: u64 = 60;
const DEFAULT_TTL_CHECK_INTERVAL_MILLIS: u64 = 1_000;
const DEFAULT_MAX_CONNECTIONS: u32 = 0;
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6380;

/// Tunable parameters for the storage engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Whether every WAL append fsyncs before returning.
    pub sync_mode: bool,
    /// WAL entry count at or above which compaction is due.
    pub max_wal_entries: u64,
    /// WAL byte size at or above which compaction is due.
    pub max_wal_size: u64,
    /// How often the background compaction timer checks the thresholds.
    pub compaction_interval: Duration,
    /// How often the TTL sweeper checks for expired keys.
    pub ttl_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_mode: false,
            max_wal_entries: DEFAULT_MAX_WAL_ENTRIES,
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
            compaction_interval: Duration::from_secs(DEFAULT_COMPACTION_INTERVAL_SECS),
            ttl_check_interval: Duration::from_millis(DEFAULT_TTL_CHECK_INTERVAL_MILLIS),
        }
    }
}

impl EngineConfig {
    /// Overrides defaults from `KVLITE_*` environment variables, leaving
    /// any unset/unparsable variable at its default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_bool("KVLITE_SYNC_MODE") {
            config.sync_mode = v;
        }
        if let Some(v) = env_u64("KVLITE_MAX_WAL_ENTRIES") {
            config.max_wal_entries = v;
        }
        if let Some(v) = env_u64("KVLITE_MAX_WAL_SIZE") {
            config.max_wal_size = v;
        }
        if let Some(v) = env_u64("KVLITE_COMPACTION_INTERVAL_SECS") {
            config.compaction_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("KVLITE_TTL_CHECK_INTERVAL_MILLIS") {
            config.ttl_check_interval = Duration::from_millis(v);
        }
        config
    }
}

/// Tunable parameters for the TCP protocol server.
///
/// `max_connections == 0` means unlimited.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("KVLITE_HOST") {
            config.host = v;
        }
        if let Some(v) = env_u16("KVLITE_PORT") {
            config.port = v;
        }
        if let Some(v) = env_u32("KVLITE_MAX_CONNECTIONS") {
            config.max_connections = v;
        }
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Data directory plus engine and server configuration, as loaded for a
/// single running instance.
#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: String,
    pub engine: EngineConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            engine: EngineConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self {
            data_dir: Self::default().data_dir,
            engine: EngineConfig::from_env(),
            server: ServerConfig::from_env(),
        };
        if let Ok(v) = std::env::var("KVLITE_DATA_DIR") {
            config.data_dir = v;
        }
        config
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| match v.as_str() {
        "1" | "true" | "TRUE" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "no" => Some(false),
        _ => None,
    })
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert!(!config.sync_mode);
        assert_eq!(config.max_wal_entries, DEFAULT_MAX_WAL_ENTRIES);
        assert_eq!(config.max_wal_size, DEFAULT_MAX_WAL_SIZE);
        assert_eq!(config.compaction_interval, Duration::from_secs(60));
        assert_eq!(config.ttl_check_interval, Duration::from_millis(1_000));

        let server = ServerConfig::default();
        assert_eq!(server.host, "localhost");
        assert_eq!(server.port, 6380);
        assert_eq!(server.max_connections, 0);
    }

    #[test]
    fn server_addr_formats_host_and_port() {
        let server = ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 9999,
            max_connections: 10,
        };
        assert_eq!(server.addr(), "0.0.0.0:9999");
    }
}
