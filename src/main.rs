use clap::Parser;
use kvlite::config::{Config, EngineConfig, ServerConfig};
use kvlite::server::Server;
use kvlite::Engine;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// kvlite: an in-memory key-value store with a WAL, snapshots and a
/// line-oriented TCP protocol.
#[derive(Parser, Debug)]
#[command(name = "kvlite", version, about)]
struct Cli {
    /// Directory holding the WAL and snapshot files.
    #[arg(long, env = "KVLITE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Bind host.
    #[arg(long, env = "KVLITE_HOST")]
    host: Option<String>,

    /// Bind port.
    #[arg(long, env = "KVLITE_PORT")]
    port: Option<u16>,

    /// Maximum concurrent connections (0 = unlimited).
    #[arg(long, env = "KVLITE_MAX_CONNECTIONS")]
    max_connections: Option<u32>,

    /// fsync after every WAL append.
    #[arg(long, env = "KVLITE_SYNC_MODE")]
    sync_mode: bool,

    /// WAL entry count at which compaction becomes due.
    #[arg(long, env = "KVLITE_MAX_WAL_ENTRIES")]
    max_wal_entries: Option<u64>,

    /// WAL byte size at which compaction becomes due.
    #[arg(long, env = "KVLITE_MAX_WAL_SIZE")]
    max_wal_size: Option<u64>,

    /// Background compaction check period, in seconds.
    #[arg(long, env = "KVLITE_COMPACTION_INTERVAL_SECS")]
    compaction_interval_secs: Option<u64>,

    /// Background TTL sweep period, in milliseconds.
    #[arg(long, env = "KVLITE_TTL_CHECK_INTERVAL_MILLIS")]
    ttl_check_interval_millis: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Config {
        let mut config = Config::from_env();
        config.data_dir = self.data_dir.to_string_lossy().into_owned();

        let server = ServerConfig {
            host: self.host.unwrap_or(config.server.host),
            port: self.port.unwrap_or(config.server.port),
            max_connections: self.max_connections.unwrap_or(config.server.max_connections),
        };

        let engine = EngineConfig {
            sync_mode: self.sync_mode || config.engine.sync_mode,
            max_wal_entries: self.max_wal_entries.unwrap_or(config.engine.max_wal_entries),
            max_wal_size: self.max_wal_size.unwrap_or(config.engine.max_wal_size),
            compaction_interval: self
                .compaction_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(config.engine.compaction_interval),
            ttl_check_interval: self
                .ttl_check_interval_millis
                .map(Duration::from_millis)
                .unwrap_or(config.engine.ttl_check_interval),
        };

        config.server = server;
        config.engine = engine;
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().into_config();

    let engine = match Engine::open(&config.data_dir, config.engine.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "failed to open engine");
            std::process::exit(1);
        }
    };

    let server = Server::new(engine.clone(), config.server.max_connections);
    info!(addr = %config.server.addr(), "starting kvlite");
    if let Err(err) = server.run(&config.server.addr()) {
        error!(error = %err, "server exited with an error");
        let _ = engine.close();
        std::process::exit(1);
    }
    let _ = engine.close();
}
