//! Session / protocol layer (C6): accepts TCP connections, frames the
//! line-oriented text protocol, and dispatches to the engine.

use crate::engine::Engine;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

const WELCOME: &str = "+OK kvlite ready";

/// Shared server state: the engine handle, the active-connection counter
/// and the configured cap, plus a shutdown flag checked between accepts.
pub struct Server {
    engine: Engine,
    max_connections: u32,
    active_connections: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(engine: Engine, max_connections: u32) -> Self {
        Self {
            engine,
            max_connections,
            active_connections: Arc::new(AtomicU32::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// A clone-able handle that, when invoked, stops the accept loop.
    /// The listener must still see one more incoming connection (or a
    /// timeout) to notice and return.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Binds `addr` and serves connections until `shutdown_handle` is set.
    /// Once the listener is closed, waits for every worker spawned during
    /// this call to finish its current command before returning, so no
    /// in-flight op is cut off by the caller tearing the engine down.
    pub fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        info!(%addr, "kvlite server listening");

        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown signaled, closing listener");
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            if self.max_connections > 0
                && self.active_connections.load(Ordering::SeqCst) >= self.max_connections
            {
                let mut stream = stream;
                let _ = writeln!(stream, "-ERR connection limit reached");
                continue;
            }

            self.active_connections.fetch_add(1, Ordering::SeqCst);
            let engine = self.engine.clone();
            let active_connections = Arc::clone(&self.active_connections);
            let handle = thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                if let Err(err) = handle_connection(stream, &engine, &active_connections) {
                    warn!(error = %err, ?peer, "connection error");
                }
                active_connections.fetch_sub(1, Ordering::SeqCst);
            });

            let mut workers = self.workers.lock();
            workers.retain(|h| !h.is_finished());
            workers.push(handle);
        }

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::SeqCst)
    }
}

fn handle_connection(
    stream: TcpStream,
    engine: &Engine,
    active_connections: &Arc<AtomicU32>,
) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    writeln!(writer, "{WELCOME}")?;
    writer.flush()?;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&line, engine, active_connections);
        let close = response.starts_with("+OK goodbye");
        writeln!(writer, "{response}")?;
        writer.flush()?;
        if close {
            break;
        }
    }
    Ok(())
}

fn dispatch(line: &str, engine: &Engine, active_connections: &Arc<AtomicU32>) -> String {
    let mut tokens = line.split_whitespace();
    let Some(raw_cmd) = tokens.next() else {
        return "-ERR empty command".to_string();
    };
    let cmd = raw_cmd.to_ascii_uppercase();
    let args: Vec<&str> = tokens.collect();

    match cmd.as_str() {
        "PING" => "+PONG".to_string(),
        "QUIT" => "+OK goodbye".to_string(),
        "SET" => cmd_set(&args, engine),
        "SETEX" => cmd_setex(&args, engine),
        "GET" => cmd_get(&args, engine),
        "DELETE" | "DEL" => cmd_delete(&args, engine),
        "EXISTS" => cmd_exists(&args, engine),
        "EXPIRE" => cmd_expire(&args, engine),
        "TTL" => cmd_ttl(&args, engine),
        "PERSIST" => cmd_persist(&args, engine),
        "KEYS" => cmd_keys(&args, engine),
        "SCAN" => cmd_scan(&args, engine),
        "MSET" => cmd_mset(&args, engine),
        "MGET" => cmd_mget(&args, engine),
        "MDEL" => cmd_mdel(&args, engine),
        "INCR" => cmd_incr(&args, engine, 1),
        "DECR" => cmd_incr(&args, engine, -1),
        "APPEND" => cmd_append(&args, engine),
        "STRLEN" => cmd_strlen(&args, engine),
        "CLEAR" => cmd_clear(engine),
        "INFO" => cmd_info(engine, active_connections),
        "STATS" => cmd_stats(engine),
        "HEALTH" => cmd_health(engine),
        "SYNC" => cmd_sync(engine),
        "COMPACT" => cmd_compact(engine),
        other => format!("-ERR unknown command '{other}'"),
    }
}

fn join_value(args: &[&str]) -> String {
    args.join(" ")
}

fn cmd_set(args: &[&str], engine: &Engine) -> String {
    if args.len() < 2 {
        return "-ERR SET requires key and value".to_string();
    }
    let key = args[0].to_string();
    let value = join_value(&args[1..]);
    match engine.set(key, value) {
        Ok(()) => "+OK".to_string(),
        Err(err) => format!("-ERR failed to set: {}", err.client_message()),
    }
}

fn cmd_setex(args: &[&str], engine: &Engine) -> String {
    if args.len() < 3 {
        return "-ERR SETEX requires key, seconds and value".to_string();
    }
    let key = args[0].to_string();
    let Ok(seconds) = args[1].parse::<u64>() else {
        return "-ERR invalid TTL".to_string();
    };
    if seconds == 0 {
        return "-ERR invalid TTL".to_string();
    }
    let value = join_value(&args[2..]);
    match engine.set_with_ttl(key, value, std::time::Duration::from_secs(seconds)) {
        Ok(()) => "+OK".to_string(),
        Err(err) => format!("-ERR failed to set: {}", err.client_message()),
    }
}

fn cmd_get(args: &[&str], engine: &Engine) -> String {
    let [key] = args else {
        return "-ERR GET requires key".to_string();
    };
    match engine.get(key) {
        Some(value) => value,
        None => "-ERR key not found".to_string(),
    }
}

fn cmd_delete(args: &[&str], engine: &Engine) -> String {
    let [key] = args else {
        return "-ERR DELETE requires key".to_string();
    };
    match engine.delete(key) {
        Ok(true) => "+OK".to_string(),
        Ok(false) => "-ERR key not found".to_string(),
        Err(err) => format!("-ERR failed to delete: {}", err.client_message()),
    }
}

fn cmd_exists(args: &[&str], engine: &Engine) -> String {
    let [key] = args else {
        return "-ERR EXISTS requires key".to_string();
    };
    if engine.get(key).is_some() {
        "1".to_string()
    } else {
        "0".to_string()
    }
}

fn cmd_expire(args: &[&str], engine: &Engine) -> String {
    let [key, seconds] = args else {
        return "-ERR EXPIRE requires key and seconds".to_string();
    };
    let Ok(seconds) = seconds.parse::<u64>() else {
        return "-ERR invalid TTL".to_string();
    };
    if seconds == 0 {
        return "-ERR invalid TTL".to_string();
    }
    match engine.expire(key, std::time::Duration::from_secs(seconds)) {
        Ok(true) => "1".to_string(),
        Ok(false) => "0".to_string(),
        Err(_) => "-ERR invalid TTL".to_string(),
    }
}

fn cmd_ttl(args: &[&str], engine: &Engine) -> String {
    let [key] = args else {
        return "-ERR TTL requires key".to_string();
    };
    engine.ttl(key).to_string()
}

fn cmd_persist(args: &[&str], engine: &Engine) -> String {
    let [key] = args else {
        return "-ERR PERSIST requires key".to_string();
    };
    if engine.persist(key) {
        "1".to_string()
    } else {
        "0".to_string()
    }
}

fn cmd_keys(args: &[&str], engine: &Engine) -> String {
    let pattern = args.first().copied().unwrap_or("*");
    let mut keys = engine.keys(pattern);
    if keys.is_empty() {
        return "(empty list)".to_string();
    }
    keys.sort();
    keys.join("\n")
}

fn cmd_scan(args: &[&str], engine: &Engine) -> String {
    if args.is_empty() {
        return "-ERR invalid cursor/count".to_string();
    }
    let Ok(cursor) = args[0].parse::<usize>() else {
        return "-ERR invalid cursor/count".to_string();
    };
    let mut pattern = "*".to_string();
    let mut count = 10usize;
    let mut idx = 1;
    while idx < args.len() {
        match args[idx].to_ascii_uppercase().as_str() {
            "MATCH" => {
                let Some(p) = args.get(idx + 1) else {
                    return "-ERR invalid cursor/count".to_string();
                };
                pattern = p.to_string();
                idx += 2;
            }
            "COUNT" => {
                let Some(n) = args.get(idx + 1).and_then(|n| n.parse::<usize>().ok()) else {
                    return "-ERR invalid cursor/count".to_string();
                };
                if n == 0 {
                    return "-ERR invalid cursor/count".to_string();
                }
                count = n;
                idx += 2;
            }
            _ => return "-ERR invalid cursor/count".to_string(),
        }
    }

    let (next_cursor, batch, _has_more) = engine.scan(cursor, &pattern, count);
    let mut lines = vec![next_cursor.to_string()];
    lines.extend(batch);
    lines.join("\n")
}

fn cmd_mset(args: &[&str], engine: &Engine) -> String {
    if args.is_empty() || args.len() % 2 != 0 {
        return "-ERR MSET requires key value pairs".to_string();
    }
    let pairs: Vec<(String, String)> = args
        .chunks(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect();
    match engine.mset(pairs) {
        Ok(()) => "+OK".to_string(),
        Err(err) => format!("-ERR failed to set: {}", err.client_message()),
    }
}

fn cmd_mget(args: &[&str], engine: &Engine) -> String {
    if args.is_empty() {
        return "-ERR MGET requires at least one key".to_string();
    }
    let keys: Vec<String> = args.iter().map(|k| k.to_string()).collect();
    engine
        .mget(&keys)
        .into_iter()
        .map(|v| v.unwrap_or_else(|| "(nil)".to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn cmd_mdel(args: &[&str], engine: &Engine) -> String {
    if args.is_empty() {
        return "-ERR MDEL requires at least one key".to_string();
    }
    let keys: Vec<String> = args.iter().map(|k| k.to_string()).collect();
    match engine.mdel(&keys) {
        Ok(count) => count.to_string(),
        Err(err) => format!("-ERR failed to delete: {}", err.client_message()),
    }
}

fn cmd_incr(args: &[&str], engine: &Engine, delta: i64) -> String {
    let [key] = args else {
        return "-ERR INCR/DECR requires key".to_string();
    };
    match engine.incr_by(key, delta) {
        Ok(value) => value.to_string(),
        Err(err) => format!("-ERR {}", err.client_message()),
    }
}

fn cmd_append(args: &[&str], engine: &Engine) -> String {
    if args.len() < 2 {
        return "-ERR APPEND requires key and value".to_string();
    }
    let value = join_value(&args[1..]);
    match engine.append(args[0], &value) {
        Ok(len) => len.to_string(),
        Err(err) => format!("-ERR failed to append: {}", err.client_message()),
    }
}

fn cmd_strlen(args: &[&str], engine: &Engine) -> String {
    let [key] = args else {
        return "-ERR STRLEN requires key".to_string();
    };
    engine.strlen(key).to_string()
}

fn cmd_clear(engine: &Engine) -> String {
    match engine.clear() {
        Ok(()) => "+OK".to_string(),
        Err(err) => format!("-ERR failed to clear: {}", err.client_message()),
    }
}

fn cmd_info(engine: &Engine, active_connections: &Arc<AtomicU32>) -> String {
    format!(
        "+OK keys={} connections={} wal_size={}",
        engine.len(),
        active_connections.load(Ordering::SeqCst),
        engine.wal_size()
    )
}

fn cmd_stats(engine: &Engine) -> String {
    let ttl_stats = engine.ttl_stats();
    format!(
        "+OK keys={} wal_size={} wal_entries={} needs_compaction={} ttl_expired={} ttl_checks={}",
        engine.len(),
        engine.wal_size(),
        engine.wal_entry_count(),
        engine.needs_compaction(),
        ttl_stats.total_expired,
        ttl_stats.checks_performed
    )
}

fn cmd_health(engine: &Engine) -> String {
    format!(
        "{{\n  \"status\": \"ok\",\n  \"keys\": {},\n  \"wal_size\": {}\n}}",
        engine.len(),
        engine.wal_size()
    )
}

fn cmd_sync(engine: &Engine) -> String {
    match engine.sync() {
        Ok(()) => "+OK".to_string(),
        Err(err) => format!("-ERR failed to sync: {}", err.client_message()),
    }
}

fn cmd_compact(engine: &Engine) -> String {
    match engine.compact() {
        Ok(()) => "+OK".to_string(),
        Err(err) => format!("-ERR failed to compact: {}", err.client_message()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::env;
    use std::fs;
    use std::io::Read as _;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    struct TempDir {
        path: PathBuf,
    }

    impl TempDir {
        fn new() -> Self {
            let unique = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            let mut path = env::temp_dir();
            path.push(format!("kvlite-server-test-{unique}"));
            Self { path }
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn test_engine(dir: &TempDir) -> Engine {
        Engine::open(
            &dir.path,
            EngineConfig {
                sync_mode: true,
                ttl_check_interval: Duration::from_millis(50),
                compaction_interval: Duration::from_secs(3600),
                ..EngineConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn dispatch_covers_basic_commands() {
        let dir = TempDir::new();
        let engine = test_engine(&dir);
        let counter = Arc::new(AtomicU32::new(0));

        assert_eq!(dispatch("PING", &engine, &counter), "+PONG");
        assert_eq!(
            dispatch("SET name Alice", &engine, &counter),
            "+OK".to_string()
        );
        assert_eq!(dispatch("GET name", &engine, &counter), "Alice");
        assert_eq!(
            dispatch("GET missing", &engine, &counter),
            "-ERR key not found"
        );
        assert_eq!(dispatch("EXISTS name", &engine, &counter), "1");
        assert_eq!(dispatch("DEL name", &engine, &counter), "+OK");
        assert_eq!(dispatch("EXISTS name", &engine, &counter), "0");
    }

    #[test]
    fn setex_and_ttl_roundtrip() {
        let dir = TempDir::new();
        let engine = test_engine(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        assert_eq!(
            dispatch("SETEX session 30 abc123", &engine, &counter),
            "+OK"
        );
        let ttl: i64 = dispatch("TTL session", &engine, &counter).parse().unwrap();
        assert!((1..=30).contains(&ttl));
        assert_eq!(
            dispatch("SETEX bad notanumber x", &engine, &counter),
            "-ERR invalid TTL"
        );
    }

    #[test]
    fn incr_decr_and_append() {
        let dir = TempDir::new();
        let engine = test_engine(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        assert_eq!(dispatch("INCR hits", &engine, &counter), "1");
        assert_eq!(dispatch("INCR hits", &engine, &counter), "2");
        assert_eq!(dispatch("DECR hits", &engine, &counter), "1");
        assert_eq!(dispatch("SET msg hello", &engine, &counter), "+OK");
        assert_eq!(dispatch("APPEND msg world", &engine, &counter), "9");
        assert_eq!(dispatch("STRLEN msg", &engine, &counter), "9");
    }

    #[test]
    fn mset_mget_mdel() {
        let dir = TempDir::new();
        let engine = test_engine(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        assert_eq!(dispatch("MSET a 1 b 2", &engine, &counter), "+OK");
        assert_eq!(
            dispatch("MGET a b missing", &engine, &counter),
            "1\n2\n(nil)"
        );
        assert_eq!(dispatch("MDEL a missing", &engine, &counter), "1");
    }

    #[test]
    fn unknown_command_is_rejected() {
        let dir = TempDir::new();
        let engine = test_engine(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        assert_eq!(
            dispatch("FROBNICATE x", &engine, &counter),
            "-ERR unknown command 'FROBNICATE'"
        );
    }

    #[test]
    fn end_to_end_over_tcp() {
        let dir = TempDir::new();
        let engine = test_engine(&dir);
        let server = Server::new(engine, 0);
        let shutdown = server.shutdown_handle();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);

        let addr_string = addr.to_string();
        let run_addr = addr_string.clone();
        let handle = thread::spawn(move || {
            let _ = server.run(&run_addr);
        });
        thread::sleep(Duration::from_millis(100));

        let mut stream = TcpStream::connect(&addr_string).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut welcome = String::new();
        reader.read_line(&mut welcome).unwrap();
        assert_eq!(welcome.trim_end(), WELCOME);

        writeln!(stream, "SET a 1").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "+OK");

        writeln!(stream, "GET a").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "1");

        writeln!(stream, "QUIT").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "+OK goodbye");

        let mut trailing = [0u8; 1];
        let _ = reader.read(&mut trailing);

        shutdown.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(&addr_string);
        let _ = handle.join();
    }
}
