//! Walks through the common engine operations against a throwaway data
//! directory.
//!
//! Run with:
//!   cargo run --example quickstart

use kvlite::{Engine, EngineConfig};
use std::time::Duration;

fn main() -> std::io::Result<()> {
    let dir = tempfile::tempdir()?;
    let engine = Engine::open(dir.path(), EngineConfig::default())
        .map_err(|err| std::io::Error::other(err.to_string()))?;

    engine
        .set("greeting".to_string(), "hello".to_string())
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    println!("greeting = {:?}", engine.get("greeting"));

    engine
        .set_with_ttl(
            "session".to_string(),
            "token-abc".to_string(),
            Duration::from_secs(30),
        )
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    println!("session ttl = {}s", engine.ttl("session"));

    for i in 0..500 {
        engine
            .set(format!("key{i}"), format!("value{i}"))
            .map_err(|err| std::io::Error::other(err.to_string()))?;
    }
    println!("keys before compaction: {}", engine.len());
    println!("wal entries: {}", engine.wal_entry_count());

    engine
        .compact()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    println!("wal entries after compaction: {}", engine.wal_entry_count());

    engine
        .close()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}
