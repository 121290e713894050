#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use persistit::{CommitPolicy, Configuration, Direction, Persistit, Result};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Configuration {
    let mut config = Configuration::default();
    config.journal_path = dir.join("journal");
    config.journal_block_size = 8 * 1024 * 1024;
    config.buffer_pools = vec![(4096, 256)];
    config.commit_policy = CommitPolicy::Hard;
    config.checkpoint_interval_ms = 0;
    config.volumes = vec![format!(
        "{},create,bufferSize:4096,initialPages:64,extensionPages:64,maximumPages:4096,alias:main",
        dir.join("main.v01").display()
    )];
    config
}

#[test]
fn forward_traversal_never_skips_preexisting_keys_during_splits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Arc::new(Persistit::open(config(dir.path()))?);

    // Pre-existing keys spread across the m..n range.
    let mut preexisting = BTreeSet::new();
    {
        let mut ex = db.exchange("main", "t", true)?;
        for i in 0..100 {
            let key = format!("m{:03}", i * 10);
            ex.key.clear().append_str(&key)?;
            ex.value.put_str("base");
            ex.store(None)?;
            preexisting.insert(format!("{{\"{key}\"}}"));
        }
        // A sentinel after the range, so traversal has a clean stop.
        ex.key.clear().append_str("n")?;
        ex.value.put_str("sentinel");
        ex.store(None)?;
    }

    // Thread B: a thousand inserts between "m" and "n", forcing splits.
    let writer_db = db.clone();
    let writer = thread::spawn(move || -> Result<()> {
        let mut ex = writer_db.exchange("main", "t", false)?;
        for i in 0..1000u32 {
            let slot = (i % 100) * 10;
            let key = format!("m{:03}x{:04}", slot, i);
            ex.key.clear().append_str(&key)?;
            ex.value.put_str("inserted");
            ex.store(None)?;
        }
        Ok(())
    });

    // Thread A: traverse forward from "m", deliberately slowly.
    let mut observed = Vec::new();
    {
        let mut ex = db.exchange("main", "t", false)?;
        ex.key.clear().append_str("m")?;
        while ex.traverse(Direction::Gt, None, None)? {
            let key = format!("{:?}", ex.key);
            if key >= "{\"n\"}".to_string() {
                break;
            }
            observed.push(key);
            thread::sleep(Duration::from_micros(200));
        }
    }
    writer.join().expect("writer thread")?;

    // Strictly ascending: nothing duplicated, nothing revisited.
    assert!(
        observed.windows(2).all(|w| w[0] < w[1]),
        "traversal output must be strictly ascending"
    );
    // Every pre-existing key was observed: a valid superset of the
    // original set.
    let observed_set: BTreeSet<String> = observed.into_iter().collect();
    for key in &preexisting {
        assert!(
            observed_set.contains(key),
            "pre-existing key {key} skipped during concurrent splits"
        );
    }
    let db = Arc::into_inner(db).expect("sole owner");
    db.close()?;
    Ok(())
}

#[test]
fn concurrent_readers_see_consistent_point_lookups() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Arc::new(Persistit::open(config(dir.path()))?);
    {
        let mut ex = db.exchange("main", "t", true)?;
        for i in 0..200 {
            ex.key.clear().append_str(&format!("key{i:04}"))?;
            ex.value.put_str("stable");
            ex.store(None)?;
        }
    }
    let mut readers = Vec::new();
    for reader_id in 0..4 {
        let db = db.clone();
        readers.push(thread::spawn(move || -> Result<()> {
            let mut ex = db.exchange("main", "t", false)?;
            for round in 0..50 {
                let i = (reader_id * 50 + round) % 200;
                ex.key.clear().append_str(&format!("key{i:04}"))?;
                ex.fetch(None)?;
                assert!(ex.value.is_defined());
                assert_eq!(ex.value.as_bytes(), b"stable");
            }
            Ok(())
        }));
    }
    let writer_db = db.clone();
    let writer = thread::spawn(move || -> Result<()> {
        let mut ex = writer_db.exchange("main", "t", false)?;
        for i in 200..400 {
            ex.key.clear().append_str(&format!("key{i:04}"))?;
            ex.value.put_str("stable");
            ex.store(None)?;
        }
        Ok(())
    });
    for reader in readers {
        reader.join().expect("reader thread")?;
    }
    writer.join().expect("writer thread")?;
    let db = Arc::into_inner(db).expect("sole owner");
    db.close()?;
    Ok(())
}
