#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use persistit::{CommitPolicy, Configuration, Persistit, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const TEN_MIB: usize = 10 * 1024 * 1024;

fn config(dir: &Path) -> Configuration {
    let mut config = Configuration::default();
    config.journal_path = dir.join("journal");
    // Small enough that a 10 MiB value rolls the journal over mid-store.
    config.journal_block_size = 4 * 1024 * 1024;
    config.buffer_pools = vec![(4096, 256)];
    config.commit_policy = CommitPolicy::Hard;
    config.checkpoint_interval_ms = 0;
    config.copier_interval_ms = 3_600_000;
    config.volumes = vec![format!(
        "{},create,bufferSize:4096,initialPages:64,extensionPages:256,maximumPages:8192,alias:main",
        dir.join("main.v01").display()
    )];
    config
}

fn snapshot(from: &Path, to: &Path) {
    fs::create_dir_all(to).expect("mkdir");
    for entry in fs::read_dir(from).expect("read dir") {
        let entry = entry.expect("entry");
        let target = to.join(entry.file_name());
        if entry.file_type().expect("type").is_dir() {
            snapshot(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).expect("copy");
        }
    }
}

#[test]
fn ten_mib_value_survives_crash_after_commit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let live = dir.path().join("live");
    fs::create_dir_all(&live).expect("mkdir");

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut payload = vec![0u8; TEN_MIB];
    rng.fill(payload.as_mut_slice());

    let generations_used;
    {
        let db = Persistit::open(config(&live))?;
        let mut ex = db.exchange("main", "blobs", true)?;
        let mut tx = db.begin()?;
        ex.key.clear().append_str("big")?;
        ex.value.put_bytes(&payload);
        ex.store(Some(&mut tx))?;
        tx.commit()?;
        generations_used = db.journal_info().current_generation;

        // Killed immediately after the commit fsync: snapshot the disk,
        // never close.
        snapshot(&live, &dir.path().join("crash"));
        db.close()?;
    }
    assert!(
        generations_used >= 1,
        "a 10 MiB store should roll the journal over at least once"
    );

    let db = Persistit::open(config(&dir.path().join("crash")))?;
    let mut ex = db.exchange("main", "blobs", false)?;
    ex.key.clear().append_str("big")?;
    ex.fetch(None)?;
    assert!(ex.value.is_defined());
    assert_eq!(ex.value.len(), TEN_MIB);
    assert!(ex.value.as_bytes() == payload.as_slice(), "payload must be bytewise identical");
    db.close()?;
    Ok(())
}

#[test]
fn long_record_round_trips_across_clean_restart() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut payload = vec![0u8; 100_000];
    rng.fill(payload.as_mut_slice());

    {
        let db = Persistit::open(config(dir.path()))?;
        let mut ex = db.exchange("main", "blobs", true)?;
        ex.key.clear().append_str("medium")?;
        ex.value.put_bytes(&payload);
        ex.store(None)?;
        db.close()?;
    }

    let db = Persistit::open(config(dir.path()))?;
    let mut ex = db.exchange("main", "blobs", false)?;
    ex.key.clear().append_str("medium")?;
    ex.fetch(None)?;
    assert_eq!(ex.value.as_bytes(), payload.as_slice());
    db.close()?;
    Ok(())
}
