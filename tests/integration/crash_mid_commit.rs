#![allow(missing_docs)]

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use persistit::{CommitPolicy, Configuration, Persistit, Result};
use tempfile::tempdir;

fn config(dir: &Path) -> Configuration {
    let mut config = Configuration::default();
    config.journal_path = dir.join("journal");
    config.journal_block_size = persistit::config::MIN_BLOCK_SIZE;
    config.buffer_pools = vec![(4096, 64)];
    config.commit_policy = CommitPolicy::Hard;
    config.checkpoint_interval_ms = 0;
    config.copier_interval_ms = 3_600_000;
    config.volumes = vec![format!(
        "{},create,bufferSize:4096,initialPages:16,extensionPages:16,maximumPages:256,alias:main",
        dir.join("main.v01").display()
    )];
    config
}

/// Copies the live directory tree to a "crash image" directory, modeling
/// the disk state at the instant of a crash.
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

fn newest_journal_file(dir: &Path) -> std::path::PathBuf {
    let mut files: Vec<_> = fs::read_dir(dir.join("journal"))
        .expect("journal dir")
        .map(|e| e.expect("entry").path())
        .collect();
    files.sort();
    files.pop().expect("at least one journal file")
}

#[test]
fn torn_second_commit_is_dropped_on_recovery() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let live = dir.path().join("live");
    fs::create_dir_all(&live).expect("mkdir");

    let db = Persistit::open(config(&live))?;
    let mut ex = db.exchange("main", "t", true)?;

    let mut t1 = db.begin()?;
    ex.key.clear().append_str("x")?;
    ex.value.put_str("t1-value");
    ex.store(Some(&mut t1))?;
    t1.commit()?;

    // Length of the journal with T1 durable.
    let durable_len = fs::metadata(newest_journal_file(&live)).expect("meta").len();

    let mut t2 = db.begin()?;
    ex.key.clear().append_str("x")?;
    ex.value.put_str("t2-value");
    ex.store(Some(&mut t2))?;
    t2.commit()?;

    // Crash image: everything on disk, with T2's TX record torn mid-way
    // as if the final fsync never completed.
    let crash = dir.path().join("crash");
    snapshot(&live, &crash);
    db.close()?;
    let newest = newest_journal_file(&crash);
    let full_len = fs::metadata(&newest).expect("meta").len();
    assert!(full_len > durable_len, "T2 should have appended records");
    let torn_len = durable_len + (full_len - durable_len) / 2;
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&newest)
        .expect("open journal");
    file.set_len(torn_len).expect("truncate");
    {
        let mut file = file;
        file.seek(SeekFrom::End(0)).expect("seek");
        file.flush().expect("flush");
    }

    let db = Persistit::open(config(&crash))?;
    let mut ex = db.exchange("main", "t", false)?;
    ex.key.clear().append_str("x")?;
    ex.fetch(None)?;
    assert!(ex.value.is_defined(), "T1's committed write must survive");
    assert_eq!(ex.value.as_bytes(), b"t1-value");
    db.close()?;
    Ok(())
}

#[test]
fn unflushed_commit_is_absent_after_crash() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let live = dir.path().join("live");
    fs::create_dir_all(&live).expect("mkdir");

    let db = Persistit::open(config(&live))?;
    let mut ex = db.exchange("main", "t", true)?;

    let mut t1 = db.begin()?;
    ex.key.clear().append_str("x")?;
    ex.value.put_str("t1-value");
    ex.store(Some(&mut t1))?;
    t1.commit()?;

    // Crash before T2 even reaches the journal.
    let crash = dir.path().join("crash");
    snapshot(&live, &crash);

    let mut t2 = db.begin()?;
    ex.key.clear().append_str("x")?;
    ex.value.put_str("t2-value");
    ex.store(Some(&mut t2))?;
    t2.commit()?;
    db.close()?;

    let db = Persistit::open(config(&crash))?;
    let mut ex = db.exchange("main", "t", false)?;
    ex.key.clear().append_str("x")?;
    ex.fetch(None)?;
    assert_eq!(ex.value.as_bytes(), b"t1-value");
    db.close()?;
    Ok(())
}
