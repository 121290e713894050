#![allow(missing_docs)]

use std::time::{Duration, Instant};

use persistit::{CommitPolicy, Configuration, Persistit, Result};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Configuration {
    let mut config = Configuration::default();
    config.journal_path = dir.join("journal");
    config.journal_block_size = persistit::config::MIN_BLOCK_SIZE;
    config.buffer_pools = vec![(4096, 128)];
    config.commit_policy = CommitPolicy::Hard;
    config.checkpoint_interval_ms = 0;
    config.copier_interval_ms = 5;
    config.copier_pages_per_pass = 64;
    config.volumes = vec![format!(
        "{},create,bufferSize:4096,initialPages:64,extensionPages:64,maximumPages:4096,alias:main",
        dir.join("main.v01").display()
    )];
    config
}

fn journal_generations(dir: &std::path::Path) -> Vec<u64> {
    let mut generations = Vec::new();
    for entry in std::fs::read_dir(dir.join("journal")).expect("journal dir") {
        let entry = entry.expect("entry");
        let name = entry.file_name();
        let name = name.to_str().expect("utf8 name");
        if let Some(suffix) = name.strip_prefix("persistit_journal.") {
            generations.push(u64::from_str_radix(suffix, 16).expect("hex generation"));
        }
    }
    generations.sort();
    generations
}

#[test]
fn early_generations_become_deletable_after_checkpoint_and_copy_back() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Persistit::open(config(dir.path()))?;
    let mut ex = db.exchange("main", "t", true)?;

    // Push enough page images through the journal to roll several
    // generations.
    for batch in 0..8 {
        for i in 0..500 {
            ex.key.clear().append_str(&format!("k{batch:02}{i:04}"))?;
            ex.value.put_str("payload-payload-payload");
            ex.store(None)?;
        }
        db.checkpoint()?;
    }
    let info = db.journal_info();
    assert!(
        info.current_generation >= 2,
        "expected several journal generations, got {}",
        info.current_generation
    );

    // The copier drains the page map; once the base address passes the
    // early generations their files disappear.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        db.checkpoint()?;
        let info = db.journal_info();
        let generations = journal_generations(dir.path());
        if info.page_map_size == 0
            && info.base_address >= persistit::config::MIN_BLOCK_SIZE
            && generations.first().copied() != Some(0)
        {
            break;
        }
        if Instant::now() > deadline {
            panic!(
                "journal never compacted: page_map={} base={} generations={:?}",
                info.page_map_size, info.base_address, generations
            );
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    db.close()?;
    Ok(())
}

#[test]
fn append_only_mode_pins_journal_files() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Persistit::open(config(dir.path()))?;
    db.set_append_only(true);
    let mut ex = db.exchange("main", "t", true)?;
    for i in 0..2_000 {
        ex.key.clear().append_str(&format!("k{i:05}"))?;
        ex.value.put_str("payload-payload-payload");
        ex.store(None)?;
    }
    db.checkpoint()?;
    std::thread::sleep(Duration::from_millis(100));
    // With the copier suspended the page map retains its backlog.
    let pinned = db.journal_info();
    assert!(pinned.page_map_size > 0, "append-only should pin page images");
    assert_eq!(journal_generations(dir.path()).first().copied(), Some(0));

    // Releasing the mode lets the backlog drain.
    db.set_append_only(false);
    let deadline = Instant::now() + Duration::from_secs(20);
    while db.journal_info().page_map_size > 0 {
        if Instant::now() > deadline {
            panic!("copier never drained after append-only release");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    db.close()?;
    Ok(())
}
