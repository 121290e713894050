#![allow(missing_docs)]

use persistit::{CommitPolicy, Configuration, Persistit, Result};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Configuration {
    let mut config = Configuration::default();
    config.journal_path = dir.join("journal");
    config.journal_block_size = 8 * 1024 * 1024;
    config.buffer_pools = vec![(4096, 256)];
    config.commit_policy = CommitPolicy::Hard;
    config.checkpoint_interval_ms = 0;
    config.copier_interval_ms = 3_600_000;
    config.volumes = vec![format!(
        "{},create,bufferSize:4096,initialPages:64,extensionPages:64,maximumPages:4096,alias:main",
        dir.join("main.v01").display()
    )];
    config
}

#[test]
fn freed_space_absorbs_new_inserts_without_extending_the_file() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Persistit::open(config(dir.path()))?;
    let mut ex = db.exchange("main", "t", true)?;

    for i in 0..10_000 {
        ex.key.clear().append_str(&format!("k{i:05}"))?;
        ex.value.put_str("0123456789abcdef");
        ex.store(None)?;
    }
    // Remove every other key.
    for i in (0..10_000).step_by(2) {
        ex.key.clear().append_str(&format!("k{i:05}"))?;
        assert!(ex.remove(None)?);
    }
    let pre_remove_pages = db.volume("main")?.page_count();

    // 5k fresh keys must fit into the freed space.
    for i in 0..5_000 {
        ex.key.clear().append_str(&format!("k{i:05}n"))?;
        ex.value.put_str("0123456789abcdef");
        ex.store(None)?;
    }
    let after = db.volume("main")?.page_count();
    assert!(
        after <= pre_remove_pages,
        "file grew from {pre_remove_pages} to {after} pages despite freed space"
    );
    db.close()?;
    Ok(())
}

#[test]
fn removed_tree_pages_return_through_the_garbage_chain() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Persistit::open(config(dir.path()))?;
    {
        let mut ex = db.exchange("main", "doomed", true)?;
        for i in 0..2_000 {
            ex.key.clear().append_str(&format!("k{i:05}"))?;
            ex.value.put_str("some payload bytes");
            ex.store(None)?;
        }
    }
    let high_water = db.volume("main")?.head_state().highest_page_used;
    db.remove_tree("main", "doomed", None)?;

    let mut ex = db.exchange("main", "replacement", true)?;
    for i in 0..2_000 {
        ex.key.clear().append_str(&format!("k{i:05}"))?;
        ex.value.put_str("some payload bytes");
        ex.store(None)?;
    }
    assert!(
        db.volume("main")?.head_state().highest_page_used <= high_water,
        "replacement tree should reuse the removed tree's pages"
    );
    db.close()?;
    Ok(())
}
