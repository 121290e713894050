#![allow(missing_docs)]

use persistit::{CommitPolicy, Configuration, Direction, Persistit, Result};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> Configuration {
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

#[test]
fn clean_round_trip_preserves_all_pairs() -> Result<()> {
    let dir = tempdir().expect("tmpdir");

    {
        let db = Persistit::open(config(dir.path()))?;
        let mut ex = db.exchange("main", "pairs", true)?;
        let mut tx = db.begin()?;
        for i in 0..100 {
            ex.key.clear().append_str(&format!("k{i:02}"))?;
            ex.value.put_str(&format!("v{i:02}"));
            ex.store(Some(&mut tx))?;
        }
        tx.commit()?;
        db.close()?;
    }

    let db = Persistit::open(config(dir.path()))?;
    let mut ex = db.exchange("main", "pairs", false)?;
    ex.key.clear();
    let mut pairs = Vec::new();
    while ex.traverse(Direction::Gt, None, None)? {
        pairs.push((
            format!("{:?}", ex.key),
            String::from_utf8(ex.value.as_bytes().to_vec()).expect("utf8"),
        ));
    }
    assert_eq!(pairs.len(), 100);
    for (i, (key, value)) in pairs.iter().enumerate() {
        assert_eq!(key, &format!("{{\"k{i:02}\"}}"));
        assert_eq!(value, &format!("v{i:02}"));
    }
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    db.close()?;
    Ok(())
}

#[test]
fn reopen_sees_trees_in_directory() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let db = Persistit::open(config(dir.path()))?;
        db.exchange("main", "alpha", true)?;
        db.exchange("main", "beta", true)?;
        db.close()?;
    }
    let db = Persistit::open(config(dir.path()))?;
    let mut names = db.tree_names("main")?;
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    // Opening a missing tree without create fails cleanly.
    assert!(db.exchange("main", "gamma", false).is_err());
    db.close()?;
    Ok(())
}
