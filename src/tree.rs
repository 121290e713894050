//! Tree descriptors and the per-volume directory tree layout.
//!
//! Every volume carries a reserved `_directory` tree indexing all other
//! trees two ways: `("byName", name)` → descriptor and
//! `("byIndex", index, name)` → null. The directory tree's own root lives
//! in the volume head page.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{PersistitError, Result};
use crate::key::Key;

/// Name of the reserved directory tree.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

const BY_NAME: &str = "byName";
const BY_INDEX: &str = "byIndex";

/// Persisted descriptor of a tree: its root page, depth and index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeDescriptor {
    pub root_page: u64,
    pub depth: u8,
    pub index: u32,
}

impl TreeDescriptor {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.extend_from_slice(&self.root_page.to_le_bytes());
        out.push(self.depth);
        out.extend_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 13 {
            return Err(PersistitError::Corrupt("tree descriptor truncated".into()));
        }
        Ok(Self {
            root_page: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            depth: bytes[8],
            index: u32::from_le_bytes(bytes[9..13].try_into().expect("4 bytes")),
        })
    }
}

/// In-memory handle for one tree.
///
/// The root moves when the tree grows or shrinks; the writer latch
/// serializes structural changes (splits, joins, root moves) per tree.
pub struct Tree {
    name: String,
    volume_id: u64,
    index: u32,
    root: Mutex<(u64, u8)>,
    write_latch: Mutex<()>,
    fetch_counter: AtomicU64,
    traverse_counter: AtomicU64,
    store_counter: AtomicU64,
    remove_counter: AtomicU64,
}

impl Tree {
    pub fn new(name: &str, volume_id: u64, descriptor: TreeDescriptor) -> Self {
        Self {
            name: name.to_string(),
            volume_id,
            index: descriptor.index,
            root: Mutex::new((descriptor.root_page, descriptor.depth)),
            write_latch: Mutex::new(()),
            fetch_counter: AtomicU64::new(0),
            traverse_counter: AtomicU64::new(0),
            store_counter: AtomicU64::new(0),
            remove_counter: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_id(&self) -> u64 {
        self.volume_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_directory(&self) -> bool {
        self.name == DIRECTORY_TREE_NAME
    }

    /// Current (root page, depth).
    pub fn root(&self) -> (u64, u8) {
        *self.root.lock()
    }

    pub fn set_root(&self, page: u64, depth: u8) {
        *self.root.lock() = (page, depth);
    }

    pub fn descriptor(&self) -> TreeDescriptor {
        let (root_page, depth) = self.root();
        TreeDescriptor {
            root_page,
            depth,
            index: self.index,
        }
    }

    /// Serializes structural modification of this tree.
    pub fn writer_latch(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_latch.lock()
    }

    pub fn bump_fetch(&self) {
        self.fetch_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_traverse(&self) {
        self.traverse_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_store(&self) {
        self.store_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_remove(&self) {
        self.remove_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.fetch_counter.load(Ordering::Relaxed),
            self.traverse_counter.load(Ordering::Relaxed),
            self.store_counter.load(Ordering::Relaxed),
            self.remove_counter.load(Ordering::Relaxed),
        )
    }
}

/// Directory key `("byName", name)`.
pub fn by_name_key(name: &str) -> Result<Key> {
    let mut key = Key::new();
    key.append_str(BY_NAME)?.append_str(name)?;
    Ok(key)
}

/// Directory key `("byIndex", index, name)`.
pub fn by_index_key(index: u32, name: &str) -> Result<Key> {
    let mut key = Key::new();
    key.append_str(BY_INDEX)?
        .append_int(index as i64)?
        .append_str(name)?;
    Ok(key)
}

/// Directory key `("accumulator", tree_name, acc_index)` holding
/// checkpointed accumulator base values.
pub fn accumulator_key(tree_name: &str, acc_index: u8) -> Result<Key> {
    let mut key = Key::new();
    key.append_str("accumulator")?
        .append_str(tree_name)?
        .append_int(acc_index as i64)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() -> Result<()> {
        let descriptor = TreeDescriptor {
            root_page: 77,
            depth: 3,
            index: 12,
        };
        assert_eq!(TreeDescriptor::decode(&descriptor.encode())?, descriptor);
        Ok(())
    }

    #[test]
    fn directory_keys_are_ordered_by_name() -> Result<()> {
        let a = by_name_key("alpha")?;
        let b = by_name_key("beta")?;
        assert!(a < b);
        let idx = by_index_key(3, "alpha")?;
        assert!(by_index_key(2, "zeta")? < idx);
        Ok(())
    }

    #[test]
    fn root_updates_are_visible() {
        let tree = Tree::new(
            "t",
            1,
            TreeDescriptor {
                root_page: 5,
                depth: 1,
                index: 1,
            },
        );
        assert_eq!(tree.root(), (5, 1));
        tree.set_root(9, 2);
        assert_eq!(tree.root(), (9, 2));
        assert_eq!(tree.descriptor().root_page, 9);
    }
}
