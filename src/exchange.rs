//! The Exchange: all key/value operations over one (volume, tree).
//!
//! Reads descend from the tree root through the buffer pool with shared
//! claims, walking right siblings when a concurrent split has moved keys.
//! Writes serialize per tree on the writer latch; splits allocate through
//! the volume and propagate separators upward. Values larger than one
//! page's payload budget spill to LONG_RECORD chains. Transactional writes
//! land as multi-version values tagged with the writer's start timestamp.

use std::sync::Arc;

use tracing::debug;

use crate::error::{PersistitError, Result};
use crate::key::Key;
use crate::keyfilter::KeyFilter;
use crate::mvv::Mvv;
use crate::page::{self, PageEntry, PageType, Search, PAGE_HDR_LEN};
use crate::pool::BufferPool;
use crate::transaction::{Transaction, TxContext};
use crate::tree::{self, Tree, TreeDescriptor, DIRECTORY_TREE_NAME};
use crate::value::{
    encode_inline, LongRecordDescriptor, Value, TAG_INLINE, TAG_LONG_RECORD, TAG_MVV,
};
use crate::volume::Volume;

/// A chain longer than this is a corruption signal.
pub const MAX_LONG_RECORD_CHAIN: u64 = 1 << 20;

/// Traversal directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Eq,
    Gt,
    Gteq,
    Lt,
    Lteq,
}

/// A client's handle onto one (volume, tree), carrying a key and value
/// workspace.
pub struct Exchange {
    ctx: Arc<TxContext>,
    volume: Arc<Volume>,
    tree: Arc<Tree>,
    pool: Arc<BufferPool>,
    pub key: Key,
    pub value: Value,
}

impl Exchange {
    pub fn new(ctx: Arc<TxContext>, volume: Arc<Volume>, tree: Arc<Tree>) -> Result<Self> {
        let pool = ctx.pool_for(volume.page_size())?.clone();
        Ok(Self {
            ctx,
            volume,
            tree,
            pool,
            key: Key::new(),
            value: Value::new(),
        })
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn clear(&mut self) -> &mut Self {
        self.key.clear();
        self.value.clear();
        self
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetches the value at `self.key` into `self.value`.
    pub fn fetch(&mut self, tx: Option<&Transaction>) -> Result<&mut Self> {
        self.volume
            .counters()
            .fetch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tree.bump_fetch();
        let stored = self.fetch_stored(&self.key)?;
        let resolved = match stored {
            Some(bytes) => self.resolve_envelope(&bytes, tx, 0)?,
            None => None,
        };
        self.value.set_fetched(resolved.as_deref());
        Ok(self)
    }

    /// Whether a visible value exists at `self.key`, without copying it.
    pub fn is_value_defined(&mut self, tx: Option<&Transaction>) -> Result<bool> {
        let stored = self.fetch_stored(&self.key)?;
        Ok(match stored {
            Some(bytes) => self.resolve_envelope(&bytes, tx, 0)?.is_some(),
            None => false,
        })
    }

    /// Raw stored bytes at `key`, independent of visibility.
    fn fetch_stored(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        if self.volume.is_corrupt() {
            return Err(PersistitError::Corrupt(format!(
                "volume {} is marked corrupt",
                self.volume.name()
            )));
        }
        let leaf = self.descend(key.encoded())?;
        let mut page_address = leaf;
        loop {
            let guard = self
                .pool
                .get_shared(&self.volume, page_address, Some(PageType::Data))?;
            let list = page::entries(&guard)?;
            match page::search(&list, key.encoded()) {
                Search::Exact(i) => return Ok(Some(list[i].value.clone())),
                Search::Insertion(i) => {
                    // A concurrent split may have moved the key right.
                    if i == list.len() && page::right_sibling(&guard) != 0 {
                        page_address = page::right_sibling(&guard);
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Descends from the root to the data page that covers `key`.
    fn descend(&self, key: &[u8]) -> Result<u64> {
        let (mut page_address, _) = self.tree.root();
        let mut hops = 0u32;
        loop {
            if hops > 64 {
                return Err(PersistitError::Corrupt("tree descent did not terminate".into()));
            }
            hops += 1;
            let guard = self.pool.get_shared(&self.volume, page_address, None)?;
            match page::page_type(&guard)? {
                PageType::Data => return Ok(page_address),
                PageType::Index(_) => {
                    let list = page::entries(&guard)?;
                    if list.is_empty() {
                        return Err(PersistitError::Corrupt("empty index page".into()));
                    }
                    let i = match page::search(&list, key) {
                        Search::Exact(i) => i,
                        Search::Insertion(i) => i.saturating_sub(1),
                    };
                    // Keys at or beyond the last separator may belong to a
                    // right sibling created by an in-flight split.
                    if i == list.len() - 1 && page::right_sibling(&guard) != 0 {
                        let sibling = page::right_sibling(&guard);
                        let moved = {
                            let right = self.pool.get_shared(&self.volume, sibling, None)?;
                            let right_list = page::entries(&right)?;
                            right_list
                                .first()
                                .map(|first| key >= first.key.as_slice())
                                .unwrap_or(false)
                        };
                        if moved {
                            page_address = sibling;
                            continue;
                        }
                    }
                    let child = child_address(&list[i])?;
                    page_address = child;
                }
                other => {
                    return Err(PersistitError::Corrupt(format!(
                        "descent reached {other:?} page"
                    )))
                }
            }
        }
    }

    /// Records the page visited at each level on the way to the leaf.
    /// Index 0 is the leaf. Callers hold the writer latch.
    fn descend_path(&self, key: &[u8]) -> Result<Vec<u64>> {
        let (mut page_address, depth) = self.tree.root();
        let mut path = Vec::with_capacity(depth as usize + 1);
        loop {
            let guard = self.pool.get_shared(&self.volume, page_address, None)?;
            match page::page_type(&guard)? {
                PageType::Data => {
                    path.push(page_address);
                    path.reverse();
                    return Ok(path);
                }
                PageType::Index(_) => {
                    let list = page::entries(&guard)?;
                    if list.is_empty() {
                        return Err(PersistitError::Corrupt("empty index page".into()));
                    }
                    let i = match page::search(&list, key) {
                        Search::Exact(i) => i,
                        Search::Insertion(i) => i.saturating_sub(1),
                    };
                    path.push(page_address);
                    page_address = child_address(&list[i])?;
                }
                other => {
                    return Err(PersistitError::Corrupt(format!(
                        "descent reached {other:?} page"
                    )))
                }
            }
        }
    }

    /// Resolves a stored envelope to the client-visible payload.
    fn resolve_envelope(
        &self,
        stored: &[u8],
        tx: Option<&Transaction>,
        depth: u8,
    ) -> Result<Option<Vec<u8>>> {
        if depth > 4 {
            return Err(PersistitError::Corrupt("value envelope nesting too deep".into()));
        }
        match stored.first() {
            None => Ok(None),
            Some(&TAG_INLINE) => Ok(Some(stored[1..].to_vec())),
            Some(&TAG_LONG_RECORD) => {
                let descriptor = LongRecordDescriptor::decode(stored)?;
                let bytes = self.read_long_record(&descriptor)?;
                self.resolve_envelope(&bytes, tx, depth + 1)
            }
            Some(&TAG_MVV) => {
                let mvv = Mvv::decode(stored)?;
                let snapshot = tx
                    .map(|t| t.start_timestamp())
                    .unwrap_or_else(|| self.ctx.read_snapshot());
                let own = tx.map(|t| t.start_timestamp());
                let index = &self.ctx.index;
                let visible = mvv.visible(snapshot, own, &|ts| index.visibility(ts));
                match visible {
                    Some(version) => self.resolve_envelope(&version.payload, tx, depth + 1),
                    None => Ok(None),
                }
            }
            Some(_) => Err(PersistitError::Corrupt("unknown value envelope tag".into())),
        }
    }

    // ------------------------------------------------------------------
    // Long records
    // ------------------------------------------------------------------

    fn read_long_record(&self, descriptor: &LongRecordDescriptor) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(descriptor.total_size as usize);
        let capacity = page::long_record_capacity(self.volume.page_size());
        let mut page_address = descriptor.chain_head;
        let mut hops = 0u64;
        while out.len() < descriptor.total_size as usize {
            if page_address == 0 {
                return Err(PersistitError::Corrupt("long-record chain ends early".into()));
            }
            hops += 1;
            if hops > MAX_LONG_RECORD_CHAIN {
                return Err(PersistitError::Corrupt("long-record chain too long".into()));
            }
            let guard =
                self.pool
                    .get_shared(&self.volume, page_address, Some(PageType::LongRecord))?;
            let remaining = descriptor.total_size as usize - out.len();
            let take = remaining.min(capacity);
            out.extend_from_slice(&guard[PAGE_HDR_LEN..PAGE_HDR_LEN + take]);
            page_address = page::right_sibling(&guard);
        }
        Ok(out)
    }

    /// Writes `payload` into a fresh LONG_RECORD chain; the page images are
    /// journaled immediately so they precede any TX record referencing
    /// them.
    fn write_long_record(&self, payload: &[u8], timestamp: u64) -> Result<LongRecordDescriptor> {
        let capacity = page::long_record_capacity(self.volume.page_size());
        let chunk_count = payload.len().div_ceil(capacity).max(1);
        let mut addresses = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            addresses.push(
                self.volume
                    .allocate_page(&self.pool, &self.ctx.journal, timestamp)?,
            );
        }
        for (i, chunk) in payload.chunks(capacity).enumerate() {
            let address = addresses[i];
            let mut guard = self.pool.get_new(&self.volume, address)?;
            page::init_page(guard.bytes_mut(), PageType::LongRecord, address, timestamp);
            let next = addresses.get(i + 1).copied().unwrap_or(0);
            page::set_right_sibling(guard.bytes_mut(), next);
            guard.bytes_mut()[PAGE_HDR_LEN..PAGE_HDR_LEN + chunk.len()].copy_from_slice(chunk);
            guard.mark_dirty(timestamp);
            if !self.volume.is_temporary() {
                self.ctx
                    .journal
                    .write_page_image(&self.volume, address, timestamp, guard.bytes())?;
            }
        }
        debug!(
            tree = self.tree.name(),
            pages = chunk_count,
            bytes = payload.len(),
            "long record written"
        );
        Ok(LongRecordDescriptor::new(addresses[0], payload))
    }

    /// Queues every page of a long-record chain for deallocation.
    fn harvest_long_record(&self, descriptor: &LongRecordDescriptor) -> Result<()> {
        let mut page_address = descriptor.chain_head;
        let mut hops = 0u64;
        while page_address != 0 {
            hops += 1;
            if hops > MAX_LONG_RECORD_CHAIN {
                return Err(PersistitError::Corrupt("long-record chain too long".into()));
            }
            let next = {
                let guard = self.pool.get_shared(
                    &self.volume,
                    page_address,
                    Some(PageType::LongRecord),
                )?;
                page::right_sibling(&guard)
            };
            self.volume.defer_deallocate(page_address, page_address);
            page_address = next;
        }
        Ok(())
    }

    /// Harvests every long-record chain referenced from a stored envelope.
    fn harvest_envelope(&self, stored: &[u8]) -> Result<()> {
        match stored.first() {
            Some(&TAG_LONG_RECORD) => {
                let descriptor = LongRecordDescriptor::decode(stored)?;
                self.harvest_long_record(&descriptor)
            }
            Some(&TAG_MVV) => {
                let mvv = Mvv::decode(stored)?;
                for version in mvv.versions() {
                    if version.payload.first() == Some(&TAG_LONG_RECORD) {
                        let descriptor = LongRecordDescriptor::decode(&version.payload)?;
                        self.harvest_long_record(&descriptor)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Spills oversize envelopes to a LONG_RECORD chain.
    fn seal(&self, envelope: Vec<u8>, timestamp: u64) -> Result<Vec<u8>> {
        if envelope.len() >= page::long_record_threshold(self.volume.page_size()) {
            let descriptor = self.write_long_record(&envelope, timestamp)?;
            Ok(descriptor.encode())
        } else {
            Ok(envelope)
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Stores `self.value` at `self.key`.
    ///
    /// With a transaction the write lands as a new MVV version tagged by
    /// the start timestamp and an SR record joins the TX buffer; without
    /// one the stored value is replaced outright.
    pub fn store(&mut self, tx: Option<&mut Transaction>) -> Result<()> {
        if self.key.is_empty() {
            return Err(PersistitError::IllegalState("empty key"));
        }
        if self.key.len() > page::MAX_STORED_KEY {
            return Err(PersistitError::IllegalState("key too long for page"));
        }
        self.volume
            .counters()
            .store
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tree.bump_store();
        let timestamp = self.ctx.tsa.next();
        let inline = encode_inline(self.value.as_bytes());
        let sealed = self.seal(inline, timestamp)?;
        match tx {
            None => {
                let _latch = self.tree.writer_latch();
                let previous = self.insert_stored(&self.key, sealed, timestamp)?;
                if let Some(previous) = previous {
                    self.harvest_envelope(&previous)?;
                }
            }
            Some(tx) => {
                let tree_handle = self
                    .ctx
                    .journal
                    .handle_for_tree(&self.volume, self.tree.name())?;
                let _latch = self.tree.writer_latch();
                let existing = self.fetch_stored(&self.key)?;
                let mut mvv = match existing.as_deref() {
                    Some(stored) if stored.first() == Some(&TAG_MVV) => Mvv::decode(stored)?,
                    Some(stored) => {
                        // Promote a pre-MVCC value to a version visible to
                        // every snapshot.
                        let mut mvv = Mvv::new();
                        mvv.put_resolved(0, false, stored);
                        mvv
                    }
                    None => Mvv::new(),
                };
                mvv.put(tx.start_timestamp(), false, &sealed);
                let encoded = self.seal(mvv.encode(), timestamp)?;
                self.insert_stored(&self.key, encoded, timestamp)?;
                tx.note_store(tree_handle, &self.volume, &self.tree, &self.key, &sealed);
            }
        }
        Ok(())
    }

    /// Stores, returning the previously visible value (read-modify-write).
    pub fn fetch_and_store(&mut self, mut tx: Option<&mut Transaction>) -> Result<Option<Vec<u8>>> {
        let new_value = self.value.as_bytes().to_vec();
        self.fetch(tx.as_deref())?;
        let previous = self
            .value
            .is_defined()
            .then(|| self.value.as_bytes().to_vec());
        self.value.put_bytes(&new_value);
        self.store(tx.as_deref_mut())?;
        Ok(previous)
    }

    /// Removes, returning the previously visible value.
    pub fn fetch_and_remove(&mut self, mut tx: Option<&mut Transaction>) -> Result<Option<Vec<u8>>> {
        self.fetch(tx.as_deref())?;
        let previous = self
            .value
            .is_defined()
            .then(|| self.value.as_bytes().to_vec());
        self.remove(tx.as_deref_mut())?;
        Ok(previous)
    }

    /// Inserts (or replaces) the stored envelope at `key` under the writer
    /// latch, splitting as needed. Returns the previous stored envelope.
    fn insert_stored(
        &self,
        key: &Key,
        stored: Vec<u8>,
        timestamp: u64,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.descend_path(key.encoded())?;
        let mut previous = None;
        let mut pending = Some((key.encoded().to_vec(), stored));
        for (level, &page_address) in path.iter().enumerate() {
            let Some((insert_key, insert_value)) = pending.take() else {
                break;
            };
            let split = self.insert_into_page(
                page_address,
                &insert_key,
                insert_value,
                level,
                timestamp,
                if level == 0 { Some(&mut previous) } else { None },
            )?;
            if let Some((separator, right_address)) = split {
                let mut child_value = Vec::with_capacity(8);
                child_value.extend_from_slice(&right_address.to_le_bytes());
                if level + 1 < path.len() {
                    pending = Some((separator, child_value));
                } else {
                    self.grow_root(path[level], separator, right_address, timestamp)?;
                }
            }
        }
        Ok(previous)
    }

    /// Inserts one entry into the page, splitting on overflow. Returns the
    /// (separator, new right page) when a split happened.
    #[allow(clippy::too_many_arguments)]
    fn insert_into_page(
        &self,
        page_address: u64,
        key: &[u8],
        value: Vec<u8>,
        level: usize,
        timestamp: u64,
        mut previous_out: Option<&mut Option<Vec<u8>>>,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        let mut guard = self.pool.get_exclusive(&self.volume, page_address, None)?;
        let mut list = page::entries(guard.bytes())?;
        match page::search(&list, key) {
            Search::Exact(i) => {
                if let Some(out) = previous_out.as_deref_mut() {
                    *out = Some(std::mem::take(&mut list[i].value));
                }
                list[i].value = value;
            }
            Search::Insertion(i) => {
                list.insert(
                    i,
                    PageEntry {
                        key: key.to_vec(),
                        value,
                    },
                );
            }
        }
        match page::write_entries(guard.bytes_mut(), &list) {
            Ok(()) => {
                page::set_timestamp(guard.bytes_mut(), timestamp);
                guard.mark_dirty(timestamp);
                Ok(None)
            }
            Err(PersistitError::PageFull) => {
                if list.len() < 2 {
                    return Err(PersistitError::IllegalState(
                        "record does not fit on one page",
                    ));
                }
                let split_index = page::choose_split(&list).clamp(1, list.len() - 1);
                let right_list = list.split_off(split_index);
                let right_address =
                    self.volume
                        .allocate_page(&self.pool, &self.ctx.journal, timestamp)?;
                let page_type = if level == 0 {
                    PageType::Data
                } else {
                    PageType::Index(level as u8)
                };
                {
                    let mut right = self.pool.get_new(&self.volume, right_address)?;
                    page::init_page(right.bytes_mut(), page_type, right_address, timestamp);
                    page::set_right_sibling(
                        right.bytes_mut(),
                        page::right_sibling(guard.bytes()),
                    );
                    page::write_entries(right.bytes_mut(), &right_list)?;
                    right.mark_dirty(timestamp);
                }
                page::write_entries(guard.bytes_mut(), &list)?;
                page::set_right_sibling(guard.bytes_mut(), right_address);
                page::set_timestamp(guard.bytes_mut(), timestamp);
                guard.mark_dirty(timestamp);
                let separator = right_list[0].key.clone();
                debug!(
                    tree = self.tree.name(),
                    page_address,
                    right_address,
                    "page split"
                );
                Ok(Some((separator, right_address)))
            }
            Err(other) => Err(other),
        }
    }

    /// Installs a new root above `old_root` after a root split.
    fn grow_root(
        &self,
        old_root: u64,
        separator: Vec<u8>,
        right_address: u64,
        timestamp: u64,
    ) -> Result<()> {
        let (_, depth) = self.tree.root();
        let new_root = self
            .volume
            .allocate_page(&self.pool, &self.ctx.journal, timestamp)?;
        let mut guard = self.pool.get_new(&self.volume, new_root)?;
        page::init_page(
            guard.bytes_mut(),
            PageType::Index(depth + 1),
            new_root,
            timestamp,
        );
        let mut left_value = Vec::with_capacity(8);
        left_value.extend_from_slice(&old_root.to_le_bytes());
        let mut right_value = Vec::with_capacity(8);
        right_value.extend_from_slice(&right_address.to_le_bytes());
        let list = vec![
            PageEntry {
                key: Key::left_guard().encoded().to_vec(),
                value: left_value,
            },
            PageEntry {
                key: separator,
                value: right_value,
            },
        ];
        page::write_entries(guard.bytes_mut(), &list)?;
        guard.mark_dirty(timestamp);
        drop(guard);
        self.tree.set_root(new_root, depth + 1);
        debug!(tree = self.tree.name(), new_root, depth = depth + 1, "root grew");
        self.persist_root(timestamp)
    }

    /// Persists a root/depth change: head page for the directory tree,
    /// directory entry for everything else.
    fn persist_root(&self, timestamp: u64) -> Result<()> {
        if self.tree.is_directory() {
            self.volume.set_directory_root(
                self.tree.root().0,
                &self.pool,
                &self.ctx.journal,
                timestamp,
            )
        } else {
            store_tree_descriptor(&self.ctx, &self.volume, &self.tree)
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Removes the key. Transactional removes write a tombstone version;
    /// plain removes delete the entry physically and may join pages.
    /// Returns whether a visible value was present.
    pub fn remove(&mut self, tx: Option<&mut Transaction>) -> Result<bool> {
        self.volume
            .counters()
            .remove
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tree.bump_remove();
        match tx {
            None => {
                let _latch = self.tree.writer_latch();
                let removed = self.remove_physical(&self.key)?;
                Ok(removed)
            }
            Some(tx) => {
                let was_defined = self.is_value_defined(Some(&*tx))?;
                let tree_handle = self
                    .ctx
                    .journal
                    .handle_for_tree(&self.volume, self.tree.name())?;
                let timestamp = self.ctx.tsa.next();
                let _latch = self.tree.writer_latch();
                let existing = self.fetch_stored(&self.key)?;
                let mut mvv = match existing.as_deref() {
                    Some(stored) if stored.first() == Some(&TAG_MVV) => Mvv::decode(stored)?,
                    Some(stored) => {
                        let mut mvv = Mvv::new();
                        mvv.put_resolved(0, false, stored);
                        mvv
                    }
                    None => Mvv::new(),
                };
                mvv.put(tx.start_timestamp(), true, &[]);
                let encoded = self.seal(mvv.encode(), timestamp)?;
                self.insert_stored(&self.key, encoded, timestamp)?;
                tx.note_delete_range(tree_handle, &self.volume, &self.tree, &self.key, &self.key);
                Ok(was_defined)
            }
        }
    }

    /// Physically deletes the entry, harvesting long records and joining
    /// an emptied page into its level chain. Caller holds the writer
    /// latch.
    fn remove_physical(&self, key: &Key) -> Result<bool> {
        let timestamp = self.ctx.tsa.next();
        let path = self.descend_path(key.encoded())?;
        let leaf = path[0];
        let (removed, emptied) = {
            let mut guard = self.pool.get_exclusive(&self.volume, leaf, Some(PageType::Data))?;
            let mut list = page::entries(guard.bytes())?;
            match page::search(&list, key.encoded()) {
                Search::Exact(i) => {
                    let entry = list.remove(i);
                    page::write_entries(guard.bytes_mut(), &list)?;
                    page::set_timestamp(guard.bytes_mut(), timestamp);
                    guard.mark_dirty(timestamp);
                    (Some(entry.value), list.is_empty())
                }
                Search::Insertion(_) => (None, false),
            }
        };
        let Some(previous) = removed else {
            return Ok(false);
        };
        self.harvest_envelope(&previous)?;
        if emptied && path.len() > 1 {
            self.join_empty_page(&path, timestamp)?;
        }
        Ok(true)
    }

    /// Unlinks the emptied leaf `path[0]` from its parent and level chain
    /// and queues it for deallocation.
    fn join_empty_page(&self, path: &[u64], timestamp: u64) -> Result<()> {
        let leaf = path[0];
        let parent = path[1];
        let mut parent_guard =
            self.pool
                .get_exclusive(&self.volume, parent, None)?;
        let mut list = page::entries(parent_guard.bytes())?;
        let Some(position) = list
            .iter()
            .position(|entry| child_address(entry).ok() == Some(leaf))
        else {
            return Ok(());
        };
        if position == 0 {
            // Leftmost child anchors the level chain; keep the empty page.
            return Ok(());
        }
        let left_sibling = child_address(&list[position - 1])?;
        {
            let mut left_guard = self
                .pool
                .get_exclusive(&self.volume, left_sibling, None)?;
            let leaf_guard = self
                .pool
                .get_exclusive(&self.volume, leaf, Some(PageType::Data))?;
            if page::key_count(leaf_guard.bytes()) != 0 {
                return Ok(());
            }
            let next = page::right_sibling(leaf_guard.bytes());
            page::set_right_sibling(left_guard.bytes_mut(), next);
            page::set_timestamp(left_guard.bytes_mut(), timestamp);
            left_guard.mark_dirty(timestamp);
        }
        list.remove(position);
        page::write_entries(parent_guard.bytes_mut(), &list)?;
        page::set_timestamp(parent_guard.bytes_mut(), timestamp);
        parent_guard.mark_dirty(timestamp);
        drop(parent_guard);
        self.volume.defer_deallocate(leaf, leaf);
        debug!(tree = self.tree.name(), page = leaf, "empty page joined out");
        self.shrink_root(timestamp)
    }

    /// Collapses a single-child root after joins.
    fn shrink_root(&self, timestamp: u64) -> Result<()> {
        loop {
            let (root, depth) = self.tree.root();
            if depth == 0 {
                return Ok(());
            }
            let only_child = {
                let guard = self.pool.get_shared(&self.volume, root, None)?;
                if !page::page_type(&guard)?.is_index() {
                    return Ok(());
                }
                let list = page::entries(&guard)?;
                if list.len() != 1 {
                    return Ok(());
                }
                child_address(&list[0])?
            };
            self.tree.set_root(only_child, depth - 1);
            self.volume.defer_deallocate(root, root);
            self.persist_root(timestamp)?;
            debug!(tree = self.tree.name(), new_root = only_child, "root shrank");
        }
    }

    /// Removes every key in `[key_low, key_high]`. Returns the count of
    /// removed (or tombstoned) keys.
    pub fn remove_range(
        &mut self,
        key_low: &Key,
        key_high: &Key,
        mut tx: Option<&mut Transaction>,
    ) -> Result<usize> {
        if let Some(tx) = tx.as_deref_mut() {
            let tree_handle = self
                .ctx
                .journal
                .handle_for_tree(&self.volume, self.tree.name())?;
            tx.note_delete_range(tree_handle, &self.volume, &self.tree, key_low, key_high);
        }
        let mut removed = 0;
        let mut probe = key_low.encoded().to_vec();
        let mut inclusive = true;
        loop {
            let Some((next_key, _)) = self.next_entry(&probe, inclusive)? else {
                break;
            };
            if next_key.as_slice() > key_high.encoded() {
                break;
            }
            let target = Key::from_encoded(&next_key);
            match tx.as_deref_mut() {
                None => {
                    let _latch = self.tree.writer_latch();
                    self.remove_physical(&target)?;
                }
                Some(tx) => {
                    let timestamp = self.ctx.tsa.next();
                    let _latch = self.tree.writer_latch();
                    let existing = self.fetch_stored(&target)?;
                    let mut mvv = match existing.as_deref() {
                        Some(stored) if stored.first() == Some(&TAG_MVV) => Mvv::decode(stored)?,
                        Some(stored) => {
                            let mut mvv = Mvv::new();
                            mvv.put_resolved(0, false, stored);
                            mvv
                        }
                        None => Mvv::new(),
                    };
                    mvv.put(tx.start_timestamp(), true, &[]);
                    let encoded = mvv.encode();
                    self.insert_stored(&target, encoded, timestamp)?;
                }
            }
            removed += 1;
            probe = next_key;
            inclusive = false;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Moves `self.key`/`self.value` to the next key satisfying the
    /// direction and optional filter. Returns whether one was found.
    ///
    /// Restartable across page boundaries: only the current key anchors
    /// the position, so concurrent splits neither skip nor duplicate
    /// pre-existing records.
    pub fn traverse(
        &mut self,
        direction: Direction,
        filter: Option<&KeyFilter>,
        tx: Option<&Transaction>,
    ) -> Result<bool> {
        self.volume
            .counters()
            .traverse
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tree.bump_traverse();
        if let Some(filter) = filter {
            if filter.term_count() == 0 {
                return Ok(false);
            }
        }
        match direction {
            Direction::Eq => {
                let stored = self.fetch_stored(&self.key)?;
                let visible = match stored {
                    Some(bytes) => self.resolve_envelope(&bytes, tx, 0)?,
                    None => None,
                };
                if let Some(filter) = filter {
                    if !filter.matches(&self.key) {
                        return Ok(false);
                    }
                }
                match visible {
                    Some(payload) => {
                        self.value.set_fetched(Some(&payload));
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Direction::Gt | Direction::Gteq => {
                let mut probe = self.key.encoded().to_vec();
                let mut inclusive = direction == Direction::Gteq;
                loop {
                    let Some((next_key, stored)) = self.next_entry(&probe, inclusive)? else {
                        return Ok(false);
                    };
                    probe = next_key.clone();
                    inclusive = false;
                    let candidate = Key::from_encoded(&next_key);
                    if let Some(filter) = filter {
                        if !filter.matches(&candidate) {
                            continue;
                        }
                    }
                    if let Some(payload) = self.resolve_envelope(&stored, tx, 0)? {
                        self.key = candidate;
                        self.value.set_fetched(Some(&payload));
                        return Ok(true);
                    }
                }
            }
            Direction::Lt | Direction::Lteq => {
                let mut probe = if self.key.is_empty() {
                    Key::right_guard().encoded().to_vec()
                } else {
                    self.key.encoded().to_vec()
                };
                let mut inclusive = direction == Direction::Lteq;
                loop {
                    let (root, _) = self.tree.root();
                    let Some((prev_key, stored)) = self.prev_in(root, &probe, inclusive)? else {
                        return Ok(false);
                    };
                    probe = prev_key.clone();
                    inclusive = false;
                    let candidate = Key::from_encoded(&prev_key);
                    if let Some(filter) = filter {
                        if !filter.matches(&candidate) {
                            continue;
                        }
                    }
                    if let Some(payload) = self.resolve_envelope(&stored, tx, 0)? {
                        self.key = candidate;
                        self.value.set_fetched(Some(&payload));
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Whether any visible key exists strictly after `self.key` that
    /// extends it (a logical-child probe).
    pub fn has_children(&mut self, tx: Option<&Transaction>) -> Result<bool> {
        let prefix = self.key.encoded().to_vec();
        let Some((next_key, stored)) = self.next_entry(&prefix, false)? else {
            return Ok(false);
        };
        if !next_key.starts_with(&prefix) {
            return Ok(false);
        }
        Ok(self.resolve_envelope(&stored, tx, 0)?.is_some())
    }

    /// Raw physical walk over stored entries, ignoring visibility; used by
    /// the recovery pruner.
    pub(crate) fn probe_entry(
        &self,
        probe: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.next_entry(probe, inclusive)
    }

    /// The first entry at or after `probe` in key order.
    fn next_entry(&self, probe: &[u8], inclusive: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut page_address = self.descend(probe)?;
        let mut hops = 0u64;
        loop {
            hops += 1;
            if hops > MAX_LONG_RECORD_CHAIN {
                return Err(PersistitError::Corrupt("leaf chain cycle".into()));
            }
            let guard = self
                .pool
                .get_shared(&self.volume, page_address, Some(PageType::Data))?;
            let list = page::entries(&guard)?;
            let index = match page::search(&list, probe) {
                Search::Exact(i) => {
                    if inclusive {
                        i
                    } else {
                        i + 1
                    }
                }
                Search::Insertion(i) => i,
            };
            if index < list.len() {
                let entry = &list[index];
                return Ok(Some((entry.key.clone(), entry.value.clone())));
            }
            let sibling = page::right_sibling(&guard);
            if sibling == 0 {
                return Ok(None);
            }
            page_address = sibling;
        }
    }

    /// The last entry at or before `probe` in the subtree rooted at
    /// `page_address`.
    fn prev_in(
        &self,
        page_address: u64,
        probe: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let guard = self.pool.get_shared(&self.volume, page_address, None)?;
        match page::page_type(&guard)? {
            PageType::Data => {
                let list = page::entries(&guard)?;
                let index = match page::search(&list, probe) {
                    Search::Exact(i) => {
                        if inclusive {
                            return Ok(Some((list[i].key.clone(), list[i].value.clone())));
                        }
                        i
                    }
                    Search::Insertion(i) => i,
                };
                if index == 0 {
                    return Ok(None);
                }
                let entry = &list[index - 1];
                Ok(Some((entry.key.clone(), entry.value.clone())))
            }
            PageType::Index(_) => {
                let list = page::entries(&guard)?;
                if list.is_empty() {
                    return Ok(None);
                }
                let mut index = match page::search(&list, probe) {
                    Search::Exact(i) => i,
                    Search::Insertion(i) => i.saturating_sub(1),
                };
                drop(guard);
                loop {
                    let entries = {
                        let guard = self.pool.get_shared(&self.volume, page_address, None)?;
                        page::entries(&guard)?
                    };
                    if index >= entries.len() {
                        return Ok(None);
                    }
                    let child = child_address(&entries[index])?;
                    let result = if index == entries.len() - 1
                        || entries[index + 1].key.as_slice() > probe
                    {
                        self.prev_in(child, probe, inclusive)?
                    } else {
                        self.prev_in(child, Key::right_guard().encoded(), false)?
                    };
                    if let Some(found) = result {
                        return Ok(Some(found));
                    }
                    if index == 0 {
                        return Ok(None);
                    }
                    index -= 1;
                }
            }
            other => Err(PersistitError::Corrupt(format!(
                "traversal reached {other:?} page"
            ))),
        }
    }

    /// Every (left, right) page run belonging to this tree, level by
    /// level, for whole-tree deallocation.
    pub fn tree_page_runs(&self) -> Result<Vec<(u64, u64)>> {
        let _latch = self.tree.writer_latch();
        let mut runs = Vec::new();
        let (root, _) = self.tree.root();
        let mut level_start = root;
        loop {
            // Collect this level's chain.
            let mut page_address = level_start;
            let mut first_child = None;
            let mut is_data = false;
            while page_address != 0 {
                let guard = self.pool.get_shared(&self.volume, page_address, None)?;
                match page::page_type(&guard)? {
                    PageType::Data => {
                        is_data = true;
                        // Harvest long records referenced by the leaves.
                        for entry in page::entries(&guard)? {
                            self.harvest_envelope(&entry.value)?;
                        }
                    }
                    PageType::Index(_) => {
                        if first_child.is_none() {
                            let list = page::entries(&guard)?;
                            if let Some(first) = list.first() {
                                first_child = Some(child_address(first)?);
                            }
                        }
                    }
                    other => {
                        return Err(PersistitError::Corrupt(format!(
                            "tree walk reached {other:?} page"
                        )))
                    }
                }
                runs.push((page_address, page_address));
                page_address = page::right_sibling(&guard);
            }
            if is_data {
                return Ok(runs);
            }
            level_start = first_child.ok_or_else(|| {
                PersistitError::Corrupt("index level with no children".into())
            })?;
        }
    }
}

fn child_address(entry: &PageEntry) -> Result<u64> {
    if entry.value.len() != 8 {
        return Err(PersistitError::Corrupt("index entry child malformed".into()));
    }
    Ok(u64::from_le_bytes(entry.value.as_slice().try_into().expect("8 bytes")))
}

// ----------------------------------------------------------------------
// Tree management
// ----------------------------------------------------------------------

/// The canonical `_directory` tree handle for a volume.
pub fn directory_tree(ctx: &Arc<TxContext>, volume: &Arc<Volume>) -> Result<Arc<Tree>> {
    let key = (volume.id(), DIRECTORY_TREE_NAME.to_string());
    if let Some(tree) = ctx.trees.lock().get(&key) {
        return Ok(tree.clone());
    }
    let root = volume.directory_root();
    if root == 0 {
        return Err(PersistitError::IllegalState("directory tree not initialized"));
    }
    let tree = Arc::new(Tree::new(
        DIRECTORY_TREE_NAME,
        volume.id(),
        TreeDescriptor {
            root_page: root,
            depth: directory_depth(ctx, volume, root)?,
            index: 0,
        },
    ));
    ctx.trees.lock().entry(key).or_insert_with(|| tree.clone());
    Ok(tree)
}

fn directory_depth(ctx: &Arc<TxContext>, volume: &Arc<Volume>, root: u64) -> Result<u8> {
    let pool = ctx.pool_for(volume.page_size())?;
    let guard = pool.get_shared(volume, root, None)?;
    Ok(match page::page_type(&guard)? {
        PageType::Index(level) => level,
        _ => 0,
    })
}

/// Initializes the `_directory` tree of a fresh volume.
pub fn init_directory(ctx: &Arc<TxContext>, volume: &Arc<Volume>) -> Result<()> {
    if volume.directory_root() != 0 {
        return Ok(());
    }
    let timestamp = ctx.tsa.next();
    let pool = ctx.pool_for(volume.page_size())?;
    let root = volume.allocate_page(pool, &ctx.journal, timestamp)?;
    let mut guard = pool.get_new(volume, root)?;
    page::init_page(guard.bytes_mut(), PageType::Data, root, timestamp);
    guard.mark_dirty(timestamp);
    if !volume.is_temporary() {
        ctx.journal
            .write_page_image(volume, root, timestamp, guard.bytes())?;
    }
    drop(guard);
    volume.set_directory_root(root, pool, &ctx.journal, timestamp)?;
    Ok(())
}

/// Looks up a tree by name, loading its descriptor from the directory.
pub fn lookup_tree(
    ctx: &Arc<TxContext>,
    volume: &Arc<Volume>,
    name: &str,
) -> Result<Option<Arc<Tree>>> {
    if name == DIRECTORY_TREE_NAME {
        return Ok(Some(directory_tree(ctx, volume)?));
    }
    let key = (volume.id(), name.to_string());
    if let Some(tree) = ctx.trees.lock().get(&key) {
        return Ok(Some(tree.clone()));
    }
    let directory = directory_tree(ctx, volume)?;
    let mut exchange = Exchange::new(ctx.clone(), volume.clone(), directory)?;
    exchange.key = tree::by_name_key(name)?;
    exchange.fetch(None)?;
    if !exchange.value.is_defined() {
        return Ok(None);
    }
    let descriptor = TreeDescriptor::decode(exchange.value.as_bytes())?;
    let tree = Arc::new(Tree::new(name, volume.id(), descriptor));
    Ok(Some(
        ctx.trees
            .lock()
            .entry(key)
            .or_insert_with(|| tree.clone())
            .clone(),
    ))
}

/// Creates a tree: allocates its root page and inserts both directory
/// entries.
pub fn create_tree(ctx: &Arc<TxContext>, volume: &Arc<Volume>, name: &str) -> Result<Arc<Tree>> {
    if name == DIRECTORY_TREE_NAME {
        return Err(PersistitError::IllegalState("reserved tree name"));
    }
    let _ddl = ctx.ddl_latch.lock();
    if let Some(existing) = lookup_tree(ctx, volume, name)? {
        return Ok(existing);
    }
    let timestamp = ctx.tsa.next();
    let pool = ctx.pool_for(volume.page_size())?;
    let root = volume.allocate_page(pool, &ctx.journal, timestamp)?;
    {
        let mut guard = pool.get_new(volume, root)?;
        page::init_page(guard.bytes_mut(), PageType::Data, root, timestamp);
        guard.mark_dirty(timestamp);
        if !volume.is_temporary() {
            ctx.journal
                .write_page_image(volume, root, timestamp, guard.bytes())?;
        }
    }
    let index = next_tree_index(ctx, volume)?;
    let descriptor = TreeDescriptor {
        root_page: root,
        depth: 0,
        index,
    };
    let tree = Arc::new(Tree::new(name, volume.id(), descriptor));
    store_tree_descriptor(ctx, volume, &tree)?;
    let directory = directory_tree(ctx, volume)?;
    let mut exchange = Exchange::new(ctx.clone(), volume.clone(), directory)?;
    exchange.key = tree::by_index_key(index, name)?;
    exchange.value.clear();
    exchange.value.put_bytes(&[]);
    exchange.store(None)?;
    ctx.trees
        .lock()
        .insert((volume.id(), name.to_string()), tree.clone());
    debug!(volume = volume.name(), tree = name, root, "tree created");
    Ok(tree)
}

fn next_tree_index(ctx: &Arc<TxContext>, volume: &Arc<Volume>) -> Result<u32> {
    let directory = directory_tree(ctx, volume)?;
    let mut exchange = Exchange::new(ctx.clone(), volume.clone(), directory)?;
    let mut highest = 0u32;
    exchange.key.clear();
    exchange.key.append_str("byIndex")?;
    let filter = KeyFilter::parse("{\"byIndex\",*,*}")?;
    while exchange.traverse(Direction::Gt, Some(&filter), None)? {
        if let Ok(segments) = exchange.key.decode_segments() {
            if let Some(crate::key::KeySegment::Int(index)) = segments.get(1) {
                highest = highest.max(*index as u32);
            }
        }
    }
    Ok(highest + 1)
}

/// Writes (or rewrites) a tree's `byName` descriptor entry.
pub fn store_tree_descriptor(
    ctx: &Arc<TxContext>,
    volume: &Arc<Volume>,
    tree: &Arc<Tree>,
) -> Result<()> {
    let directory = directory_tree(ctx, volume)?;
    let mut exchange = Exchange::new(ctx.clone(), volume.clone(), directory)?;
    exchange.key = tree::by_name_key(tree.name())?;
    exchange.value.put_bytes(&tree.descriptor().encode());
    exchange.store(None)
}

/// Removes a tree: deletes both directory entries and queues every page
/// reachable from its root for deallocation. With a transaction, a DT
/// record joins the TX stream.
pub fn remove_tree(
    ctx: &Arc<TxContext>,
    volume: &Arc<Volume>,
    tree: &Arc<Tree>,
    tx: Option<&mut Transaction>,
) -> Result<()> {
    if tree.is_directory() {
        return Err(PersistitError::IllegalState("cannot remove the directory tree"));
    }
    let _ddl = ctx.ddl_latch.lock();
    if let Some(tx) = tx {
        let tree_handle = ctx.journal.handle_for_tree(volume, tree.name())?;
        tx.note_delete_tree(tree_handle);
    }
    let exchange = Exchange::new(ctx.clone(), volume.clone(), tree.clone())?;
    let runs = exchange.tree_page_runs()?;
    let directory = directory_tree(ctx, volume)?;
    let mut dir_exchange = Exchange::new(ctx.clone(), volume.clone(), directory)?;
    dir_exchange.key = tree::by_name_key(tree.name())?;
    dir_exchange.remove(None)?;
    dir_exchange.key = tree::by_index_key(tree.index(), tree.name())?;
    dir_exchange.remove(None)?;
    for (left, right) in runs {
        volume.defer_deallocate(left, right);
    }
    ctx.trees
        .lock()
        .remove(&(volume.id(), tree.name().to_string()));
    debug!(volume = volume.name(), tree = tree.name(), "tree removed");
    Ok(())
}

/// Strips or resolves the MVV at one key after a transaction ends.
pub fn prune_key(
    ctx: &Arc<TxContext>,
    volume: &Arc<Volume>,
    tree: &Arc<Tree>,
    key: &Key,
) -> Result<()> {
    let pool = ctx.pool_for(volume.page_size())?.clone();
    let exchange = Exchange {
        ctx: ctx.clone(),
        volume: volume.clone(),
        tree: tree.clone(),
        pool,
        key: Key::new(),
        value: Value::new(),
    };
    let _latch = tree.writer_latch();
    let Some(stored) = exchange.fetch_stored(key)? else {
        return Ok(());
    };
    if stored.first() != Some(&TAG_MVV) {
        return Ok(());
    }
    let mut mvv = Mvv::decode(&stored)?;
    let before: Vec<Vec<u8>> = mvv.versions().map(|v| v.payload.clone()).collect();
    let floor = ctx
        .index
        .oldest_active()
        .unwrap_or_else(|| ctx.tsa.current());
    let index = &ctx.index;
    mvv.prune(floor, &|ts| index.visibility(ts));
    // Chains referenced only by dropped versions are garbage now.
    let after: Vec<&Vec<u8>> = mvv.versions().map(|v| &v.payload).collect();
    for payload in &before {
        if payload.first() == Some(&TAG_LONG_RECORD) && !after.contains(&payload) {
            let descriptor = LongRecordDescriptor::decode(payload)?;
            exchange.harvest_long_record(&descriptor)?;
        }
    }
    let timestamp = ctx.tsa.next();
    if mvv.is_empty() {
        exchange.remove_physical(key)?;
        return Ok(());
    }
    // A lone resolved tombstone no snapshot can see past is just a dead
    // entry.
    if mvv.version_count() == 1 {
        if let Some(version) = mvv.newest_resolved() {
            if version.tombstone && version.version <= floor {
                exchange.remove_physical(key)?;
                return Ok(());
            }
        }
    }
    let encoded = match collapse(&mvv, floor) {
        Some(envelope) => envelope,
        None => mvv.encode(),
    };
    exchange.insert_stored(key, encoded, timestamp)?;
    Ok(())
}

/// A single resolved live version needs no MVV wrapper, once every active
/// snapshot is at or past its commit timestamp.
fn collapse(mvv: &Mvv, floor: u64) -> Option<Vec<u8>> {
    if mvv.version_count() != 1 {
        return None;
    }
    let version = mvv.newest_resolved()?;
    if version.tombstone || version.version > floor {
        return None;
    }
    Some(version.payload.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitPolicy;
    use crate::journal::test_journal;
    use crate::pool::BufferPool;
    use crate::transaction::accumulator::Accumulators;
    use crate::transaction::{TimestampAllocator, TransactionIndex};
    use crate::volume::{test_volume, VolumeRegistry};
    use parking_lot::Mutex;
    use rustc_hash::FxHashMap;
    use std::time::Duration;

    pub(crate) fn test_context(
        page_size: usize,
        frames: usize,
        pages: u64,
    ) -> (Arc<TxContext>, Arc<Volume>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let registry = Arc::new(VolumeRegistry::new());
        let volume = test_volume(&dir, "exchange_test", page_size, pages);
        registry.register(volume.clone()).expect("register");
        let pool = BufferPool::new(page_size, frames, Duration::from_millis(500), registry);
        let journal = test_journal(&dir, &pool);
        let ctx = Arc::new(TxContext {
            tsa: Arc::new(TimestampAllocator::new()),
            index: Arc::new(TransactionIndex::new()),
            journal,
            pools: vec![pool],
            accumulators: Arc::new(Accumulators::new()),
            commit_policy: CommitPolicy::Hard,
            trees: Mutex::new(FxHashMap::default()),
            commit_serial: Mutex::new(()),
            ddl_latch: Mutex::new(()),
        });
        init_directory(&ctx, &volume).expect("init directory");
        (ctx, volume, dir)
    }

    fn exchange_for(
        ctx: &Arc<TxContext>,
        volume: &Arc<Volume>,
        name: &str,
    ) -> Exchange {
        let tree = create_tree(ctx, volume, name).expect("create tree");
        Exchange::new(ctx.clone(), volume.clone(), tree).expect("exchange")
    }

    fn put(ex: &mut Exchange, key: &str, value: &str) {
        ex.key.clear();
        ex.key.append_str(key).expect("key");
        ex.value.put_str(value);
        ex.store(None).expect("store");
    }

    fn get(ex: &mut Exchange, key: &str) -> Option<String> {
        ex.key.clear();
        ex.key.append_str(key).expect("key");
        ex.fetch(None).expect("fetch");
        ex.value
            .is_defined()
            .then(|| String::from_utf8(ex.value.as_bytes().to_vec()).expect("utf8"))
    }

    #[test]
    fn store_and_fetch_roundtrip() {
        let (ctx, volume, _dir) = test_context(1024, 64, 16);
        let mut ex = exchange_for(&ctx, &volume, "t");
        put(&mut ex, "hello", "world");
        assert_eq!(get(&mut ex, "hello"), Some("world".to_string()));
        assert_eq!(get(&mut ex, "absent"), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let (ctx, volume, _dir) = test_context(1024, 64, 16);
        let mut ex = exchange_for(&ctx, &volume, "t");
        put(&mut ex, "k", "one");
        put(&mut ex, "k", "two");
        assert_eq!(get(&mut ex, "k"), Some("two".to_string()));
    }

    #[test]
    fn many_keys_split_pages_and_stay_ordered() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        for i in 0..500 {
            put(&mut ex, &format!("key{i:05}"), &format!("value{i:05}"));
        }
        let (_, depth) = ex.tree().root();
        assert!(depth >= 1, "expected at least one split");
        // Full forward traversal returns every key in order.
        ex.key.clear();
        ex.value.clear();
        let mut seen = Vec::new();
        while ex.traverse(Direction::Gt, None, None).expect("traverse") {
            seen.push(String::from_utf8(ex.value.as_bytes().to_vec()).expect("utf8"));
        }
        assert_eq!(seen.len(), 500);
        assert_eq!(seen[0], "value00000");
        assert_eq!(seen[499], "value00499");
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn backward_traversal_mirrors_forward() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        for i in 0..200 {
            put(&mut ex, &format!("key{i:04}"), "v");
        }
        ex.key.clear();
        let mut backward = Vec::new();
        while ex.traverse(Direction::Lt, None, None).expect("traverse") {
            backward.push(format!("{:?}", ex.key));
        }
        assert_eq!(backward.len(), 200);
        assert!(backward.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn traverse_with_filter_restricts_results() {
        let (ctx, volume, _dir) = test_context(1024, 64, 32);
        let mut ex = exchange_for(&ctx, &volume, "t");
        for name in ["apple", "banana", "cherry"] {
            put(&mut ex, name, "fruit");
        }
        let filter = KeyFilter::parse("{\"b\":\"c\"}").expect("filter");
        ex.key.clear();
        let mut matched = Vec::new();
        while ex.traverse(Direction::Gt, Some(&filter), None).expect("traverse") {
            matched.push(format!("{:?}", ex.key));
        }
        assert_eq!(matched, vec!["{\"banana\"}"]);
        // Empty filter matches nothing.
        ex.key.clear();
        assert!(!ex
            .traverse(Direction::Gt, Some(&KeyFilter::empty()), None)
            .expect("traverse"));
    }

    #[test]
    fn physical_remove_deletes_and_joins() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        for i in 0..300 {
            put(&mut ex, &format!("key{i:04}"), "value");
        }
        for i in 0..300 {
            ex.key.clear();
            ex.key.append_str(&format!("key{i:04}")).expect("key");
            assert!(ex.remove(None).expect("remove"));
        }
        ex.key.clear();
        assert!(!ex.traverse(Direction::Gt, None, None).expect("traverse"));
        // Pages were queued for reuse: new inserts must not extend the file.
        let before = volume.head_state().highest_page_used;
        for i in 0..300 {
            put(&mut ex, &format!("key{i:04}"), "value");
        }
        assert_eq!(volume.head_state().highest_page_used, before);
    }

    #[test]
    fn long_values_round_trip_through_chains() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        ex.key.clear();
        ex.key.append_str("big").expect("key");
        ex.value.put_bytes(&big);
        ex.store(None).expect("store");
        ex.value.clear();
        ex.fetch(None).expect("fetch");
        assert_eq!(ex.value.as_bytes(), &big[..]);
    }

    #[test]
    fn long_value_boundary_is_exact() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        let threshold = page::long_record_threshold(1024);
        // One byte under the payload budget stays inline (envelope adds 1).
        let inline = vec![7u8; threshold - 2];
        ex.key.clear();
        ex.key.append_str("inline").expect("key");
        ex.value.put_bytes(&inline);
        ex.store(None).expect("store");
        let pages_before = volume.head_state().highest_page_used;
        // One byte more spills to a chain.
        let spilled = vec![7u8; threshold - 1];
        ex.key.clear();
        ex.key.append_str("spilled").expect("key");
        ex.value.put_bytes(&spilled);
        ex.store(None).expect("store");
        assert!(volume.head_state().highest_page_used > pages_before);
        ex.fetch(None).expect("fetch");
        assert_eq!(ex.value.as_bytes(), &spilled[..]);
    }

    #[test]
    fn transactional_visibility_and_rollback() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");

        let mut tx = Transaction::begin(ctx.clone());
        ex.key.clear();
        ex.key.append_str("x").expect("key");
        ex.value.put_str("mine");
        ex.store(Some(&mut tx)).expect("store");

        // The writer sees its own uncommitted value.
        ex.fetch(Some(&tx)).expect("fetch");
        assert_eq!(ex.value.as_bytes(), b"mine");
        // A non-transactional reader does not.
        ex.fetch(None).expect("fetch");
        assert!(!ex.value.is_defined());

        tx.commit().expect("commit");
        ex.fetch(None).expect("fetch");
        assert_eq!(ex.value.as_bytes(), b"mine");

        // A rolled-back overwrite leaves the committed value in place.
        let mut tx2 = Transaction::begin(ctx.clone());
        ex.value.put_str("discarded");
        ex.store(Some(&mut tx2)).expect("store");
        tx2.rollback().expect("rollback");
        ex.fetch(None).expect("fetch");
        assert_eq!(ex.value.as_bytes(), b"mine");
        // Rollback pruning left no MVV wrapper behind.
        let stored = ex.fetch_stored(&ex.key).expect("stored").expect("present");
        assert_ne!(stored.first(), Some(&TAG_MVV));
    }

    #[test]
    fn transactional_remove_is_a_tombstone_until_pruned() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        put(&mut ex, "k", "v");
        let mut tx = Transaction::begin(ctx.clone());
        ex.key.clear();
        ex.key.append_str("k").expect("key");
        assert!(ex.remove(Some(&mut tx)).expect("remove"));
        // Other readers still see the value before commit.
        ex.fetch(None).expect("fetch");
        assert_eq!(ex.value.as_bytes(), b"v");
        tx.commit().expect("commit");
        ex.fetch(None).expect("fetch");
        assert!(!ex.value.is_defined());
    }

    #[test]
    fn directory_lists_created_trees() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let tree = create_tree(&ctx, &volume, "accounts").expect("create");
        assert_eq!(tree.name(), "accounts");
        let found = lookup_tree(&ctx, &volume, "accounts").expect("lookup");
        assert!(found.is_some());
        assert!(lookup_tree(&ctx, &volume, "missing").expect("lookup").is_none());
        // Creating again returns the same handle.
        let again = create_tree(&ctx, &volume, "accounts").expect("create");
        assert_eq!(again.index(), tree.index());
    }

    #[test]
    fn remove_tree_frees_pages_and_directory_entries() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "doomed");
        for i in 0..200 {
            put(&mut ex, &format!("key{i:04}"), "value");
        }
        let tree = ex.tree().clone();
        remove_tree(&ctx, &volume, &tree, None).expect("remove tree");
        assert!(lookup_tree(&ctx, &volume, "doomed").expect("lookup").is_none());
        // Freed pages satisfy new allocations without extending the file.
        let before = volume.head_state().highest_page_used;
        let mut ex2 = exchange_for(&ctx, &volume, "replacement");
        for i in 0..200 {
            put(&mut ex2, &format!("key{i:04}"), "value");
        }
        assert_eq!(volume.head_state().highest_page_used, before);
    }

    #[test]
    fn remove_range_clears_interval() {
        let (ctx, volume, _dir) = test_context(1024, 64, 64);
        let mut ex = exchange_for(&ctx, &volume, "t");
        for i in 0..50 {
            put(&mut ex, &format!("key{i:02}"), "v");
        }
        let mut low = Key::new();
        low.append_str("key10").expect("key");
        let mut high = Key::new();
        high.append_str("key19").expect("key");
        let removed = ex.remove_range(&low, &high, None).expect("remove range");
        assert_eq!(removed, 10);
        assert_eq!(get(&mut ex, "key09"), Some("v".to_string()));
        assert_eq!(get(&mut ex, "key15"), None);
        assert_eq!(get(&mut ex, "key20"), Some("v".to_string()));
    }
}
