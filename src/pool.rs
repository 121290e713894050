//! Shared, latched page cache.
//!
//! A pool owns a fixed set of page-sized frames for one page size. Frames
//! are found through a hash index keyed by (volume id, page address) and
//! recycled through an LRU list plus an invalid-frame list. Claims are
//! owned rwlock guards with acquisition deadlines: reader claims are
//! counted, writer claims record the owning thread, and FIXED frames
//! (volume head pages) are never evicted.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{PersistitError, Result};
use crate::journal::JournalManager;
use crate::page::{self, PageType};
use crate::volume::{Volume, VolumeRegistry};

type ReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// One cache slot.
pub struct Frame {
    data: Arc<RwLock<Box<[u8]>>>,
    meta: Mutex<FrameMeta>,
}

#[derive(Clone, Debug, Default)]
struct FrameMeta {
    valid: bool,
    dirty: bool,
    fixed: bool,
    volume_id: u64,
    page_address: u64,
    /// Update timestamp of the most recent dirtying write.
    timestamp: u64,
    writer_thread: Option<ThreadId>,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            meta: Mutex::new(FrameMeta::default()),
        }
    }
}

/// Pool statistics. `hit + miss + new == get_total` at all times.
#[derive(Default)]
pub struct PoolCounters {
    pub hit: AtomicU64,
    pub miss: AtomicU64,
    pub new: AtomicU64,
    pub evict: AtomicU64,
    pub write: AtomicU64,
    pub forced_write: AtomicU64,
    pub forced_checkpoint_write: AtomicU64,
    pub get_total: AtomicU64,
    pub reader_claims: AtomicI64,
    pub writer_claims: AtomicI64,
    pub dirty_pages: AtomicI64,
}

struct PoolState {
    index: FxHashMap<(u64, u64), usize>,
    lru: VecDeque<usize>,
    invalid: Vec<usize>,
}

/// A fixed-size cache of page frames for one page size.
pub struct BufferPool {
    page_size: usize,
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    claim_timeout: Duration,
    registry: Arc<VolumeRegistry>,
    journal: OnceLock<Arc<JournalManager>>,
}

impl BufferPool {
    pub fn new(
        page_size: usize,
        frame_count: usize,
        claim_timeout: Duration,
        registry: Arc<VolumeRegistry>,
    ) -> Arc<Self> {
        let frames = (0..frame_count)
            .map(|_| Arc::new(Frame::new(page_size)))
            .collect();
        Arc::new(Self {
            page_size,
            frames,
            state: Mutex::new(PoolState {
                index: FxHashMap::default(),
                lru: VecDeque::with_capacity(frame_count),
                invalid: (0..frame_count).rev().collect(),
            }),
            counters: PoolCounters::default(),
            claim_timeout,
            registry,
            journal: OnceLock::new(),
        })
    }

    /// Wires the journal manager in after construction; called once during
    /// startup, before the pool serves any request.
    pub fn attach_journal(&self, journal: Arc<JournalManager>) {
        let _ = self.journal.set(journal);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    /// Acquires a counted reader claim on the page, loading it if absent.
    pub fn get_shared(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        page_address: u64,
        expected: Option<PageType>,
    ) -> Result<SharedPageGuard> {
        let guard = self.acquire(volume, page_address, false, expected, LoadMode::Read)?;
        match guard {
            AnyGuard::Shared(g) => Ok(g),
            AnyGuard::Exclusive(g) => Ok(g.downgrade()),
        }
    }

    /// Acquires the exclusive writer claim on the page, loading it if
    /// absent.
    pub fn get_exclusive(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        page_address: u64,
        expected: Option<PageType>,
    ) -> Result<ExclusivePageGuard> {
        match self.acquire(volume, page_address, true, expected, LoadMode::Read)? {
            AnyGuard::Exclusive(g) => Ok(g),
            AnyGuard::Shared(_) => Err(PersistitError::IllegalState("expected exclusive claim")),
        }
    }

    /// Claims a frame for a page that has never been written: no read is
    /// issued and the caller must initialize the image.
    pub fn get_new(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        page_address: u64,
    ) -> Result<ExclusivePageGuard> {
        match self.acquire(volume, page_address, true, None, LoadMode::Fresh)? {
            AnyGuard::Exclusive(g) => Ok(g),
            AnyGuard::Shared(_) => Err(PersistitError::IllegalState("expected exclusive claim")),
        }
    }

    /// Marks the frame holding `page_address` as FIXED (never evicted).
    pub fn fix(&self, volume: &Volume, page_address: u64) {
        let state = self.state.lock();
        if let Some(&idx) = state.index.get(&(volume.id(), page_address)) {
            self.frames[idx].meta.lock().fixed = true;
        }
    }

    fn acquire(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        page_address: u64,
        exclusive: bool,
        expected: Option<PageType>,
        mode: LoadMode,
    ) -> Result<AnyGuard> {
        let key = (volume.id(), page_address);
        let deadline = Instant::now() + self.claim_timeout;
        self.counters.get_total.fetch_add(1, Ordering::Relaxed);
        loop {
            let existing = {
                let state = self.state.lock();
                state.index.get(&key).copied()
            };
            if let Some(idx) = existing {
                let frame = self.frames[idx].clone();
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .ok_or(PersistitError::InUse("page claim"))?;
                if exclusive {
                    let Some(guard) = frame.data.try_write_arc_for(remaining) else {
                        return Err(PersistitError::InUse("page claim"));
                    };
                    if !self.identity_matches(idx, key) {
                        drop(guard);
                        continue;
                    }
                    self.counters.hit.fetch_add(1, Ordering::Relaxed);
                    self.touch(idx);
                    return Ok(AnyGuard::Exclusive(self.make_exclusive(idx, guard)));
                } else {
                    let Some(guard) = frame.data.try_read_arc_for(remaining) else {
                        return Err(PersistitError::InUse("page claim"));
                    };
                    if !self.identity_matches(idx, key) {
                        drop(guard);
                        continue;
                    }
                    self.counters.hit.fetch_add(1, Ordering::Relaxed);
                    self.touch(idx);
                    self.counters.reader_claims.fetch_add(1, Ordering::Relaxed);
                    return Ok(AnyGuard::Shared(SharedPageGuard {
                        pool: self.clone(),
                        guard,
                    }));
                }
            }

            // Miss: reserve a victim frame and load into it.
            match self.reserve_frame(key)? {
                Some((idx, guard, evicted)) => {
                    let loaded =
                        self.load_into(idx, guard, evicted, volume, page_address, expected, mode);
                    if loaded.is_err() {
                        // Leave no mapping behind for a frame that never
                        // became valid.
                        let mut state = self.state.lock();
                        if state.index.get(&key) == Some(&idx) {
                            state.index.remove(&key);
                            if let Some(pos) = state.lru.iter().position(|&i| i == idx) {
                                state.lru.remove(pos);
                            }
                            state.invalid.push(idx);
                        }
                    }
                    return loaded;
                }
                None => {
                    if Instant::now() >= deadline {
                        return Err(PersistitError::BufferUnavailable);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn identity_matches(&self, idx: usize, key: (u64, u64)) -> bool {
        let meta = self.frames[idx].meta.lock();
        meta.valid && (meta.volume_id, meta.page_address) == key
    }

    /// Picks an invalid frame, or the least-recently-used unclaimed,
    /// unfixed frame. Returns the write guard plus any dirty image that
    /// must be flushed before reuse.
    #[allow(clippy::type_complexity)]
    fn reserve_frame(
        &self,
        key: (u64, u64),
    ) -> Result<Option<(usize, WriteGuard, Option<EvictedImage>)>> {
        let mut state = self.state.lock();
        if state.index.contains_key(&key) {
            // Another thread loaded it while we were waiting.
            return Ok(None);
        }
        if let Some(idx) = state.invalid.pop() {
            let guard = self.frames[idx]
                .data
                .try_write_arc()
                .ok_or(PersistitError::IllegalState("invalid frame claimed"))?;
            state.index.insert(key, idx);
            state.lru.push_back(idx);
            return Ok(Some((idx, guard, None)));
        }
        let mut chosen: Option<(usize, usize, WriteGuard)> = None;
        for (pos, &idx) in state.lru.iter().enumerate() {
            let meta = self.frames[idx].meta.lock();
            if meta.fixed {
                continue;
            }
            drop(meta);
            if let Some(guard) = self.frames[idx].data.try_write_arc() {
                chosen = Some((pos, idx, guard));
                break;
            }
        }
        let Some((pos, idx, guard)) = chosen else {
            return Ok(None);
        };
        state.lru.remove(pos);
        let mut meta = self.frames[idx].meta.lock();
        let evicted = if meta.valid {
            state.index.remove(&(meta.volume_id, meta.page_address));
            self.counters.evict.fetch_add(1, Ordering::Relaxed);
            if meta.dirty {
                self.counters.dirty_pages.fetch_sub(1, Ordering::Relaxed);
                Some(EvictedImage {
                    volume_id: meta.volume_id,
                    page_address: meta.page_address,
                    timestamp: meta.timestamp,
                })
            } else {
                None
            }
        } else {
            None
        };
        meta.valid = false;
        meta.dirty = false;
        drop(meta);
        state.index.insert(key, idx);
        state.lru.push_back(idx);
        Ok(Some((idx, guard, evicted)))
    }

    #[allow(clippy::too_many_arguments)]
    fn load_into(
        self: &Arc<Self>,
        idx: usize,
        mut guard: WriteGuard,
        evicted: Option<EvictedImage>,
        volume: &Arc<Volume>,
        page_address: u64,
        expected: Option<PageType>,
        mode: LoadMode,
    ) -> Result<AnyGuard> {
        if let Some(image) = evicted {
            // The outgoing image still lives in this frame's buffer; push it
            // to the journal (or straight to a temporary volume) before the
            // buffer is overwritten.
            self.write_back(&image, &guard)?;
        }
        match mode {
            LoadMode::Read => {
                self.counters.miss.fetch_add(1, Ordering::Relaxed);
                let journaled = self
                    .journal
                    .get()
                    .map(|journal| journal.read_page_image(volume, page_address, &mut guard))
                    .transpose()?
                    .unwrap_or(false);
                if !journaled {
                    volume.read_page(page_address, &mut guard)?;
                }
                // Head pages carry their own layout; everything else uses
                // the generic codec header.
                match expected {
                    Some(PageType::Head) => crate::volume::validate_head(&guard)?,
                    other => page::validate(&guard, page_address, other)?,
                }
            }
            LoadMode::Fresh => {
                self.counters.new.fetch_add(1, Ordering::Relaxed);
                guard.fill(0);
            }
        }
        let mut meta = self.frames[idx].meta.lock();
        meta.valid = true;
        meta.dirty = false;
        meta.fixed = false;
        meta.volume_id = volume.id();
        meta.page_address = page_address;
        meta.timestamp = page::timestamp(&guard);
        drop(meta);
        trace!(volume = volume.name(), page_address, "page loaded");
        Ok(AnyGuard::Exclusive(self.make_exclusive(idx, guard)))
    }

    fn make_exclusive(self: &Arc<Self>, idx: usize, guard: WriteGuard) -> ExclusivePageGuard {
        self.counters.writer_claims.fetch_add(1, Ordering::Relaxed);
        self.frames[idx].meta.lock().writer_thread = Some(thread::current().id());
        ExclusivePageGuard {
            pool: self.clone(),
            frame: self.frames[idx].clone(),
            guard: Some(guard),
        }
    }

    fn write_back(&self, image: &EvictedImage, bytes: &[u8]) -> Result<()> {
        let volume = self
            .registry
            .by_id(image.volume_id)
            .ok_or(PersistitError::IllegalState("dirty frame for closed volume"))?;
        self.counters.forced_write.fetch_add(1, Ordering::Relaxed);
        if volume.is_temporary() {
            volume.write_page(image.page_address, bytes)?;
        } else {
            let journal = self
                .journal
                .get()
                .ok_or(PersistitError::IllegalState("journal not attached"))?;
            journal.write_page_image(&volume, image.page_address, image.timestamp, bytes)?;
        }
        self.counters.write.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn touch(&self, idx: usize) {
        let mut state = self.state.lock();
        if let Some(pos) = state.lru.iter().position(|&i| i == idx) {
            state.lru.remove(pos);
            state.lru.push_back(idx);
        }
    }

    pub(crate) fn note_dirty(&self, frame: &Frame, timestamp: u64) {
        let mut meta = frame.meta.lock();
        if !meta.dirty {
            meta.dirty = true;
            self.counters.dirty_pages.fetch_add(1, Ordering::Relaxed);
        }
        meta.timestamp = timestamp;
    }

    /// Appends every dirty page with timestamp ≤ `up_to` to the journal and
    /// cleans it. Used by checkpoints and by close.
    pub fn flush_dirty(&self, up_to: u64, checkpoint: bool) -> Result<usize> {
        let journal = self
            .journal
            .get()
            .ok_or(PersistitError::IllegalState("journal not attached"))?;
        let mut flushed = 0;
        for frame in &self.frames {
            let candidate = {
                let meta = frame.meta.lock();
                meta.valid && meta.dirty && meta.timestamp <= up_to
            };
            if !candidate {
                continue;
            }
            let Some(guard) = frame.data.try_read_arc_for(self.claim_timeout) else {
                return Err(PersistitError::InUse("checkpoint flush"));
            };
            let mut meta = frame.meta.lock();
            if !(meta.valid && meta.dirty && meta.timestamp <= up_to) {
                continue;
            }
            let volume = self
                .registry
                .by_id(meta.volume_id)
                .ok_or(PersistitError::IllegalState("dirty frame for closed volume"))?;
            if volume.is_temporary() {
                volume.write_page(meta.page_address, &guard)?;
            } else {
                journal.write_page_image(&volume, meta.page_address, meta.timestamp, &guard)?;
            }
            meta.dirty = false;
            self.counters.dirty_pages.fetch_sub(1, Ordering::Relaxed);
            self.counters.write.fetch_add(1, Ordering::Relaxed);
            // Checkpoint flushes are forced writes, same as dirty eviction.
            self.counters.forced_write.fetch_add(1, Ordering::Relaxed);
            if checkpoint {
                self.counters
                    .forced_checkpoint_write
                    .fetch_add(1, Ordering::Relaxed);
            }
            flushed += 1;
            drop(meta);
            drop(guard);
        }
        if flushed > 0 {
            debug!(flushed, up_to, checkpoint, "dirty pages flushed");
        }
        Ok(flushed)
    }

    /// Drops every frame belonging to `volume`. Fails with `InUse` when a
    /// claim held elsewhere outlives the deadline; callers retry.
    pub fn invalidate(&self, volume: &Volume) -> Result<()> {
        let deadline = Instant::now() + self.claim_timeout;
        loop {
            let mut busy = false;
            for (idx, frame) in self.frames.iter().enumerate() {
                let matches = {
                    let meta = frame.meta.lock();
                    meta.valid && meta.volume_id == volume.id()
                };
                if !matches {
                    continue;
                }
                let Some(_guard) = frame.data.try_write_arc() else {
                    busy = true;
                    continue;
                };
                let mut state = self.state.lock();
                let mut meta = frame.meta.lock();
                if !(meta.valid && meta.volume_id == volume.id()) {
                    continue;
                }
                state.index.remove(&(meta.volume_id, meta.page_address));
                if let Some(pos) = state.lru.iter().position(|&i| i == idx) {
                    state.lru.remove(pos);
                }
                state.invalid.push(idx);
                if meta.dirty {
                    self.counters.dirty_pages.fetch_sub(1, Ordering::Relaxed);
                }
                meta.valid = false;
                meta.dirty = false;
                meta.fixed = false;
            }
            if !busy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PersistitError::InUse("volume invalidate"));
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn valid_page_count(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.meta.lock().valid)
            .count()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.counters.dirty_pages.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn earliest_dirty_timestamp(&self) -> Option<u64> {
        self.frames
            .iter()
            .filter_map(|f| {
                let meta = f.meta.lock();
                if meta.valid && meta.dirty {
                    Some(meta.timestamp)
                } else {
                    None
                }
            })
            .min()
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.counters.get_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.counters.hit.load(Ordering::Relaxed) as f64 / total as f64
    }
}

#[derive(Clone, Copy)]
enum LoadMode {
    Read,
    Fresh,
}

struct EvictedImage {
    volume_id: u64,
    page_address: u64,
    timestamp: u64,
}

enum AnyGuard {
    Shared(SharedPageGuard),
    Exclusive(ExclusivePageGuard),
}

/// Counted reader claim over one page image.
pub struct SharedPageGuard {
    pool: Arc<BufferPool>,
    guard: ReadGuard,
}

impl Deref for SharedPageGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl Drop for SharedPageGuard {
    fn drop(&mut self) {
        self.pool
            .counters
            .reader_claims
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Exclusive writer claim over one page image.
pub struct ExclusivePageGuard {
    pool: Arc<BufferPool>,
    frame: Arc<Frame>,
    guard: Option<WriteGuard>,
}

impl std::fmt::Debug for ExclusivePageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivePageGuard").finish_non_exhaustive()
    }
}

impl ExclusivePageGuard {
    pub fn bytes(&self) -> &[u8] {
        self.guard.as_ref().expect("guard live")
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.guard.as_mut().expect("guard live")
    }

    /// Records a dirtying write at `timestamp`.
    pub fn mark_dirty(&self, timestamp: u64) {
        self.pool.note_dirty(&self.frame, timestamp);
    }

    /// Releases the writer claim, retaining a reader claim.
    pub fn downgrade(mut self) -> SharedPageGuard {
        let guard = self.guard.take().expect("guard live");
        self.release_writer();
        let read_guard = ArcRwLockWriteGuard::downgrade(guard);
        let pool = self.pool.clone();
        pool.counters.reader_claims.fetch_add(1, Ordering::Relaxed);
        SharedPageGuard {
            pool,
            guard: read_guard,
        }
    }

    fn release_writer(&self) {
        self.pool
            .counters
            .writer_claims
            .fetch_sub(1, Ordering::Relaxed);
        self.frame.meta.lock().writer_thread = None;
    }
}

impl Drop for ExclusivePageGuard {
    fn drop(&mut self) {
        if self.guard.is_some() {
            self.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use crate::volume::test_volume;

    fn pool_with_volume(frames: usize) -> (Arc<BufferPool>, Arc<Volume>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let registry = Arc::new(VolumeRegistry::new());
        let volume = test_volume(&dir, "pool_test", 1024, 64);
        registry.register(volume.clone()).expect("register");
        let pool = BufferPool::new(1024, frames, Duration::from_millis(500), registry);
        (pool, volume, dir)
    }

    #[test]
    fn get_new_then_shared_roundtrip() -> Result<()> {
        let (pool, volume, _dir) = pool_with_volume(8);
        {
            let mut guard = pool.get_new(&volume, 3)?;
            page::init_page(guard.bytes_mut(), PageType::Data, 3, 5);
            guard.mark_dirty(5);
        }
        let guard = pool.get_shared(&volume, 3, Some(PageType::Data))?;
        assert_eq!(page::page_address(&guard), 3);
        assert_eq!(pool.counters().new.load(Ordering::Relaxed), 1);
        assert_eq!(pool.counters().hit.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn counters_sum_to_get_total() -> Result<()> {
        let (pool, volume, _dir) = pool_with_volume(8);
        for addr in 1..5u64 {
            let mut guard = pool.get_new(&volume, addr)?;
            page::init_page(guard.bytes_mut(), PageType::Data, addr, 1);
        }
        for addr in 1..5u64 {
            let _ = pool.get_shared(&volume, addr, None)?;
        }
        let c = pool.counters();
        assert_eq!(
            c.hit.load(Ordering::Relaxed)
                + c.miss.load(Ordering::Relaxed)
                + c.new.load(Ordering::Relaxed),
            c.get_total.load(Ordering::Relaxed)
        );
        Ok(())
    }

    #[test]
    fn exclusive_claim_blocks_second_writer() -> Result<()> {
        let (pool, volume, _dir) = pool_with_volume(8);
        {
            let mut guard = pool.get_new(&volume, 1)?;
            page::init_page(guard.bytes_mut(), PageType::Data, 1, 1);
        }
        let held = pool.get_exclusive(&volume, 1, None)?;
        let err = pool.get_exclusive(&volume, 1, None).unwrap_err();
        assert!(matches!(err, PersistitError::InUse(_)));
        drop(held);
        pool.get_exclusive(&volume, 1, None)?;
        Ok(())
    }

    #[test]
    fn fixed_frames_survive_eviction_pressure() -> Result<()> {
        let (pool, volume, _dir) = pool_with_volume(4);
        {
            let mut guard = pool.get_new(&volume, 1)?;
            page::init_page(guard.bytes_mut(), PageType::Head, 1, 1);
        }
        pool.fix(&volume, 1);
        // Cycle many more pages than frames through the pool.
        for addr in 2..20u64 {
            let mut guard = pool.get_new(&volume, addr)?;
            page::init_page(guard.bytes_mut(), PageType::Data, addr, 1);
        }
        // The fixed frame must still hit.
        let before = pool.counters().hit.load(Ordering::Relaxed);
        let _ = pool.get_shared(&volume, 1, Some(PageType::Head))?;
        assert_eq!(pool.counters().hit.load(Ordering::Relaxed), before + 1);
        Ok(())
    }

    #[test]
    fn invalidate_clears_volume_frames() -> Result<()> {
        let (pool, volume, _dir) = pool_with_volume(8);
        for addr in 1..5u64 {
            let mut guard = pool.get_new(&volume, addr)?;
            page::init_page(guard.bytes_mut(), PageType::Data, addr, 1);
        }
        assert_eq!(pool.valid_page_count(), 4);
        pool.invalidate(&volume)?;
        assert_eq!(pool.valid_page_count(), 0);
        Ok(())
    }

    #[test]
    fn dirty_eviction_writes_back_to_temporary_volume() -> Result<()> {
        let (pool, volume, _dir) = pool_with_volume(2);
        for addr in 1..8u64 {
            let mut guard = pool.get_new(&volume, addr)?;
            page::init_page(guard.bytes_mut(), PageType::Data, addr, addr);
            guard.mark_dirty(addr);
        }
        // Evicted dirty pages must be readable back from the volume file.
        let guard = pool.get_shared(&volume, 1, Some(PageType::Data))?;
        assert_eq!(page::page_address(&guard), 1);
        assert!(pool.counters().forced_write.load(Ordering::Relaxed) > 0);
        Ok(())
    }
}
