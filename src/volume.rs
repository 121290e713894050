//! Volume store: a file of fixed-size pages.
//!
//! Page 0 is the head page: status, signature, version, id, counters,
//! tree-directory and garbage-chain roots. Remaining pages follow the
//! codec in [`crate::page`]. Allocation prefers the session's deferred
//! deallocation queue, then the garbage chain, then file extension bounded
//! by `maximum_pages`. Every allocation path queues a journal image of the
//! head page (and any garbage page it mutates) before the page is handed
//! out.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::{VolumeSpecification, VALID_PAGE_SIZES};
use crate::error::{PersistitError, Result};
use crate::iometer::{IoClass, IoContext, IoMeter};
use crate::journal::JournalManager;
use crate::page::{self, PageType, PAGE_HDR_LEN};
use crate::pool::BufferPool;

/// Head page field layout.
const STATUS: Range<usize> = 0..8;
const SIGNATURE: Range<usize> = 8..16;
const VERSION: Range<usize> = 16..20;
const PAGE_SIZE: Range<usize> = 20..24;
const ID: Range<usize> = 24..32;
const READ_COUNTER: Range<usize> = 32..40;
const WRITE_COUNTER: Range<usize> = 40..48;
const CREATE_TIME: Range<usize> = 48..56;
const OPEN_TIME: Range<usize> = 56..64;
const LAST_READ_TIME: Range<usize> = 64..72;
const LAST_WRITE_TIME: Range<usize> = 72..80;
const LAST_EXTENSION_TIME: Range<usize> = 80..88;
const HIGHEST_PAGE_USED: Range<usize> = 88..96;
const PAGE_COUNT: Range<usize> = 96..104;
const EXTENSION_PAGES: Range<usize> = 104..112;
const MAXIMUM_PAGES: Range<usize> = 112..120;
const FIRST_AVAILABLE_PAGE: Range<usize> = 120..128;
const DIRECTORY_ROOT: Range<usize> = 128..136;
const GARBAGE_ROOT: Range<usize> = 136..144;
const FETCH_COUNTER: Range<usize> = 144..152;
const TRAVERSE_COUNTER: Range<usize> = 152..160;
const STORE_COUNTER: Range<usize> = 160..168;
const REMOVE_COUNTER: Range<usize> = 168..176;
const INITIAL_PAGES: Range<usize> = 176..184;
const TEMPORARY_FLAG: usize = 184;

const STATUS_CLEAN: &[u8; 8] = b"CLEAN \r\n";
const STATUS_DIRTY: &[u8; 8] = b"DIRTY \r\n";
const SIGNATURE_BYTES: &[u8; 8] = b"PERSISTI";

/// Supported on-disk format versions.
pub const MIN_SUPPORTED_VERSION: u32 = 1;
pub const MAX_SUPPORTED_VERSION: u32 = 1;
const CURRENT_VERSION: u32 = 1;

/// Garbage page payload: entry count then (left, right) run pairs.
const GARBAGE_COUNT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 2;
const GARBAGE_ENTRIES: usize = PAGE_HDR_LEN + 2;
const GARBAGE_ENTRY_LEN: usize = 16;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Structural head-page state, held in memory under the head claim.
#[derive(Clone, Debug)]
pub struct HeadState {
    pub version: u32,
    pub create_time: u64,
    pub open_time: u64,
    pub last_extension_time: u64,
    pub highest_page_used: u64,
    pub page_count: u64,
    pub extension_pages: u64,
    pub maximum_pages: u64,
    pub first_available_page: u64,
    pub directory_root: u64,
    pub garbage_root: u64,
    pub initial_pages: u64,
}

/// Per-volume operation counters, folded into the head page on write.
#[derive(Default)]
pub struct VolumeCounters {
    pub read: AtomicU64,
    pub write: AtomicU64,
    pub fetch: AtomicU64,
    pub traverse: AtomicU64,
    pub store: AtomicU64,
    pub remove: AtomicU64,
    pub last_read_time: AtomicU64,
    pub last_write_time: AtomicU64,
}

/// One open volume.
pub struct Volume {
    id: u64,
    name: String,
    path: PathBuf,
    page_size: usize,
    read_only: bool,
    temporary: bool,
    file: Mutex<File>,
    head: Mutex<HeadState>,
    counters: VolumeCounters,
    deferred_dealloc: Mutex<VecDeque<(u64, u64)>>,
    corrupt: AtomicBool,
    closed: AtomicBool,
    last_error: Mutex<Option<String>>,
    io: Arc<IoMeter>,
    /// Journal handle, assigned when the journal first sees this volume.
    journal_handle: AtomicU64,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Creates a volume file, writing its head page.
    pub fn create(spec: &VolumeSpecification, io: Arc<IoMeter>) -> Result<Arc<Self>> {
        let page_size = spec.page_size.ok_or_else(|| {
            PersistitError::UnderSpecifiedVolume("bufferSize required to create".to_string())
        })?;
        if !VALID_PAGE_SIZES.contains(&page_size) {
            return Err(PersistitError::InvalidVolumeSpecification(format!(
                "invalid page size {page_size}"
            )));
        }
        if spec.path.exists() && !spec.temporary {
            return Err(PersistitError::VolumeAlreadyExists(
                spec.path.display().to_string(),
            ));
        }
        let initial_pages = spec.initial_pages.unwrap_or(1).max(1);
        let extension_pages = spec.extension_pages.unwrap_or(initial_pages).max(1);
        let maximum_pages = spec.maximum_pages.unwrap_or(u64::MAX / page_size as u64);
        let id = spec.id.unwrap_or_else(|| rand::thread_rng().gen());
        let now = now_millis();
        let head = HeadState {
            version: CURRENT_VERSION,
            create_time: now,
            open_time: now,
            last_extension_time: now,
            // Page 0 is the head itself.
            highest_page_used: 0,
            page_count: initial_pages.max(1),
            extension_pages,
            maximum_pages,
            first_available_page: 1,
            directory_root: 0,
            garbage_root: 0,
            initial_pages,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&spec.path)?;
        file.set_len(head.page_count * page_size as u64)?;
        let volume = Arc::new(Self {
            id,
            name: spec.name()?,
            path: spec.path.clone(),
            page_size,
            read_only: false,
            temporary: spec.temporary,
            file: Mutex::new(file),
            head: Mutex::new(head),
            counters: VolumeCounters::default(),
            deferred_dealloc: Mutex::new(VecDeque::new()),
            corrupt: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            io,
            journal_handle: AtomicU64::new(0),
        });
        volume.write_head_to_file(false)?;
        info!(name = volume.name, id, page_size, "volume created");
        Ok(volume)
    }

    /// Opens an existing volume, validating signature and version and
    /// marking the file DIRTY while it stays open writable.
    pub fn open(spec: &VolumeSpecification, io: Arc<IoMeter>) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!spec.read_only)
            .open(&spec.path)?;
        let mut probe = [0u8; 24];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut probe)?;
        let page_size = u32::from_le_bytes(probe[PAGE_SIZE.start..PAGE_SIZE.end].try_into().expect("4 bytes"))
            as usize;
        if !VALID_PAGE_SIZES.contains(&page_size) {
            return Err(PersistitError::Corrupt(format!(
                "invalid page size {page_size} in head page"
            )));
        }
        let mut head_bytes = vec![0u8; page_size];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head_bytes)?;
        validate_head(&head_bytes)?;
        let (head, id, counters) = decode_head(&head_bytes);
        let volume = Arc::new(Self {
            id,
            name: spec.name()?,
            path: spec.path.clone(),
            page_size,
            read_only: spec.read_only,
            temporary: spec.temporary,
            file: Mutex::new(file),
            head: Mutex::new(head),
            counters,
            deferred_dealloc: Mutex::new(VecDeque::new()),
            corrupt: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            io,
            journal_handle: AtomicU64::new(0),
        });
        volume.head.lock().open_time = now_millis();
        if !spec.read_only {
            volume.write_head_to_file(true)?;
        }
        info!(name = volume.name, id = volume.id, "volume opened");
        Ok(volume)
    }

    /// Opens or creates per the specification flags.
    pub fn open_with_spec(spec: &VolumeSpecification, io: Arc<IoMeter>) -> Result<Arc<Self>> {
        if spec.create_only {
            return Self::create(spec, io);
        }
        if spec.temporary {
            return Self::create(spec, io);
        }
        if spec.path.exists() {
            Self::open(spec, io)
        } else if spec.create {
            Self::create(spec, io)
        } else {
            Err(PersistitError::UnderSpecifiedVolume(format!(
                "{} does not exist and create was not specified",
                spec.path.display()
            )))
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> &VolumeCounters {
        &self.counters
    }

    pub fn head_state(&self) -> HeadState {
        self.head.lock().clone()
    }

    pub(crate) fn set_journal_handle(&self, handle: i32) {
        self.journal_handle.store(handle as u64, Ordering::Release);
    }

    pub(crate) fn journal_handle(&self) -> i32 {
        self.journal_handle.load(Ordering::Acquire) as i32
    }

    /// Records an error for management introspection; corruption marks the
    /// volume and refuses further writes.
    pub fn record_error(&self, error: &PersistitError) {
        *self.last_error.lock() = Some(error.to_string());
        if matches!(error, PersistitError::Corrupt(_)) {
            self.corrupt.store(true, Ordering::Release);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn reset_last_error(&self) {
        *self.last_error.lock() = None;
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistitError::VolumeClosed(self.name.clone()));
        }
        if self.read_only {
            return Err(PersistitError::ReadOnlyVolume(self.name.clone()));
        }
        if self.is_corrupt() {
            return Err(PersistitError::Corrupt(format!(
                "volume {} is marked corrupt",
                self.name
            )));
        }
        Ok(())
    }

    /// Reads one page image from the file.
    pub fn read_page(&self, page_address: u64, buf: &mut [u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistitError::VolumeClosed(self.name.clone()));
        }
        let offset = page_address * self.page_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..self.page_size])?;
        drop(file);
        self.counters.read.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_read_time
            .store(now_millis(), Ordering::Relaxed);
        self.io.charge(
            IoClass::ReadPageFromVolume,
            self.page_size,
            IoContext {
                volume_handle: self.journal_handle(),
                page_address,
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Writes one page image to the file at its final address.
    pub fn write_page(&self, page_address: u64, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        let offset = page_address * self.page_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf[..self.page_size])?;
        drop(file);
        self.counters.write.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_write_time
            .store(now_millis(), Ordering::Relaxed);
        self.io.charge(
            IoClass::WritePageToVolume,
            self.page_size,
            IoContext {
                volume_handle: self.journal_handle(),
                page_address,
                ..Default::default()
            },
        );
        Ok(())
    }

    pub fn fsync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Current file length in pages.
    pub fn page_count(&self) -> u64 {
        self.head.lock().page_count
    }

    pub fn directory_root(&self) -> u64 {
        self.head.lock().directory_root
    }

    pub(crate) fn set_directory_root(
        self: &Arc<Self>,
        root: u64,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<()> {
        self.head.lock().directory_root = root;
        self.publish_head(pool, journal, timestamp)
    }

    /// Allocates one page: deferred queue first, then the garbage chain,
    /// then file extension. The head image (and any touched garbage page)
    /// is queued to the journal before the address is returned.
    pub fn allocate_page(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<u64> {
        self.check_writable()?;
        // Path 1: deferred deallocations from this session.
        {
            let mut deferred = self.deferred_dealloc.lock();
            while let Some((left, right)) = deferred.pop_front() {
                if left == right {
                    continue;
                }
                if left + 1 < right {
                    deferred.push_front((left + 1, right));
                }
                debug!(volume = self.name, page = left, "page reused from deferred queue");
                return Ok(left);
            }
        }
        // Path 2: the garbage chain.
        if let Some(address) = self.allocate_from_garbage(pool, journal, timestamp)? {
            return Ok(address);
        }
        // Path 3: extend the file.
        self.extend(pool, journal, timestamp)
    }

    fn allocate_from_garbage(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<Option<u64>> {
        let mut head = self.head.lock();
        if head.garbage_root == 0 {
            return Ok(None);
        }
        let root = head.garbage_root;
        let mut guard = pool.get_exclusive(self, root, Some(PageType::Garbage))?;
        let buf = guard.bytes_mut();
        let count = u16::from_le_bytes(buf[GARBAGE_COUNT.start..GARBAGE_COUNT.end].try_into().expect("2 bytes"))
            as usize;
        if count == 0 {
            // Exhausted garbage page: advance the root and hand the page
            // itself out.
            head.garbage_root = page::right_sibling(buf);
            drop(guard);
            self.publish_head_locked(&head, pool, journal, timestamp)?;
            debug!(volume = self.name, page = root, "garbage page itself reallocated");
            return Ok(Some(root));
        }
        let base = GARBAGE_ENTRIES + (count - 1) * GARBAGE_ENTRY_LEN;
        let left = u64::from_le_bytes(buf[base..base + 8].try_into().expect("8 bytes"));
        let right = u64::from_le_bytes(buf[base + 8..base + 16].try_into().expect("8 bytes"));
        if left + 1 >= right {
            buf[GARBAGE_COUNT.start..GARBAGE_COUNT.end]
                .copy_from_slice(&((count - 1) as u16).to_le_bytes());
        } else {
            buf[base..base + 8].copy_from_slice(&(left + 1).to_le_bytes());
        }
        page::set_timestamp(buf, timestamp);
        guard.mark_dirty(timestamp);
        // Write-ahead reservation: the mutated garbage page and head are
        // queued before the page is considered allocated.
        if !self.temporary {
            journal.write_page_image(self, root, timestamp, guard.bytes())?;
        }
        drop(guard);
        self.publish_head_locked(&head, pool, journal, timestamp)?;
        debug!(volume = self.name, page = left, "page reused from garbage chain");
        Ok(Some(left))
    }

    fn extend(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<u64> {
        let mut head = self.head.lock();
        let next = head.highest_page_used + 1;
        if next >= head.page_count {
            let grown = (head.page_count + head.extension_pages).min(head.maximum_pages);
            if next >= grown {
                warn!(volume = self.name, maximum = head.maximum_pages, "volume full");
                return Err(PersistitError::VolumeFull(self.name.clone()));
            }
            self.file
                .lock()
                .set_len(grown * self.page_size as u64)?;
            head.page_count = grown;
            head.last_extension_time = now_millis();
            debug!(volume = self.name, pages = grown, "volume extended");
        }
        head.highest_page_used = next;
        head.first_available_page = next + 1;
        self.publish_head_locked(&head, pool, journal, timestamp)?;
        Ok(next)
    }

    /// Frees the contiguous run `left..=right`, appending it to the garbage
    /// chain (allocating a fresh garbage page when the root is full).
    pub fn deallocate_chain(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        left: u64,
        right: u64,
        timestamp: u64,
    ) -> Result<()> {
        self.check_writable()?;
        let mut head = self.head.lock();
        let capacity = (self.page_size - GARBAGE_ENTRIES) / GARBAGE_ENTRY_LEN;
        if head.garbage_root != 0 {
            let mut guard = pool.get_exclusive(self, head.garbage_root, Some(PageType::Garbage))?;
            let buf = guard.bytes_mut();
            let count =
                u16::from_le_bytes(buf[GARBAGE_COUNT.start..GARBAGE_COUNT.end].try_into().expect("2 bytes"))
                    as usize;
            if count < capacity {
                let base = GARBAGE_ENTRIES + count * GARBAGE_ENTRY_LEN;
                buf[base..base + 8].copy_from_slice(&left.to_le_bytes());
                buf[base + 8..base + 16].copy_from_slice(&(right + 1).to_le_bytes());
                buf[GARBAGE_COUNT.start..GARBAGE_COUNT.end]
                    .copy_from_slice(&((count + 1) as u16).to_le_bytes());
                page::set_timestamp(buf, timestamp);
                guard.mark_dirty(timestamp);
                if !self.temporary {
                    journal.write_page_image(self, head.garbage_root, timestamp, guard.bytes())?;
                }
                return Ok(());
            }
        }
        // Root missing or full: the first freed page becomes the new root.
        let new_root = left;
        let old_root = head.garbage_root;
        let mut guard = pool.get_new(self, new_root)?;
        page::init_page(guard.bytes_mut(), PageType::Garbage, new_root, timestamp);
        let buf = guard.bytes_mut();
        page::set_right_sibling(buf, old_root);
        if left + 1 <= right {
            buf[GARBAGE_COUNT.start..GARBAGE_COUNT.end].copy_from_slice(&1u16.to_le_bytes());
            buf[GARBAGE_ENTRIES..GARBAGE_ENTRIES + 8].copy_from_slice(&(left + 1).to_le_bytes());
            buf[GARBAGE_ENTRIES + 8..GARBAGE_ENTRIES + 16]
                .copy_from_slice(&(right + 1).to_le_bytes());
        }
        guard.mark_dirty(timestamp);
        if !self.temporary {
            journal.write_page_image(self, new_root, timestamp, guard.bytes())?;
        }
        drop(guard);
        head.garbage_root = new_root;
        self.publish_head_locked(&head, pool, journal, timestamp)?;
        Ok(())
    }

    /// Queues a page run for later deallocation; safe to defer, flushed at
    /// checkpoint and close.
    pub fn defer_deallocate(&self, left: u64, right: u64) {
        self.deferred_dealloc.lock().push_back((left, right + 1));
    }

    /// Moves every deferred run onto the durable garbage chain.
    pub fn flush_deferred_deallocations(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<()> {
        loop {
            let run = self.deferred_dealloc.lock().pop_front();
            let Some((left, right_exclusive)) = run else {
                return Ok(());
            };
            if left >= right_exclusive {
                continue;
            }
            self.deallocate_chain(pool, journal, left, right_exclusive - 1, timestamp)?;
        }
    }

    /// Walks the garbage chain and returns every free page address.
    pub fn garbage_pages(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
    ) -> Result<Vec<u64>> {
        let mut free = Vec::new();
        let mut address = self.head.lock().garbage_root;
        let mut hops = 0;
        while address != 0 {
            if hops > self.head.lock().page_count {
                return Err(PersistitError::Corrupt("garbage chain cycle".into()));
            }
            let guard = pool.get_shared(self, address, Some(PageType::Garbage))?;
            let count =
                u16::from_le_bytes(guard[GARBAGE_COUNT.start..GARBAGE_COUNT.end].try_into().expect("2 bytes"))
                    as usize;
            for entry in 0..count {
                let base = GARBAGE_ENTRIES + entry * GARBAGE_ENTRY_LEN;
                let left = u64::from_le_bytes(guard[base..base + 8].try_into().expect("8 bytes"));
                let right =
                    u64::from_le_bytes(guard[base + 8..base + 16].try_into().expect("8 bytes"));
                free.extend(left..right);
            }
            free.push(address);
            address = page::right_sibling(&guard);
            hops += 1;
        }
        Ok(free)
    }

    /// Replaces the in-memory head state from a recovered page-0 image.
    /// The file's own head page is stale after a crash; the journal's
    /// newest image is authoritative.
    pub(crate) fn adopt_head(&self, buf: &[u8]) -> Result<()> {
        validate_head(buf)?;
        let (head, id, counters) = decode_head(buf);
        if id != self.id {
            return Err(PersistitError::Corrupt(format!(
                "recovered head names volume id {id}, expected {}",
                self.id
            )));
        }
        *self.head.lock() = head;
        for (target, source) in [
            (&self.counters.read, &counters.read),
            (&self.counters.write, &counters.write),
            (&self.counters.fetch, &counters.fetch),
            (&self.counters.traverse, &counters.traverse),
            (&self.counters.store, &counters.store),
            (&self.counters.remove, &counters.remove),
            (&self.counters.last_read_time, &counters.last_read_time),
            (&self.counters.last_write_time, &counters.last_write_time),
        ] {
            target.store(source.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        debug!(name = self.name, "head state adopted from journal");
        Ok(())
    }

    /// Publishes the head page image through the pool and the journal.
    fn publish_head(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<()> {
        let head = self.head.lock();
        self.publish_head_locked(&head, pool, journal, timestamp)
    }

    fn publish_head_locked(
        self: &Arc<Self>,
        head: &HeadState,
        pool: &Arc<BufferPool>,
        journal: &Arc<JournalManager>,
        timestamp: u64,
    ) -> Result<()> {
        let mut guard = pool.get_new(self, 0)?;
        self.encode_head_into(head, guard.bytes_mut(), true);
        guard.mark_dirty(timestamp);
        pool.fix(self, 0);
        if !self.temporary {
            journal.write_page_image(self, 0, timestamp, guard.bytes())?;
        }
        Ok(())
    }

    fn encode_head_into(&self, head: &HeadState, buf: &mut [u8], dirty: bool) {
        buf.fill(0);
        buf[STATUS].copy_from_slice(if dirty { STATUS_DIRTY } else { STATUS_CLEAN });
        buf[SIGNATURE].copy_from_slice(SIGNATURE_BYTES);
        buf[VERSION].copy_from_slice(&head.version.to_le_bytes());
        buf[PAGE_SIZE].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        buf[ID].copy_from_slice(&self.id.to_le_bytes());
        buf[READ_COUNTER].copy_from_slice(&self.counters.read.load(Ordering::Relaxed).to_le_bytes());
        buf[WRITE_COUNTER]
            .copy_from_slice(&self.counters.write.load(Ordering::Relaxed).to_le_bytes());
        buf[CREATE_TIME].copy_from_slice(&head.create_time.to_le_bytes());
        buf[OPEN_TIME].copy_from_slice(&head.open_time.to_le_bytes());
        buf[LAST_READ_TIME]
            .copy_from_slice(&self.counters.last_read_time.load(Ordering::Relaxed).to_le_bytes());
        buf[LAST_WRITE_TIME].copy_from_slice(
            &self.counters.last_write_time.load(Ordering::Relaxed).to_le_bytes(),
        );
        buf[LAST_EXTENSION_TIME].copy_from_slice(&head.last_extension_time.to_le_bytes());
        buf[HIGHEST_PAGE_USED].copy_from_slice(&head.highest_page_used.to_le_bytes());
        buf[PAGE_COUNT].copy_from_slice(&head.page_count.to_le_bytes());
        buf[EXTENSION_PAGES].copy_from_slice(&head.extension_pages.to_le_bytes());
        buf[MAXIMUM_PAGES].copy_from_slice(&head.maximum_pages.to_le_bytes());
        buf[FIRST_AVAILABLE_PAGE].copy_from_slice(&head.first_available_page.to_le_bytes());
        buf[DIRECTORY_ROOT].copy_from_slice(&head.directory_root.to_le_bytes());
        buf[GARBAGE_ROOT].copy_from_slice(&head.garbage_root.to_le_bytes());
        buf[FETCH_COUNTER]
            .copy_from_slice(&self.counters.fetch.load(Ordering::Relaxed).to_le_bytes());
        buf[TRAVERSE_COUNTER]
            .copy_from_slice(&self.counters.traverse.load(Ordering::Relaxed).to_le_bytes());
        buf[STORE_COUNTER]
            .copy_from_slice(&self.counters.store.load(Ordering::Relaxed).to_le_bytes());
        buf[REMOVE_COUNTER]
            .copy_from_slice(&self.counters.remove.load(Ordering::Relaxed).to_le_bytes());
        buf[INITIAL_PAGES].copy_from_slice(&head.initial_pages.to_le_bytes());
        buf[TEMPORARY_FLAG] = self.temporary as u8;
    }

    /// Writes the head page straight to the file (open/close transitions).
    fn write_head_to_file(&self, dirty: bool) -> Result<()> {
        let head = self.head.lock().clone();
        let mut buf = vec![0u8; self.page_size];
        self.encode_head_into(&head, &mut buf, dirty);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Resets a temporary volume to its initial page count, dropping every
    /// tree. The caller must have invalidated the volume's buffers first.
    pub fn truncate(&self) -> Result<()> {
        if !self.temporary {
            return Err(PersistitError::IllegalState(
                "only temporary volumes can be truncated",
            ));
        }
        let mut head = self.head.lock();
        head.highest_page_used = 0;
        head.page_count = head.initial_pages.max(1);
        head.first_available_page = 1;
        head.directory_root = 0;
        head.garbage_root = 0;
        self.deferred_dealloc.lock().clear();
        self.file
            .lock()
            .set_len(head.page_count * self.page_size as u64)?;
        info!(name = self.name, "temporary volume truncated");
        Ok(())
    }

    /// Flushes state and marks the file CLEAN. The caller must have
    /// invalidated the volume's buffers first.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.read_only {
            self.write_head_to_file(false)?;
        }
        self.closed.store(true, Ordering::Release);
        info!(name = self.name, "volume closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Validates status, signature and version of a head-page image.
pub fn validate_head(buf: &[u8]) -> Result<()> {
    if buf.len() < 192 {
        return Err(PersistitError::Corrupt("head page too short".into()));
    }
    let status = &buf[STATUS];
    if status != STATUS_CLEAN && status != STATUS_DIRTY {
        return Err(PersistitError::Corrupt("unrecognized head status".into()));
    }
    if &buf[SIGNATURE] != SIGNATURE_BYTES {
        return Err(PersistitError::Corrupt("bad volume signature".into()));
    }
    let version = u32::from_le_bytes(buf[VERSION.start..VERSION.end].try_into().expect("4 bytes"));
    if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
        return Err(PersistitError::Corrupt(format!(
            "unsupported volume version {version}"
        )));
    }
    Ok(())
}

/// Whether the head image was closed cleanly.
pub fn head_is_clean(buf: &[u8]) -> bool {
    &buf[STATUS] == STATUS_CLEAN
}

fn decode_head(buf: &[u8]) -> (HeadState, u64, VolumeCounters) {
    let read_u64 = |range: Range<usize>| u64::from_le_bytes(buf[range].try_into().expect("8 bytes"));
    let head = HeadState {
        version: u32::from_le_bytes(buf[VERSION.start..VERSION.end].try_into().expect("4 bytes")),
        create_time: read_u64(CREATE_TIME),
        open_time: read_u64(OPEN_TIME),
        last_extension_time: read_u64(LAST_EXTENSION_TIME),
        highest_page_used: read_u64(HIGHEST_PAGE_USED),
        page_count: read_u64(PAGE_COUNT),
        extension_pages: read_u64(EXTENSION_PAGES),
        maximum_pages: read_u64(MAXIMUM_PAGES),
        first_available_page: read_u64(FIRST_AVAILABLE_PAGE),
        directory_root: read_u64(DIRECTORY_ROOT),
        garbage_root: read_u64(GARBAGE_ROOT),
        initial_pages: read_u64(INITIAL_PAGES),
    };
    let id = read_u64(ID);
    let counters = VolumeCounters::default();
    counters.read.store(read_u64(READ_COUNTER), Ordering::Relaxed);
    counters.write.store(read_u64(WRITE_COUNTER), Ordering::Relaxed);
    counters
        .last_read_time
        .store(read_u64(LAST_READ_TIME), Ordering::Relaxed);
    counters
        .last_write_time
        .store(read_u64(LAST_WRITE_TIME), Ordering::Relaxed);
    counters.fetch.store(read_u64(FETCH_COUNTER), Ordering::Relaxed);
    counters
        .traverse
        .store(read_u64(TRAVERSE_COUNTER), Ordering::Relaxed);
    counters.store.store(read_u64(STORE_COUNTER), Ordering::Relaxed);
    counters.remove.store(read_u64(REMOVE_COUNTER), Ordering::Relaxed);
    (head, id, counters)
}

/// The set of open volumes, addressed by id or name.
pub struct VolumeRegistry {
    volumes: Mutex<FxHashMap<u64, Arc<Volume>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self {
            volumes: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, volume: Arc<Volume>) -> Result<()> {
        let mut volumes = self.volumes.lock();
        if volumes.values().any(|v| v.name() == volume.name()) {
            return Err(PersistitError::VolumeAlreadyExists(
                volume.name().to_string(),
            ));
        }
        volumes.insert(volume.id(), volume);
        Ok(())
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Volume>> {
        self.volumes.lock().remove(&id)
    }

    pub fn by_id(&self, id: u64) -> Option<Arc<Volume>> {
        self.volumes.lock().get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes
            .lock()
            .values()
            .find(|v| v.name() == name)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Volume>> {
        self.volumes.lock().values().cloned().collect()
    }
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a small temporary volume for unit tests in other modules.
#[cfg(test)]
pub fn test_volume(
    dir: &tempfile::TempDir,
    name: &str,
    page_size: usize,
    pages: u64,
) -> Arc<Volume> {
    let spec = VolumeSpecification {
        path: dir.path().join(format!("{name}.v01")),
        alias: Some(name.to_string()),
        drive: None,
        read_only: false,
        create: false,
        create_only: false,
        temporary: true,
        id: None,
        page_size: Some(page_size),
        initial_pages: Some(pages),
        extension_pages: Some(pages),
        maximum_pages: Some(pages * 16),
    };
    Volume::create(&spec, Arc::new(IoMeter::new())).expect("create test volume")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry_pool(
        volume: &Arc<Volume>,
    ) -> Arc<BufferPool> {
        let registry = Arc::new(VolumeRegistry::new());
        registry.register(volume.clone()).expect("register");
        BufferPool::new(
            volume.page_size(),
            64,
            Duration::from_millis(500),
            registry,
        )
    }

    fn persistent_spec(dir: &tempfile::TempDir, name: &str) -> VolumeSpecification {
        VolumeSpecification::parse(&format!(
            "{},create,bufferSize:1024,initialPages:4,extensionPages:4,maximumPages:16,alias:{name}",
            dir.path().join(format!("{name}.v01")).display()
        ))
        .expect("spec")
    }

    #[test]
    fn create_reopen_preserves_head_fields() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spec = persistent_spec(&dir, "head");
        let id;
        {
            let volume = Volume::create(&spec, Arc::new(IoMeter::new()))?;
            id = volume.id();
            volume.close()?;
        }
        let reopened = Volume::open(&spec, Arc::new(IoMeter::new()))?;
        assert_eq!(reopened.id(), id);
        assert_eq!(reopened.page_size(), 1024);
        let head = reopened.head_state();
        assert_eq!(head.initial_pages, 4);
        assert_eq!(head.maximum_pages, 16);
        Ok(())
    }

    #[test]
    fn clean_close_then_reopen_is_byte_identical() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spec = persistent_spec(&dir, "clean");
        {
            let volume = Volume::create(&spec, Arc::new(IoMeter::new()))?;
            volume.close()?;
        }
        let before = std::fs::read(&spec.path)?;
        assert!(head_is_clean(&before));
        {
            let volume = Volume::open(&spec, Arc::new(IoMeter::new()))?;
            volume.close()?;
        }
        let after = std::fs::read(&spec.path)?;
        // Open bumps open_time; mask it out before comparing.
        let mut masked_before = before.clone();
        let mut masked_after = after.clone();
        masked_before[OPEN_TIME].fill(0);
        masked_after[OPEN_TIME].fill(0);
        assert_eq!(masked_before, masked_after);
        assert!(head_is_clean(&after));
        Ok(())
    }

    #[test]
    fn corrupt_signature_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let spec = persistent_spec(&dir, "sig");
        {
            let volume = Volume::create(&spec, Arc::new(IoMeter::new()))?;
            volume.close()?;
        }
        let mut bytes = std::fs::read(&spec.path)?;
        bytes[9] = b'X';
        std::fs::write(&spec.path, &bytes)?;
        match Volume::open(&spec, Arc::new(IoMeter::new())) {
            Err(PersistitError::Corrupt(message)) => {
                assert!(message.contains("signature"), "unexpected: {message}")
            }
            other => panic!("expected corruption, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn extension_is_bounded_by_maximum_pages() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let volume = test_volume(&dir, "full", 1024, 2);
        let pool = registry_pool(&volume);
        let journal = crate::journal::test_journal(&dir, &pool);
        // maximum_pages = 32 (pages * 16); drain it.
        let mut allocated = 0;
        loop {
            match volume.allocate_page(&pool, &journal, allocated + 1) {
                Ok(_) => allocated += 1,
                Err(PersistitError::VolumeFull(_)) => break,
                Err(other) => return Err(other),
            }
            assert!(allocated < 64, "allocation never hit the maximum");
        }
        assert_eq!(allocated, 31);
        Ok(())
    }

    #[test]
    fn garbage_chain_reuses_freed_pages() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let volume = test_volume(&dir, "garbage", 1024, 8);
        let pool = registry_pool(&volume);
        let journal = crate::journal::test_journal(&dir, &pool);
        let mut ts = 0;
        let mut pages = Vec::new();
        for _ in 0..6 {
            ts += 1;
            pages.push(volume.allocate_page(&pool, &journal, ts)?);
        }
        let before = volume.head_state().highest_page_used;
        // Free a run of three pages; the first becomes the garbage root.
        ts += 1;
        volume.deallocate_chain(&pool, &journal, pages[1], pages[3], ts)?;
        assert_ne!(volume.head_state().garbage_root, 0);
        // Reallocation must come from the chain, not extension.
        ts += 1;
        let reused = volume.allocate_page(&pool, &journal, ts)?;
        assert!(pages[1..=3].contains(&reused));
        assert_eq!(volume.head_state().highest_page_used, before);
        Ok(())
    }

    #[test]
    fn deferred_deallocations_feed_allocation() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let volume = test_volume(&dir, "deferred", 1024, 8);
        let pool = registry_pool(&volume);
        let journal = crate::journal::test_journal(&dir, &pool);
        let first = volume.allocate_page(&pool, &journal, 1)?;
        let second = volume.allocate_page(&pool, &journal, 2)?;
        volume.defer_deallocate(first, second);
        assert_eq!(volume.allocate_page(&pool, &journal, 3)?, first);
        assert_eq!(volume.allocate_page(&pool, &journal, 4)?, second);
        Ok(())
    }
}
