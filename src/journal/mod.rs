//! Append-only multi-file journal.
//!
//! All durable state flows through here: page images (PA), transaction
//! updates (TX), identity records (IV/IT), periodic page-map and
//! transaction-map snapshots (PM/TM), checkpoints (CP), and per-file
//! framing (JH/JE). Journal addresses are 64-bit and contiguous across
//! files of `block_size` bytes; `address / block_size` names the file and
//! `address % block_size` the offset within it.
//!
//! A single writer appends into an in-memory buffer; the flusher thread
//! fsyncs up to the flush watermark; the copier drains the page map back
//! to the volume files so old journal files can be deleted.

pub mod record;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::error::{PersistitError, Result};
use crate::iometer::{IoClass, IoContext, IoMeter};
use crate::volume::{Volume, VolumeRegistry};
use record::{
    JournalEnd, JournalHeader, PageMapEntry, TxMapEntry, JOURNAL_VERSION, PA_IMAGE_OFFSET,
    RECORD_HEADER,
};

/// Encoded JE record length.
const JE_LEN: u64 = (RECORD_HEADER + 24) as u64;
/// Buffer size at which pending bytes are pushed to the file early.
const WRITE_THRESHOLD: usize = 1 << 20;
/// Largest ops payload per TX chunk; longer transactions chain chunks.
pub const MAX_TX_CHUNK: usize = 1 << 20;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One live page-image version; lists are kept newest-first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageVersion {
    pub timestamp: u64,
    pub journal_address: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeIdent {
    pub id: u64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeIdent {
    pub volume_handle: i32,
    pub name: String,
}

/// A durable consistency point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub timestamp: u64,
    pub system_time_millis: u64,
    pub journal_address: u64,
}

/// State donated by recovery to seed a running journal manager.
#[derive(Clone, Default)]
pub struct RecoveredState {
    pub current_address: u64,
    pub base_address: u64,
    pub journal_created: u64,
    pub page_map: FxHashMap<(i32, u64), Vec<PageVersion>>,
    pub volumes_by_handle: FxHashMap<i32, VolumeIdent>,
    pub trees_by_handle: FxHashMap<i32, TreeIdent>,
    pub tx_map: FxHashMap<u64, TxMapEntry>,
    pub last_checkpoint: Option<Checkpoint>,
}

struct JournalCore {
    current_address: u64,
    base_address: u64,
    written_address: u64,
    flushed_address: u64,
    buffer: BytesMut,
    buffer_base: u64,
    file: Option<File>,
    journal_created: u64,
    last_timestamp: u64,
    flush_requested: bool,
    page_map: FxHashMap<(i32, u64), Vec<PageVersion>>,
    volumes_by_handle: FxHashMap<i32, VolumeIdent>,
    handle_by_volume_id: FxHashMap<u64, i32>,
    trees_by_handle: FxHashMap<i32, TreeIdent>,
    handle_by_tree: FxHashMap<(i32, String), i32>,
    tx_map: FxHashMap<u64, TxMapEntry>,
    last_checkpoint: Option<Checkpoint>,
    next_handle: i32,
}

/// Manager counters and status surfaced to management snapshots.
#[derive(Clone, Debug, Default)]
pub struct JournalInfo {
    pub current_address: u64,
    pub base_address: u64,
    pub flushed_address: u64,
    pub page_map_size: usize,
    pub tx_map_size: usize,
    pub current_generation: u64,
    pub append_only: bool,
    pub fast_copying: bool,
    pub last_checkpoint_timestamp: Option<u64>,
}

/// The journal manager.
pub struct JournalManager {
    dir: PathBuf,
    prefix: String,
    block_size: u64,
    inner: Mutex<JournalCore>,
    flush_cond: Condvar,
    closing: AtomicBool,
    append_only: AtomicBool,
    fast_copying: AtomicBool,
    io: Arc<IoMeter>,
    registry: Arc<VolumeRegistry>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    copier_interval: Mutex<Duration>,
    copier_pages_per_pass: Mutex<usize>,
    quiescent_kb: u64,
}

impl JournalManager {
    /// Opens a journal manager over `dir`, continuing from `recovered`.
    /// The first append lands in a fresh file at the next block boundary.
    pub fn open(
        dir: &Path,
        prefix: &str,
        block_size: u64,
        io: Arc<IoMeter>,
        registry: Arc<VolumeRegistry>,
        recovered: RecoveredState,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let journal_created = if recovered.journal_created == 0 {
            now_millis()
        } else {
            recovered.journal_created
        };
        let next_handle = recovered
            .volumes_by_handle
            .keys()
            .chain(recovered.trees_by_handle.keys())
            .copied()
            .max()
            .unwrap_or(0)
            + 1;
        let handle_by_volume_id = recovered
            .volumes_by_handle
            .iter()
            .map(|(&handle, ident)| (ident.id, handle))
            .collect();
        let handle_by_tree = recovered
            .trees_by_handle
            .iter()
            .map(|(&handle, ident)| ((ident.volume_handle, ident.name.clone()), handle))
            .collect();
        let manager = Arc::new(Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            block_size,
            inner: Mutex::new(JournalCore {
                current_address: recovered.current_address,
                base_address: recovered.base_address,
                written_address: recovered.current_address,
                flushed_address: recovered.current_address,
                buffer: BytesMut::new(),
                buffer_base: recovered.current_address,
                file: None,
                journal_created,
                last_timestamp: 0,
                flush_requested: false,
                page_map: recovered.page_map,
                volumes_by_handle: recovered.volumes_by_handle,
                handle_by_volume_id,
                trees_by_handle: recovered.trees_by_handle,
                handle_by_tree,
                tx_map: recovered.tx_map,
                last_checkpoint: recovered.last_checkpoint,
                next_handle,
            }),
            flush_cond: Condvar::new(),
            closing: AtomicBool::new(false),
            append_only: AtomicBool::new(false),
            fast_copying: AtomicBool::new(false),
            io,
            registry,
            workers: Mutex::new(Vec::new()),
            copier_interval: Mutex::new(Duration::from_millis(50)),
            copier_pages_per_pass: Mutex::new(32),
            quiescent_kb: 100,
        });
        {
            let mut core = manager.inner.lock();
            manager.start_new_file(&mut core)?;
            manager.flush_locked(&mut core, true)?;
        }
        info!(dir = %dir.display(), prefix, block_size, "journal opened");
        Ok(manager)
    }

    fn file_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("{}.{:016x}", self.prefix, generation))
    }

    /// Advances to the next block boundary and writes JH + PM + TM so the
    /// new file is independently sufficient to begin recovery.
    fn start_new_file(&self, core: &mut JournalCore) -> Result<()> {
        let generation = core.current_address.div_ceil(self.block_size);
        let start = generation * self.block_size;
        core.current_address = start;
        core.written_address = start;
        core.flushed_address = core.flushed_address.max(start);
        core.buffer_base = start;
        core.buffer.clear();
        let path = self.file_path(generation);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        core.file = Some(file);
        let header = JournalHeader {
            version: JOURNAL_VERSION,
            block_size: self.block_size,
            base_address: core.base_address,
            current_address: start,
            journal_created: core.journal_created,
            file_created: now_millis(),
        };
        let timestamp = core.last_timestamp;
        header.encode(timestamp, &mut core.buffer);
        core.current_address += (RECORD_HEADER + record::JH_PAYLOAD) as u64;
        self.append_snapshots(core)?;
        debug!(generation, start, "journal file started");
        Ok(())
    }

    fn append_snapshots(&self, core: &mut JournalCore) -> Result<()> {
        let timestamp = core.last_timestamp;
        let pages: Vec<PageMapEntry> = core
            .page_map
            .iter()
            .flat_map(|(&(volume_handle, page_address), versions)| {
                versions.iter().map(move |v| PageMapEntry {
                    volume_handle,
                    page_address,
                    timestamp: v.timestamp,
                    journal_address: v.journal_address,
                })
            })
            .collect();
        let mut encoded = BytesMut::new();
        record::encode_pm(&pages, timestamp, &mut encoded);
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;

        let txs: Vec<TxMapEntry> = core.tx_map.values().copied().collect();
        let mut encoded = BytesMut::new();
        record::encode_tm(&txs, timestamp, &mut encoded);
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;

        // Replicate the last checkpoint so this file alone can anchor a
        // recovery.
        if let Some(checkpoint) = core.last_checkpoint {
            let mut encoded = BytesMut::new();
            record::encode_cp(
                timestamp,
                checkpoint.timestamp,
                checkpoint.system_time_millis,
                core.base_address,
                &mut encoded,
            );
            core.buffer.extend_from_slice(&encoded);
            core.current_address += encoded.len() as u64;
        }
        Ok(())
    }

    /// Ensures `need` more bytes fit in the current file (leaving room for
    /// the JE), rolling over when they do not.
    fn ensure_room(&self, core: &mut JournalCore, need: usize) -> Result<()> {
        let reserved = (RECORD_HEADER + record::JH_PAYLOAD) as u64 + JE_LEN;
        if need as u64 + reserved > self.block_size {
            return Err(PersistitError::IllegalState(
                "record larger than journal block",
            ));
        }
        let offset = core.current_address % self.block_size;
        if offset + need as u64 + JE_LEN <= self.block_size {
            return Ok(());
        }
        self.rollover(core)
    }

    fn rollover(&self, core: &mut JournalCore) -> Result<()> {
        let end = JournalEnd {
            current_address: core.current_address + JE_LEN,
            base_address: core.base_address,
            journal_created: core.journal_created,
        };
        let timestamp = core.last_timestamp;
        end.encode(timestamp, &mut core.buffer);
        core.current_address += JE_LEN;
        self.flush_locked(core, true)?;
        info!(
            generation = (core.current_address - 1) / self.block_size,
            "journal rollover"
        );
        self.start_new_file(core)
    }

    /// Writes buffered bytes to the current file; optionally fsyncs and
    /// advances the durable watermark.
    fn flush_locked(&self, core: &mut JournalCore, fsync: bool) -> Result<()> {
        if !core.buffer.is_empty() {
            let offset = core.buffer_base % self.block_size;
            let file = core
                .file
                .as_mut()
                .ok_or(PersistitError::IllegalState("journal file not open"))?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&core.buffer)?;
            self.io.charge(
                IoClass::FlushJournal,
                core.buffer.len(),
                IoContext {
                    journal_address: core.buffer_base,
                    ..Default::default()
                },
            );
            core.buffer_base += core.buffer.len() as u64;
            core.written_address = core.buffer_base;
            core.buffer.clear();
        }
        if fsync {
            if let Some(file) = core.file.as_mut() {
                file.sync_data()?;
            }
            core.flushed_address = core.written_address;
            core.flush_requested = false;
            self.flush_cond.notify_all();
        }
        Ok(())
    }

    /// Public flush; used by the flusher worker and hard commits.
    pub fn flush(&self, fsync: bool) -> Result<u64> {
        let mut core = self.inner.lock();
        self.flush_locked(&mut core, fsync)?;
        Ok(core.flushed_address)
    }

    /// Blocks until everything through `address` is fsynced.
    pub fn wait_for_durability(&self, address: u64) -> Result<()> {
        let mut core = self.inner.lock();
        while core.flushed_address < address {
            if self.closing.load(Ordering::Acquire) {
                // Last writer standing: flush inline.
                self.flush_locked(&mut core, true)?;
                continue;
            }
            core.flush_requested = true;
            self.flush_cond.notify_all();
            self.flush_cond
                .wait_for(&mut core, Duration::from_millis(100));
        }
        Ok(())
    }

    fn note_timestamp(core: &mut JournalCore, timestamp: u64) {
        if timestamp > core.last_timestamp {
            core.last_timestamp = timestamp;
        }
    }

    /// Returns (and if necessary assigns, emitting an IV record) the
    /// journal handle for `volume`.
    pub fn handle_for_volume(&self, volume: &Volume) -> Result<i32> {
        let mut core = self.inner.lock();
        self.handle_for_volume_locked(&mut core, volume)
    }

    fn handle_for_volume_locked(&self, core: &mut JournalCore, volume: &Volume) -> Result<i32> {
        if let Some(&handle) = core.handle_by_volume_id.get(&volume.id()) {
            volume.set_journal_handle(handle);
            return Ok(handle);
        }
        let handle = core.next_handle;
        core.next_handle += 1;
        let mut encoded = BytesMut::new();
        record::encode_iv(
            handle,
            volume.id(),
            volume.name(),
            core.last_timestamp,
            &mut encoded,
        );
        self.ensure_room(core, encoded.len())?;
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        core.handle_by_volume_id.insert(volume.id(), handle);
        core.volumes_by_handle.insert(
            handle,
            VolumeIdent {
                id: volume.id(),
                name: volume.name().to_string(),
            },
        );
        volume.set_journal_handle(handle);
        Ok(handle)
    }

    /// Returns (assigning and journaling if new) the handle for a tree.
    pub fn handle_for_tree(&self, volume: &Volume, tree_name: &str) -> Result<i32> {
        let mut core = self.inner.lock();
        let volume_handle = self.handle_for_volume_locked(&mut core, volume)?;
        if let Some(&handle) = core
            .handle_by_tree
            .get(&(volume_handle, tree_name.to_string()))
        {
            return Ok(handle);
        }
        let handle = core.next_handle;
        core.next_handle += 1;
        let mut encoded = BytesMut::new();
        record::encode_it(handle, volume_handle, tree_name, core.last_timestamp, &mut encoded);
        self.ensure_room(&mut core, encoded.len())?;
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        core.handle_by_tree
            .insert((volume_handle, tree_name.to_string()), handle);
        core.trees_by_handle.insert(
            handle,
            TreeIdent {
                volume_handle,
                name: tree_name.to_string(),
            },
        );
        Ok(handle)
    }

    pub fn tree_ident(&self, handle: i32) -> Option<TreeIdent> {
        self.inner.lock().trees_by_handle.get(&handle).cloned()
    }

    pub fn volume_ident(&self, handle: i32) -> Option<VolumeIdent> {
        self.inner.lock().volumes_by_handle.get(&handle).cloned()
    }

    /// Appends a PA record and registers the image in the page map.
    pub fn write_page_image(
        &self,
        volume: &Volume,
        page_address: u64,
        timestamp: u64,
        image: &[u8],
    ) -> Result<u64> {
        let mut core = self.inner.lock();
        let volume_handle = self.handle_for_volume_locked(&mut core, volume)?;
        Self::note_timestamp(&mut core, timestamp);
        let length = PA_IMAGE_OFFSET + image.len();
        self.ensure_room(&mut core, length)?;
        let address = core.current_address;
        let mut encoded = BytesMut::with_capacity(length);
        record::encode_pa(volume_handle, page_address, timestamp, image, &mut encoded);
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        let versions = core
            .page_map
            .entry((volume_handle, page_address))
            .or_default();
        versions.insert(
            0,
            PageVersion {
                timestamp,
                journal_address: address,
            },
        );
        self.io.charge(
            IoClass::WritePageToJournal,
            image.len(),
            IoContext {
                volume_handle,
                page_address,
                journal_address: address,
                ..Default::default()
            },
        );
        if core.buffer.len() >= WRITE_THRESHOLD {
            self.flush_locked(&mut core, false)?;
        }
        Ok(address)
    }

    /// Whether the page map holds a version of this page, and copies the
    /// newest image into `buf` when it does.
    pub fn read_page_image(
        &self,
        volume: &Volume,
        page_address: u64,
        buf: &mut [u8],
    ) -> Result<bool> {
        let mut core = self.inner.lock();
        let Some(&volume_handle) = core.handle_by_volume_id.get(&volume.id()) else {
            return Ok(false);
        };
        let Some(version) = core
            .page_map
            .get(&(volume_handle, page_address))
            .and_then(|versions| versions.first())
            .copied()
        else {
            return Ok(false);
        };
        self.read_image_at(&mut core, version.journal_address, buf)?;
        self.io.charge(
            IoClass::ReadPageFromJournal,
            buf.len(),
            IoContext {
                volume_handle,
                page_address,
                journal_address: version.journal_address,
                ..Default::default()
            },
        );
        Ok(true)
    }

    /// Reads the page-image payload of the PA record at `record_address`.
    fn read_image_at(
        &self,
        core: &mut JournalCore,
        record_address: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let image_address = record_address + PA_IMAGE_OFFSET as u64;
        if image_address >= core.buffer_base {
            let start = (image_address - core.buffer_base) as usize;
            if start + buf.len() > core.buffer.len() {
                return Err(PersistitError::Corrupt(
                    "page image beyond journal buffer".into(),
                ));
            }
            buf.copy_from_slice(&core.buffer[start..start + buf.len()]);
            return Ok(());
        }
        let generation = record_address / self.block_size;
        let offset = image_address % self.block_size;
        let path = self.file_path(generation);
        let mut file = File::open(&path).map_err(|e| PersistitError::CorruptJournal {
            file: path.display().to_string(),
            address: record_address,
            detail: format!("page image unreadable: {e}"),
        })?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Appends a transaction's operations, chunking long payloads and
    /// chaining the chunks by backchain address. Returns the address just
    /// past the final chunk, suitable for [`Self::wait_for_durability`].
    pub fn write_transaction(
        &self,
        start_timestamp: u64,
        commit_timestamp: u64,
        ops: &[u8],
    ) -> Result<u64> {
        let mut core = self.inner.lock();
        if commit_timestamp != crate::mvv::ABORTED {
            Self::note_timestamp(&mut core, commit_timestamp);
        }
        Self::note_timestamp(&mut core, start_timestamp);
        let chunk_size = MAX_TX_CHUNK.min(self.block_size as usize / 4).max(4096);
        let mut backchain = 0u64;
        let mut first_address = 0u64;
        let mut last_address = 0u64;
        let mut chunks: Vec<&[u8]> = ops.chunks(chunk_size).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let chunk_count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            // Only the final chunk carries the commit timestamp; a torn
            // chain therefore reads back as uncommitted.
            let chunk_commit = if i + 1 == chunk_count {
                commit_timestamp
            } else {
                0
            };
            let length = RECORD_HEADER + 16 + chunk.len();
            self.ensure_room(&mut core, length)?;
            let address = core.current_address;
            let mut encoded = BytesMut::with_capacity(length);
            record::encode_tx(start_timestamp, chunk_commit, backchain, chunk, &mut encoded);
            core.buffer.extend_from_slice(&encoded);
            core.current_address += encoded.len() as u64;
            if first_address == 0 {
                first_address = address;
            }
            backchain = address;
            last_address = address;
            // Registered chunk by chunk so a rollover mid-chain snapshots
            // the true first address; the final chunk publishes the commit.
            core.tx_map.insert(
                start_timestamp,
                TxMapEntry {
                    start_timestamp,
                    commit_timestamp: chunk_commit,
                    journal_address: first_address,
                    last_record_address: last_address,
                },
            );
        }
        self.io.charge(
            IoClass::WriteTxToJournal,
            ops.len(),
            IoContext {
                journal_address: first_address,
                ..Default::default()
            },
        );
        if core.buffer.len() >= WRITE_THRESHOLD {
            self.flush_locked(&mut core, false)?;
        }
        Ok(core.current_address)
    }

    /// Appends a CP record asserting consistency at `timestamp`, prunes
    /// the transaction map, and fsyncs.
    pub fn checkpoint(&self, timestamp: u64) -> Result<Checkpoint> {
        let mut core = self.inner.lock();
        Self::note_timestamp(&mut core, timestamp);
        self.ensure_room(&mut core, RECORD_HEADER + 24)?;
        let address = core.current_address;
        let system_time = now_millis();
        let mut encoded = BytesMut::new();
        record::encode_cp(timestamp, timestamp, system_time, core.base_address, &mut encoded);
        core.buffer.extend_from_slice(&encoded);
        core.current_address += encoded.len() as u64;
        let checkpoint = Checkpoint {
            timestamp,
            system_time_millis: system_time,
            journal_address: address,
        };
        core.last_checkpoint = Some(checkpoint);
        // Committed transactions below the checkpoint are fully reflected
        // in checkpointed page images; aborted ones are pruned.
        core.tx_map.retain(|_, entry| {
            if entry.commit_timestamp == crate::mvv::ABORTED {
                entry.start_timestamp >= timestamp
            } else {
                entry.commit_timestamp >= timestamp
            }
        });
        self.flush_locked(&mut core, true)?;
        self.io.charge(
            IoClass::WriteOtherToJournal,
            RECORD_HEADER + 24,
            IoContext {
                journal_address: address,
                ..Default::default()
            },
        );
        info!(timestamp, address, "checkpoint written");
        Ok(checkpoint)
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.lock().last_checkpoint
    }

    /// AppendOnly mode: the copier is suspended and the journal grows.
    pub fn set_append_only(&self, enabled: bool) {
        self.append_only.store(enabled, Ordering::Release);
    }

    pub fn is_append_only(&self) -> bool {
        self.append_only.load(Ordering::Acquire)
    }

    /// FastCopying mode: the copier runs unthrottled until the dirty-page
    /// backlog drains.
    pub fn set_fast_copying(&self, enabled: bool) {
        self.fast_copying.store(enabled, Ordering::Release);
    }

    pub fn is_fast_copying(&self) -> bool {
        self.fast_copying.load(Ordering::Acquire)
    }

    pub fn info(&self) -> JournalInfo {
        let core = self.inner.lock();
        JournalInfo {
            current_address: core.current_address,
            base_address: core.base_address,
            flushed_address: core.flushed_address,
            page_map_size: core.page_map.len(),
            tx_map_size: core.tx_map.len(),
            current_generation: core.current_address / self.block_size,
            append_only: self.is_append_only(),
            fast_copying: self.is_fast_copying(),
            last_checkpoint_timestamp: core.last_checkpoint.map(|c| c.timestamp),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn io_meter(&self) -> Arc<IoMeter> {
        self.io.clone()
    }

    /// One copier pass: copies up to `limit` of the oldest page images back
    /// to their volumes, advances the base address, and deletes dead files.
    /// Returns the number of pages copied.
    pub fn copier_pass(&self, limit: usize) -> Result<usize> {
        if self.is_append_only() {
            return Ok(0);
        }
        // Only versions at or below the last checkpoint may be copied:
        // volume files must never get ahead of the recovery snapshot.
        let (candidates, copy_ceiling): (Vec<((i32, u64), PageVersion)>, u64) = {
            let core = self.inner.lock();
            let Some(checkpoint) = core.last_checkpoint else {
                return Ok(0);
            };
            let ceiling = checkpoint.timestamp;
            let mut entries: Vec<_> = core
                .page_map
                .iter()
                .filter_map(|(&key, versions)| {
                    versions
                        .iter()
                        .filter(|v| v.timestamp <= ceiling)
                        .max_by_key(|v| v.timestamp)
                        .map(|&version| (key, version))
                })
                .collect();
            entries.sort_by_key(|(_, version)| version.journal_address);
            entries.truncate(limit);
            (entries, ceiling)
        };
        if candidates.is_empty() {
            if self.is_fast_copying() {
                self.set_fast_copying(false);
                debug!("fast-copying cleared, backlog drained");
            }
            self.advance_base()?;
            return Ok(0);
        }
        let mut copied = 0;
        for ((volume_handle, page_address), version) in candidates {
            let ident = {
                let core = self.inner.lock();
                core.volumes_by_handle.get(&volume_handle).cloned()
            };
            let Some(ident) = ident else {
                // Volume vanished: the image is unreferencable.
                self.forget_versions(volume_handle, page_address, version.journal_address);
                continue;
            };
            let Some(volume) = self.registry.by_id(ident.id) else {
                self.forget_versions(volume_handle, page_address, version.journal_address);
                continue;
            };
            let mut image = vec![0u8; volume.page_size()];
            let chosen = {
                let mut core = self.inner.lock();
                // The entry may have changed; re-pick the newest copyable
                // version.
                let Some(&chosen) = core
                    .page_map
                    .get(&(volume_handle, page_address))
                    .and_then(|versions| {
                        versions
                            .iter()
                            .filter(|v| v.timestamp <= copy_ceiling)
                            .max_by_key(|v| v.timestamp)
                    })
                else {
                    continue;
                };
                self.read_image_at(&mut core, chosen.journal_address, &mut image)?;
                chosen
            };
            volume.write_page(page_address, &image)?;
            self.io.charge(
                IoClass::CopyPageToVolume,
                image.len(),
                IoContext {
                    volume_handle,
                    page_address,
                    journal_address: chosen.journal_address,
                    ..Default::default()
                },
            );
            self.forget_versions(volume_handle, page_address, chosen.journal_address);
            copied += 1;
        }
        // Copied pages must be durable in the volumes before the journal
        // images become deletable.
        for volume in self.registry.list() {
            volume.fsync()?;
        }
        self.advance_base()?;
        Ok(copied)
    }

    fn forget_versions(&self, volume_handle: i32, page_address: u64, up_to: u64) {
        let mut core = self.inner.lock();
        if let Some(versions) = core.page_map.get_mut(&(volume_handle, page_address)) {
            versions.retain(|v| v.journal_address > up_to);
            if versions.is_empty() {
                core.page_map.remove(&(volume_handle, page_address));
            }
        }
    }

    /// Recomputes the base address (earliest journal address still required
    /// for recovery) and deletes files wholly below it.
    fn advance_base(&self) -> Result<()> {
        let (base, delete_below) = {
            let mut core = self.inner.lock();
            let mut base = core.current_address;
            for versions in core.page_map.values() {
                for version in versions {
                    base = base.min(version.journal_address);
                }
            }
            for entry in core.tx_map.values() {
                base = base.min(entry.journal_address);
            }
            if let Some(checkpoint) = core.last_checkpoint {
                base = base.min(checkpoint.journal_address);
            }
            if base > core.base_address {
                core.base_address = base;
            }
            (core.base_address, core.base_address / self.block_size)
        };
        for generation in 0..delete_below {
            let path = self.file_path(generation);
            if path.exists() {
                std::fs::remove_file(&path)?;
                self.io.charge(
                    IoClass::DeleteJournalFile,
                    0,
                    IoContext {
                        journal_address: generation * self.block_size,
                        ..Default::default()
                    },
                );
                info!(generation, base, "journal file deleted");
            }
        }
        Ok(())
    }

    /// Drains the whole page map (clean shutdown / tests).
    pub fn copy_back_pages(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let copied = self.copier_pass(usize::MAX)?;
            if copied == 0 {
                return Ok(total);
            }
            total += copied;
        }
    }

    /// Launches the flusher and copier workers.
    pub fn start_workers(self: &Arc<Self>, config: &Configuration) -> Result<()> {
        *self.copier_interval.lock() = Duration::from_millis(config.copier_interval_ms);
        *self.copier_pages_per_pass.lock() = config.copier_pages_per_pass;
        let flush_tick = config.flush_tick();
        let flusher = {
            let manager = self.clone();
            std::thread::Builder::new()
                .name("persistit-flusher".to_string())
                .spawn(move || manager.flusher_loop(flush_tick))?
        };
        let copier = {
            let manager = self.clone();
            std::thread::Builder::new()
                .name("persistit-copier".to_string())
                .spawn(move || manager.copier_loop())?
        };
        let mut workers = self.workers.lock();
        workers.push(flusher);
        workers.push(copier);
        Ok(())
    }

    fn flusher_loop(&self, tick: Duration) {
        debug!("flusher started");
        while !self.closing.load(Ordering::Acquire) {
            {
                let mut core = self.inner.lock();
                if !core.flush_requested {
                    self.flush_cond.wait_for(&mut core, tick);
                }
                if let Err(e) = self.flush_locked(&mut core, true) {
                    error!(error = %e, "journal flush failed");
                }
            }
        }
        debug!("flusher stopped");
    }

    fn copier_loop(&self) {
        debug!("copier started");
        while !self.closing.load(Ordering::Acquire) {
            let interval = *self.copier_interval.lock();
            let limit = *self.copier_pages_per_pass.lock();
            let urgent = self.is_fast_copying()
                || self.io.recent_rate_kb_per_s() < self.quiescent_kb;
            let limit = if urgent { limit * 8 } else { limit };
            match self.copier_pass(limit) {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "copier pass failed");
                }
            }
            if !urgent {
                std::thread::sleep(interval);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        debug!("copier stopped");
    }

    /// Signals workers to stop and joins them within the grace window.
    pub fn close(&self, grace: Duration) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        self.flush_cond.notify_all();
        let deadline = std::time::Instant::now() + grace;
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if std::time::Instant::now() < deadline {
                let _ = worker.join();
            }
        }
        // A clean shutdown ends the file with a JE marker.
        {
            let mut core = self.inner.lock();
            let end = JournalEnd {
                current_address: core.current_address + JE_LEN,
                base_address: core.base_address,
                journal_created: core.journal_created,
            };
            let timestamp = core.last_timestamp;
            end.encode(timestamp, &mut core.buffer);
            core.current_address += JE_LEN;
            self.flush_locked(&mut core, true)?;
        }
        info!("journal closed");
        Ok(())
    }
}

/// Builds a small journal for unit tests in other modules, wired to the
/// pool's registry.
#[cfg(test)]
pub fn test_journal(
    dir: &tempfile::TempDir,
    pool: &Arc<crate::pool::BufferPool>,
) -> Arc<JournalManager> {
    let journal = JournalManager::open(
        &dir.path().join("journal"),
        "persistit_journal",
        crate::config::MIN_BLOCK_SIZE,
        Arc::new(IoMeter::new()),
        pool.registry().clone(),
        RecoveredState::default(),
    )
    .expect("open test journal");
    pool.attach_journal(journal.clone());
    journal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::volume::test_volume;
    use std::time::Duration;

    fn fixture() -> (
        Arc<JournalManager>,
        Arc<BufferPool>,
        Arc<Volume>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let registry = Arc::new(VolumeRegistry::new());
        let volume = test_volume(&dir, "journal_test", 1024, 32);
        registry.register(volume.clone()).expect("register");
        let pool = BufferPool::new(1024, 32, Duration::from_millis(500), registry);
        let journal = test_journal(&dir, &pool);
        (journal, pool, volume, dir)
    }

    #[test]
    fn page_image_roundtrips_through_buffer() -> Result<()> {
        let (journal, _pool, volume, _dir) = fixture();
        let image = vec![0x5Au8; 1024];
        journal.write_page_image(&volume, 9, 3, &image)?;
        let mut read = vec![0u8; 1024];
        assert!(journal.read_page_image(&volume, 9, &mut read)?);
        assert_eq!(read, image);
        Ok(())
    }

    #[test]
    fn page_image_roundtrips_through_file() -> Result<()> {
        let (journal, _pool, volume, _dir) = fixture();
        let image = vec![0xA5u8; 1024];
        journal.write_page_image(&volume, 4, 2, &image)?;
        journal.flush(true)?;
        let mut read = vec![0u8; 1024];
        assert!(journal.read_page_image(&volume, 4, &mut read)?);
        assert_eq!(read, image);
        Ok(())
    }

    #[test]
    fn newest_version_wins() -> Result<()> {
        let (journal, _pool, volume, _dir) = fixture();
        journal.write_page_image(&volume, 4, 2, &vec![1u8; 1024])?;
        journal.write_page_image(&volume, 4, 5, &vec![2u8; 1024])?;
        let mut read = vec![0u8; 1024];
        assert!(journal.read_page_image(&volume, 4, &mut read)?);
        assert_eq!(read[0], 2);
        Ok(())
    }

    #[test]
    fn rollover_emits_new_generation() -> Result<()> {
        let (journal, _pool, volume, dir) = fixture();
        // Fill more than one 64K block with page images.
        for i in 0..80u64 {
            journal.write_page_image(&volume, i % 8, i, &vec![i as u8; 1024])?;
        }
        journal.flush(true)?;
        let info = journal.info();
        assert!(info.current_generation >= 1, "rollover expected");
        let first = dir.path().join("journal").join(format!(
            "{}.{:016x}",
            "persistit_journal", 0
        ));
        assert!(first.exists());
        // Latest images still resolvable across the rollover.
        let mut read = vec![0u8; 1024];
        assert!(journal.read_page_image(&volume, 7, &mut read)?);
        Ok(())
    }

    #[test]
    fn copier_drains_page_map_and_deletes_files() -> Result<()> {
        let (journal, _pool, volume, _dir) = fixture();
        for i in 0..80u64 {
            journal.write_page_image(&volume, i % 8, i, &vec![i as u8; 1024])?;
        }
        // The copier only copies images at or below the last checkpoint.
        journal.checkpoint(100)?;
        let copied = journal.copy_back_pages()?;
        assert_eq!(copied, 8);
        assert_eq!(journal.info().page_map_size, 0);
        // With nothing left to recover below it, base reaches the newest
        // checkpoint and generation 0 becomes deletable.
        journal.checkpoint(101)?;
        journal.copier_pass(8)?;
        let info = journal.info();
        assert!(info.base_address > 0);
        Ok(())
    }

    #[test]
    fn copier_leaves_uncheckpointed_images_in_place() -> Result<()> {
        let (journal, _pool, volume, _dir) = fixture();
        journal.checkpoint(5)?;
        journal.write_page_image(&volume, 1, 9, &vec![7u8; 1024])?;
        // The image is newer than the checkpoint; the copier must not move
        // it into the volume file.
        assert_eq!(journal.copier_pass(16)?, 0);
        assert_eq!(journal.info().page_map_size, 1);
        journal.checkpoint(20)?;
        assert_eq!(journal.copier_pass(16)?, 1);
        Ok(())
    }

    #[test]
    fn append_only_suspends_copier() -> Result<()> {
        let (journal, _pool, volume, _dir) = fixture();
        journal.write_page_image(&volume, 1, 1, &vec![9u8; 1024])?;
        journal.checkpoint(10)?;
        journal.set_append_only(true);
        assert_eq!(journal.copier_pass(16)?, 0);
        journal.set_append_only(false);
        assert_eq!(journal.copier_pass(16)?, 1);
        Ok(())
    }

    #[test]
    fn transactions_update_tx_map_until_checkpoint() -> Result<()> {
        let (journal, _pool, _volume, _dir) = fixture();
        let mut ops = BytesMut::new();
        record::encode_sr(1, b"k", b"v", &mut ops);
        journal.write_transaction(10, 11, &ops)?;
        assert_eq!(journal.info().tx_map_size, 1);
        journal.checkpoint(50)?;
        assert_eq!(journal.info().tx_map_size, 0);
        Ok(())
    }
}
