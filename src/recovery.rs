//! Crash recovery: keystone discovery, plan, apply.
//!
//! Phase 1 enumerates journal files newest-first looking for the keystone,
//! the last file holding a valid checkpoint. Scanning the keystone forward
//! rebuilds the handle maps, the page map and the transaction map, and
//! classifies every transaction. Phase 2 re-reads the retained TX chains
//! and applies them in commit-timestamp order through a commit listener
//! (or prunes, for aborted ones); long-record values are reassembled from
//! page images in the branch and main maps.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PersistitError, Result};
use crate::exchange::{self, Direction, Exchange};
use crate::journal::record::{
    self, RecordHeader, TxMapEntry, TxOp, JOURNAL_VERSION, RECORD_HEADER, TYPE_CP, TYPE_IT,
    TYPE_IV, TYPE_JE, TYPE_JH, TYPE_PA, TYPE_PM, TYPE_TM, TYPE_TX,
};
use crate::journal::{Checkpoint, PageVersion, RecoveredState, TreeIdent, VolumeIdent};
use crate::key::Key;
use crate::keyfilter::KeyFilter;
use crate::mvv::{self, Mvv};
use crate::page::{self, PAGE_HDR_LEN};
use crate::transaction::TxContext;
use crate::value::{LongRecordDescriptor, TAG_INLINE, TAG_LONG_RECORD, TAG_MVV};
use crate::volume::VolumeRegistry;

/// Summary surfaced through the management interface.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryInfo {
    pub files_scanned: usize,
    pub keystone_generation: Option<u64>,
    pub checkpoint_timestamp: Option<u64>,
    pub committed_applied: usize,
    pub aborted_pruned: usize,
    pub page_map_entries: usize,
    pub max_timestamp: u64,
}

/// One transaction retained by the plan.
#[derive(Clone, Copy, Debug)]
struct RetainedTransaction {
    start_timestamp: u64,
    commit_timestamp: u64,
    last_record_address: u64,
}

/// Everything phase 1 learned.
pub struct RecoveryPlan {
    dir: PathBuf,
    prefix: String,
    block_size: u64,
    /// Versions at or below the checkpoint; donated to the journal.
    pub state: RecoveredState,
    /// Versions after the checkpoint, kept solely for long-record
    /// reassembly and discarded after phase 2.
    branch_map: FxHashMap<(i32, u64), Vec<PageVersion>>,
    committed: Vec<RetainedTransaction>,
    aborted: Vec<RetainedTransaction>,
    pub max_timestamp: u64,
    pub keystone_generation: Option<u64>,
    files_scanned: usize,
}

impl RecoveryPlan {
    /// An empty plan for a directory with no journal.
    fn empty(dir: &Path, prefix: &str, block_size: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            block_size,
            state: RecoveredState::default(),
            branch_map: FxHashMap::default(),
            committed: Vec::new(),
            aborted: Vec::new(),
            max_timestamp: 0,
            keystone_generation: None,
            files_scanned: 0,
        }
    }

    pub fn has_work(&self) -> bool {
        !self.committed.is_empty() || !self.aborted.is_empty()
    }

    /// Block size in force, from the keystone JH (or the configured
    /// default when the journal is fresh).
    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

/// Receives the operations of each committed transaction during phase 2.
pub trait CommitListener {
    fn store(&mut self, volume: &str, tree: &str, key: &Key, payload: &[u8]) -> Result<()>;
    fn delete_range(&mut self, volume: &str, tree: &str, low: &Key, high: &Key) -> Result<()>;
    fn delete_tree(&mut self, volume: &str, tree: &str) -> Result<()>;
    fn delta(&mut self, tree_handle: i32, index: u8, accumulator_type: u8, value: i64)
        -> Result<()>;
}

/// Applies operations to the live trees (the default listener).
struct LiveApplier<'a> {
    ctx: &'a Arc<TxContext>,
    registry: &'a Arc<VolumeRegistry>,
}

impl CommitListener for LiveApplier<'_> {
    fn store(&mut self, volume: &str, tree: &str, key: &Key, payload: &[u8]) -> Result<()> {
        // Volumes absent at restart (temporary ones, mostly) drop their
        // recovered operations.
        let Some(volume) = self.registry.by_name(volume) else {
            warn!(volume, "recovered store for unavailable volume dropped");
            return Ok(());
        };
        let tree = match exchange::lookup_tree(self.ctx, &volume, tree)? {
            Some(tree) => tree,
            // The tree was created after the checkpoint; re-create it.
            None => exchange::create_tree(self.ctx, &volume, tree)?,
        };
        let mut ex = Exchange::new(self.ctx.clone(), volume, tree)?;
        ex.key = key.clone();
        ex.value.put_bytes(payload);
        ex.store(None)
    }

    fn delete_range(&mut self, volume: &str, tree: &str, low: &Key, high: &Key) -> Result<()> {
        let Some(volume) = self.registry.by_name(volume) else {
            warn!(volume, "recovered delete for unavailable volume dropped");
            return Ok(());
        };
        let Some(tree) = exchange::lookup_tree(self.ctx, &volume, tree)? else {
            return Ok(());
        };
        let mut ex = Exchange::new(self.ctx.clone(), volume, tree)?;
        ex.remove_range(low, high, None)?;
        Ok(())
    }

    fn delete_tree(&mut self, volume: &str, tree: &str) -> Result<()> {
        let Some(volume) = self.registry.by_name(volume) else {
            warn!(volume, "recovered tree delete for unavailable volume dropped");
            return Ok(());
        };
        let Some(tree) = exchange::lookup_tree(self.ctx, &volume, tree)? else {
            return Ok(());
        };
        exchange::remove_tree(self.ctx, &volume, &tree, None)
    }

    fn delta(&mut self, tree_handle: i32, index: u8, accumulator_type: u8, value: i64) -> Result<()> {
        let accumulator_type =
            crate::transaction::accumulator::AccumulatorType::from_u8(accumulator_type)?;
        self.ctx
            .accumulators
            .apply_delta(tree_handle, index, accumulator_type, value);
        Ok(())
    }
}

/// Orchestrates both phases.
pub struct RecoveryManager {
    dir: PathBuf,
    prefix: String,
}

impl RecoveryManager {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    fn journal_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(&format!("{}.", self.prefix)) else {
                continue;
            };
            if suffix.len() == 16 {
                if let Ok(generation) = u64::from_str_radix(suffix, 16) {
                    files.push((generation, entry.path()));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Phase 1: find the keystone and build the plan.
    ///
    /// `default_block_size` is used when no journal exists yet.
    pub fn plan(&self, default_block_size: u64) -> Result<RecoveryPlan> {
        let mut files = self.journal_files()?;
        if files.is_empty() {
            info!("no journal files; starting fresh");
            return Ok(RecoveryPlan::empty(&self.dir, &self.prefix, default_block_size));
        }
        // One rejection of the newest file is permitted: it may have been
        // created moments before the crash, before its first checkpoint.
        let mut rejections_left = 1;
        loop {
            let Some(&(generation, ref path)) = files.last() else {
                return Err(PersistitError::CorruptJournal {
                    file: self.dir.display().to_string(),
                    address: 0,
                    detail: "no journal file contains a valid checkpoint".to_string(),
                });
            };
            match self.scan_keystone(generation, path) {
                Ok(mut plan) => {
                    plan.files_scanned = files.len();
                    self.validate_prior_files(&files, &plan)?;
                    info!(
                        keystone = generation,
                        checkpoint = ?plan.state.last_checkpoint.map(|c| c.timestamp),
                        committed = plan.committed.len(),
                        aborted = plan.aborted.len(),
                        "recovery plan built"
                    );
                    return Ok(plan);
                }
                Err(e) if rejections_left > 0 => {
                    warn!(generation, error = %e, "rejecting newest journal file as keystone");
                    rejections_left -= 1;
                    files.pop();
                    if files.is_empty() {
                        // The journal never reached its first checkpoint;
                        // recover from nothing.
                        return Ok(RecoveryPlan::empty(
                            &self.dir,
                            &self.prefix,
                            default_block_size,
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Scans one candidate keystone file from its JH forward.
    fn scan_keystone(&self, generation: u64, path: &Path) -> Result<RecoveryPlan> {
        let corrupt = |address: u64, detail: String| PersistitError::CorruptJournal {
            file: path.display().to_string(),
            address,
            detail,
        };
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut header_buf = [0u8; RECORD_HEADER];
        file.read_exact(&mut header_buf)
            .map_err(|_| corrupt(0, "file shorter than a record header".to_string()))?;
        let outer = RecordHeader::decode(&header_buf)?;
        if outer.kind != TYPE_JH {
            return Err(corrupt(0, "file does not begin with JH".to_string()));
        }
        let mut payload = vec![0u8; outer.length as usize - RECORD_HEADER];
        file.read_exact(&mut payload)
            .map_err(|_| corrupt(0, "JH truncated".to_string()))?;
        let journal_header = record::JournalHeader::decode(&payload)?;
        if journal_header.version != JOURNAL_VERSION {
            return Err(corrupt(
                0,
                format!("unsupported journal version {}", journal_header.version),
            ));
        }
        let block_size = journal_header.block_size;
        let base = generation * block_size;
        if journal_header.current_address != base {
            return Err(corrupt(
                0,
                format!(
                    "JH current address {} does not match generation start {base}",
                    journal_header.current_address
                ),
            ));
        }

        let mut plan = RecoveryPlan::empty(&self.dir, &self.prefix, block_size);
        plan.keystone_generation = Some(generation);
        plan.state.journal_created = journal_header.journal_created;
        plan.state.base_address = journal_header.base_address;

        let mut address = base + outer.length as u64;
        let mut last_timestamp = 0u64;
        // Raw observations, split into main/branch maps once the last
        // valid checkpoint is known.
        let mut observed_pages: FxHashMap<(i32, u64), Vec<PageVersion>> = FxHashMap::default();
        let mut observed_txs: FxHashMap<u64, TxMapEntry> = FxHashMap::default();
        let mut clean_end = false;

        loop {
            let offset = address - base;
            if offset + RECORD_HEADER as u64 > file_len.min(block_size) {
                break;
            }
            file.seek(SeekFrom::Start(offset))?;
            if file.read_exact(&mut header_buf).is_err() {
                break;
            }
            let Ok(header) = RecordHeader::decode(&header_buf) else {
                break;
            };
            if !header.is_valid_type()
                || (header.length as u64) < RECORD_HEADER as u64
                || offset + header.length as u64 > block_size
            {
                debug!(address, "scan stopped at invalid record");
                break;
            }
            if header.timestamp < last_timestamp && header.timestamp != 0 {
                debug!(address, "scan stopped at regressing timestamp");
                break;
            }
            if offset + header.length as u64 > file_len {
                debug!(address, "scan stopped at torn record");
                break;
            }
            let mut body = vec![0u8; header.length as usize - RECORD_HEADER];
            if file.read_exact(&mut body).is_err() {
                break;
            }
            if header.timestamp != 0 {
                last_timestamp = header.timestamp;
                plan.max_timestamp = plan.max_timestamp.max(header.timestamp);
            }
            match header.kind {
                TYPE_JE => {
                    clean_end = true;
                }
                TYPE_IV => {
                    let (handle, id, name) = record::decode_iv(&body)?;
                    plan.state
                        .volumes_by_handle
                        .insert(handle, VolumeIdent { id, name });
                }
                TYPE_IT => {
                    let (handle, volume_handle, name) = record::decode_it(&body)?;
                    plan.state
                        .trees_by_handle
                        .insert(handle, TreeIdent { volume_handle, name });
                }
                TYPE_PA => {
                    let (volume_handle, page_address, _) = record::decode_pa(&body)?;
                    observed_pages
                        .entry((volume_handle, page_address))
                        .or_default()
                        .insert(
                            0,
                            PageVersion {
                                timestamp: header.timestamp,
                                journal_address: address,
                            },
                        );
                }
                TYPE_PM => {
                    for entry in record::decode_pm(&body)? {
                        observed_pages
                            .entry((entry.volume_handle, entry.page_address))
                            .or_default()
                            .push(PageVersion {
                                timestamp: entry.timestamp,
                                journal_address: entry.journal_address,
                            });
                    }
                    for versions in observed_pages.values_mut() {
                        versions.sort_by_key(|v| std::cmp::Reverse(v.timestamp));
                    }
                }
                TYPE_TM => {
                    for entry in record::decode_tm(&body)? {
                        observed_txs.insert(entry.start_timestamp, entry);
                    }
                }
                TYPE_TX => {
                    let (commit, _backchain, _) = record::decode_tx(&body)?;
                    let entry = observed_txs
                        .entry(header.timestamp)
                        .or_insert(TxMapEntry {
                            start_timestamp: header.timestamp,
                            commit_timestamp: 0,
                            journal_address: address,
                            last_record_address: address,
                        });
                    entry.last_record_address = address;
                    if commit != 0 {
                        entry.commit_timestamp = commit;
                        plan.max_timestamp = plan.max_timestamp.max(match commit {
                            mvv::ABORTED => header.timestamp,
                            ts => ts,
                        });
                    }
                }
                TYPE_CP => {
                    let (checkpoint_timestamp, system_time, _cp_base) = record::decode_cp(&body)?;
                    plan.state.last_checkpoint = Some(Checkpoint {
                        timestamp: checkpoint_timestamp,
                        system_time_millis: system_time,
                        journal_address: address,
                    });
                    plan.max_timestamp = plan.max_timestamp.max(checkpoint_timestamp);
                }
                TYPE_JH if address != base => {
                    debug!(address, "scan stopped at unexpected JH");
                    break;
                }
                _ => {}
            }
            address += header.length as u64;
            if clean_end {
                break;
            }
        }

        let Some(checkpoint) = plan.state.last_checkpoint else {
            return Err(corrupt(
                address,
                "no checkpoint record in candidate keystone".to_string(),
            ));
        };
        plan.state.current_address = address;

        // Split page versions around the checkpoint: at-or-below feeds the
        // live page map, above is branch-only.
        for ((volume_handle, page_address), versions) in observed_pages {
            for version in versions {
                let target = if version.timestamp <= checkpoint.timestamp {
                    &mut plan.state.page_map
                } else {
                    &mut plan.branch_map
                };
                target
                    .entry((volume_handle, page_address))
                    .or_default()
                    .push(version);
            }
        }
        for map in [&mut plan.state.page_map, &mut plan.branch_map] {
            for versions in map.values_mut() {
                versions.sort_by_key(|v| std::cmp::Reverse(v.timestamp));
            }
        }

        // Classify transactions.
        for (&start, entry) in &observed_txs {
            let retained = RetainedTransaction {
                start_timestamp: start,
                commit_timestamp: entry.commit_timestamp,
                last_record_address: entry.last_record_address,
            };
            match entry.commit_timestamp {
                mvv::ABORTED => plan.aborted.push(retained),
                0 => {
                    if start < checkpoint.timestamp {
                        // Uncommitted but possibly present in checkpointed
                        // page images: treat as aborted and prune.
                        plan.aborted.push(retained);
                    }
                    // Started after the checkpoint: no durable effect.
                }
                commit if commit < checkpoint.timestamp => {
                    // Fully reflected in the checkpoint snapshot.
                }
                _ => plan.committed.push(retained),
            }
        }
        plan.committed.sort_by_key(|t| t.commit_timestamp);
        // Donate only committed entries; aborted ones are pruned below.
        plan.state.tx_map = observed_txs
            .into_iter()
            .filter(|(_, e)| {
                e.commit_timestamp != 0
                    && e.commit_timestamp != mvv::ABORTED
                    && e.commit_timestamp >= checkpoint.timestamp
            })
            .collect();
        Ok(plan)
    }

    /// Confirms each file from the base address up to the keystone is
    /// present, contiguous, and physically intact at its deepest needed
    /// page image.
    fn validate_prior_files(&self, files: &[(u64, PathBuf)], plan: &RecoveryPlan) -> Result<()> {
        let Some(keystone) = plan.keystone_generation else {
            return Ok(());
        };
        let first_needed = plan.state.base_address / plan.block_size;
        for &(generation, ref path) in files {
            if generation >= keystone || generation < first_needed {
                continue;
            }
            let corrupt = |address: u64, detail: String| PersistitError::CorruptJournal {
                file: path.display().to_string(),
                address,
                detail,
            };
            let mut file = File::open(path)?;
            let mut header_buf = [0u8; RECORD_HEADER];
            file.read_exact(&mut header_buf)
                .map_err(|_| corrupt(0, "prior file unreadable".to_string()))?;
            let outer = RecordHeader::decode(&header_buf)?;
            if outer.kind != TYPE_JH {
                return Err(corrupt(0, "prior file does not begin with JH".to_string()));
            }
            let mut payload = vec![0u8; outer.length as usize - RECORD_HEADER];
            file.read_exact(&mut payload)?;
            let header = record::JournalHeader::decode(&payload)?;
            if header.journal_created != plan.state.journal_created {
                return Err(corrupt(
                    0,
                    "prior file belongs to a different journal".to_string(),
                ));
            }
            // Deepest page image this file must still serve.
            let deepest = plan
                .state
                .page_map
                .values()
                .chain(plan.branch_map.values())
                .flatten()
                .map(|v| v.journal_address)
                .filter(|a| a / plan.block_size == generation)
                .max();
            if let Some(address) = deepest {
                let offset = address % plan.block_size;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut header_buf)
                    .map_err(|_| corrupt(address, "referenced PA unreadable".to_string()))?;
                let record_header = RecordHeader::decode(&header_buf)?;
                if record_header.kind != TYPE_PA {
                    return Err(corrupt(
                        address,
                        format!(
                            "expected PA, observed {:?}",
                            String::from_utf8_lossy(&record_header.kind)
                        ),
                    ));
                }
                let end = offset + record_header.length as u64;
                if end > file.metadata()?.len() {
                    return Err(corrupt(address, "referenced PA truncated".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Phase 2: applies retained transactions in commit order and prunes
    /// the aborted ones. The journal manager and volumes must be running.
    pub fn apply(
        &self,
        plan: &RecoveryPlan,
        ctx: &Arc<TxContext>,
        registry: &Arc<VolumeRegistry>,
    ) -> Result<RecoveryInfo> {
        let mut listener = LiveApplier { ctx, registry };
        self.apply_with(plan, ctx, registry, &mut listener)
    }

    /// Phase 2 with a caller-provided commit listener.
    pub fn apply_with(
        &self,
        plan: &RecoveryPlan,
        ctx: &Arc<TxContext>,
        registry: &Arc<VolumeRegistry>,
        listener: &mut dyn CommitListener,
    ) -> Result<RecoveryInfo> {
        let mut info = RecoveryInfo {
            files_scanned: plan.files_scanned,
            keystone_generation: plan.keystone_generation,
            checkpoint_timestamp: plan.state.last_checkpoint.map(|c| c.timestamp),
            page_map_entries: plan.state.page_map.len(),
            max_timestamp: plan.max_timestamp,
            ..Default::default()
        };
        for tx in &plan.committed {
            let ops = self.read_transaction_ops(plan, tx.last_record_address)?;
            for op in record::decode_ops(&ops)? {
                self.dispatch(plan, tx.commit_timestamp, op, listener)?;
            }
            info.committed_applied += 1;
            debug!(
                start = tx.start_timestamp,
                commit = tx.commit_timestamp,
                "transaction reapplied"
            );
        }
        if !plan.aborted.is_empty() {
            for tx in &plan.aborted {
                ctx.index.abort(tx.start_timestamp);
            }
            info.aborted_pruned = plan.aborted.len();
            self.prune_sweep(ctx, registry)?;
            for tx in &plan.aborted {
                ctx.index.forget(tx.start_timestamp);
            }
        }
        info!(
            committed = info.committed_applied,
            aborted = info.aborted_pruned,
            "recovery applied"
        );
        Ok(info)
    }

    fn dispatch(
        &self,
        plan: &RecoveryPlan,
        commit_timestamp: u64,
        op: TxOp,
        listener: &mut dyn CommitListener,
    ) -> Result<()> {
        match op {
            TxOp::Store {
                tree_handle,
                key,
                value,
            } => {
                let (volume, tree) = self.tree_names(plan, tree_handle)?;
                let payload = self.materialize_value(plan, commit_timestamp, tree_handle, &value)?;
                listener.store(&volume, &tree, &Key::from_encoded(&key), &payload)
            }
            TxOp::DeleteRange {
                tree_handle,
                key_low,
                key_high,
            } => {
                let (volume, tree) = self.tree_names(plan, tree_handle)?;
                listener.delete_range(
                    &volume,
                    &tree,
                    &Key::from_encoded(&key_low),
                    &Key::from_encoded(&key_high),
                )
            }
            TxOp::DeleteTree { tree_handle } => {
                let (volume, tree) = self.tree_names(plan, tree_handle)?;
                listener.delete_tree(&volume, &tree)
            }
            TxOp::Delta {
                tree_handle,
                index,
                accumulator_type,
                value,
            } => listener.delta(tree_handle, index, accumulator_type, value),
        }
    }

    fn tree_names(&self, plan: &RecoveryPlan, tree_handle: i32) -> Result<(String, String)> {
        let tree = plan
            .state
            .trees_by_handle
            .get(&tree_handle)
            .ok_or_else(|| PersistitError::Corrupt(format!("unknown tree handle {tree_handle}")))?;
        let volume = plan
            .state
            .volumes_by_handle
            .get(&tree.volume_handle)
            .ok_or_else(|| {
                PersistitError::Corrupt(format!("unknown volume handle {}", tree.volume_handle))
            })?;
        Ok((volume.name.clone(), tree.name.clone()))
    }

    /// Resolves an SR value envelope to the client payload, reassembling
    /// long records from journal page images.
    fn materialize_value(
        &self,
        plan: &RecoveryPlan,
        commit_timestamp: u64,
        tree_handle: i32,
        stored: &[u8],
    ) -> Result<Vec<u8>> {
        match stored.first() {
            Some(&TAG_INLINE) => Ok(stored[1..].to_vec()),
            Some(&TAG_LONG_RECORD) => {
                let descriptor = LongRecordDescriptor::decode(stored)?;
                let volume_handle = plan
                    .state
                    .trees_by_handle
                    .get(&tree_handle)
                    .map(|t| t.volume_handle)
                    .ok_or_else(|| {
                        PersistitError::Corrupt(format!("unknown tree handle {tree_handle}"))
                    })?;
                let envelope =
                    self.reassemble_long_record(plan, commit_timestamp, volume_handle, &descriptor)?;
                match envelope.first() {
                    Some(&TAG_INLINE) => Ok(envelope[1..].to_vec()),
                    _ => Err(PersistitError::Corrupt(
                        "long-record chain held no inline envelope".into(),
                    )),
                }
            }
            Some(&TAG_MVV) => {
                // SR records carry committed envelopes, never MVVs.
                let mvv = Mvv::decode(stored)?;
                mvv.newest_resolved()
                    .map(|v| v.payload[1..].to_vec())
                    .ok_or_else(|| PersistitError::Corrupt("MVV in SR without versions".into()))
            }
            _ => Err(PersistitError::Corrupt("unknown SR value envelope".into())),
        }
    }

    /// Walks a LONG_RECORD chain through journal page images: for each
    /// page the newest version with timestamp ≤ the commit timestamp, in
    /// the branch map first, then the main map.
    fn reassemble_long_record(
        &self,
        plan: &RecoveryPlan,
        commit_timestamp: u64,
        volume_handle: i32,
        descriptor: &LongRecordDescriptor,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(descriptor.total_size as usize);
        let mut page_address = descriptor.chain_head;
        let mut hops = 0u64;
        while out.len() < descriptor.total_size as usize {
            if page_address == 0 {
                return Err(PersistitError::Corrupt(
                    "recovered long-record chain ends early".into(),
                ));
            }
            hops += 1;
            if hops > crate::exchange::MAX_LONG_RECORD_CHAIN {
                return Err(PersistitError::Corrupt(
                    "recovered long-record chain too long".into(),
                ));
            }
            let key = (volume_handle, page_address);
            let version = [&plan.branch_map, &plan.state.page_map]
                .iter()
                .filter_map(|map| {
                    map.get(&key)
                        .and_then(|versions| {
                            versions
                                .iter()
                                .filter(|v| v.timestamp <= commit_timestamp)
                                .max_by_key(|v| v.timestamp)
                        })
                        .copied()
                })
                .max_by_key(|v| v.timestamp)
                .ok_or_else(|| {
                    PersistitError::Corrupt(format!(
                        "no page image for long-record page {page_address}"
                    ))
                })?;
            let image = self.read_page_image_at(plan, version.journal_address)?;
            let capacity = image.len() - PAGE_HDR_LEN;
            let remaining = descriptor.total_size as usize - out.len();
            let take = remaining.min(capacity);
            out.extend_from_slice(&image[PAGE_HDR_LEN..PAGE_HDR_LEN + take]);
            page_address = page::right_sibling(&image);
        }
        Ok(out)
    }

    /// Reads one PA record's page image straight from a journal file.
    fn read_page_image_at(&self, plan: &RecoveryPlan, record_address: u64) -> Result<Vec<u8>> {
        let generation = record_address / plan.block_size;
        let path = plan
            .dir
            .join(format!("{}.{:016x}", plan.prefix, generation));
        let corrupt = |detail: String| PersistitError::CorruptJournal {
            file: path.display().to_string(),
            address: record_address,
            detail,
        };
        let mut file = File::open(&path).map_err(|e| corrupt(format!("unreadable: {e}")))?;
        let offset = record_address % plan.block_size;
        file.seek(SeekFrom::Start(offset))?;
        let mut header_buf = [0u8; RECORD_HEADER];
        file.read_exact(&mut header_buf)
            .map_err(|_| corrupt("PA header unreadable".to_string()))?;
        let header = RecordHeader::decode(&header_buf)?;
        if header.kind != TYPE_PA {
            return Err(corrupt(format!(
                "expected PA, observed {:?}",
                String::from_utf8_lossy(&header.kind)
            )));
        }
        let mut body = vec![0u8; header.length as usize - RECORD_HEADER];
        file.read_exact(&mut body)
            .map_err(|_| corrupt("PA body truncated".to_string()))?;
        let (_, _, image) = record::decode_pa(&body)?;
        Ok(image.to_vec())
    }

    /// Reads and concatenates a TX chain's operations, following
    /// backchain pointers from the last chunk.
    fn read_transaction_ops(&self, plan: &RecoveryPlan, last_address: u64) -> Result<Vec<u8>> {
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        let mut address = last_address;
        loop {
            let generation = address / plan.block_size;
            let path = plan
                .dir
                .join(format!("{}.{:016x}", plan.prefix, generation));
            let corrupt = |detail: String| PersistitError::CorruptJournal {
                file: path.display().to_string(),
                address,
                detail,
            };
            let mut file = File::open(&path).map_err(|e| corrupt(format!("unreadable: {e}")))?;
            file.seek(SeekFrom::Start(address % plan.block_size))?;
            let mut header_buf = [0u8; RECORD_HEADER];
            file.read_exact(&mut header_buf)
                .map_err(|_| corrupt("TX header unreadable".to_string()))?;
            let header = RecordHeader::decode(&header_buf)?;
            if header.kind != TYPE_TX {
                return Err(corrupt(format!(
                    "expected TX, observed {:?}",
                    String::from_utf8_lossy(&header.kind)
                )));
            }
            let mut body = vec![0u8; header.length as usize - RECORD_HEADER];
            file.read_exact(&mut body)
                .map_err(|_| corrupt("TX body truncated".to_string()))?;
            let (_, backchain, ops) = record::decode_tx(&body)?;
            chunks.push(ops.to_vec());
            if backchain == 0 {
                break;
            }
            address = backchain;
        }
        chunks.reverse();
        Ok(chunks.concat())
    }

    /// Visits every key of every tree, pruning multi-version values. Used
    /// when aborted transactions may have left versions in checkpointed
    /// page images whose touched keys are unknown.
    fn prune_sweep(&self, ctx: &Arc<TxContext>, registry: &Arc<VolumeRegistry>) -> Result<()> {
        for volume in registry.list() {
            if volume.is_read_only() {
                continue;
            }
            let directory = exchange::directory_tree(ctx, &volume)?;
            let mut names = Vec::new();
            {
                let mut ex = Exchange::new(ctx.clone(), volume.clone(), directory)?;
                let filter = KeyFilter::parse("{\"byName\",*}")?;
                ex.key.clear();
                while ex.traverse(Direction::Gt, Some(&filter), None)? {
                    if let Ok(segments) = ex.key.decode_segments() {
                        if let Some(crate::key::KeySegment::String(name)) = segments.get(1) {
                            names.push(name.clone());
                        }
                    }
                }
            }
            for name in names {
                let Some(tree) = exchange::lookup_tree(ctx, &volume, &name)? else {
                    continue;
                };
                let ex = Exchange::new(ctx.clone(), volume.clone(), tree.clone())?;
                // Traverse shows only visible keys; walk the raw entries
                // instead.
                let mut keys = Vec::new();
                let mut probe: Vec<u8> = Vec::new();
                while let Some((next_key, _)) = ex.probe_entry(&probe, false)? {
                    keys.push(next_key.clone());
                    probe = next_key;
                }
                for key in keys {
                    exchange::prune_key(ctx, &volume, &tree, &Key::from_encoded(&key))?;
                }
            }
        }
        Ok(())
    }
}
