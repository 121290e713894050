//! The engine root: one `Persistit` value wires the buffer pools, the
//! volume registry, the journal, the transaction engine and the
//! background checkpointer, and is passed wherever a subsystem needs its
//! collaborators. There is no process-wide singleton.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::{Configuration, VolumeSpecification};
use crate::error::{PersistitError, Result};
use crate::exchange::{self, Direction, Exchange};
use crate::iometer::IoMeter;
use crate::journal::{Checkpoint, JournalManager};
use crate::key::KeySegment;
use crate::keyfilter::KeyFilter;
use crate::management::{
    self, BufferPoolInfo, JournalSnapshot, TaskRegistry, TransactionInfo, TreeInfo, VolumeInfo,
};
use crate::pool::BufferPool;
use crate::recovery::{RecoveryInfo, RecoveryManager};
use crate::transaction::accumulator::{AccumulatorType, Accumulators};
use crate::transaction::{TimestampAllocator, Transaction, TransactionIndex, TxContext};
use crate::tree::{self, Tree};
use crate::volume::{Volume, VolumeRegistry};

struct EngineShared {
    config: Configuration,
    io: Arc<IoMeter>,
    registry: Arc<VolumeRegistry>,
    journal: Arc<JournalManager>,
    ctx: Arc<TxContext>,
    tasks: TaskRegistry,
    recovery_info: RecoveryInfo,
    closing: AtomicBool,
    checkpointer: Mutex<Option<JoinHandle<()>>>,
}

/// The storage engine.
pub struct Persistit {
    shared: Arc<EngineShared>,
}

impl Persistit {
    /// Opens the engine: plans and applies recovery, opens the configured
    /// volumes, and launches the background workers.
    pub fn open(config: Configuration) -> Result<Self> {
        config.validate()?;
        let io = Arc::new(IoMeter::new());
        if let Some(path) = &config.io_log_path {
            io.open_log(path)?;
        }
        let registry = Arc::new(VolumeRegistry::new());

        // Phase 1: scan the journal.
        let recovery = RecoveryManager::new(&config.journal_path, &config.journal_prefix);
        let plan = recovery.plan(config.journal_block_size)?;
        let block_size = if plan.keystone_generation.is_some() {
            // An existing journal dictates its own block size.
            plan_block_size(&plan)
        } else {
            config.journal_block_size
        };

        // The journal manager continues from the recovered state.
        let journal = JournalManager::open(
            &config.journal_path,
            &config.journal_prefix,
            block_size,
            io.clone(),
            registry.clone(),
            plan.state.clone(),
        )?;

        let mut pools = Vec::with_capacity(config.buffer_pools.len());
        for &(page_size, frame_count) in &config.buffer_pools {
            let pool = BufferPool::new(
                page_size,
                frame_count,
                config.claim_timeout(),
                registry.clone(),
            );
            pool.attach_journal(journal.clone());
            pools.push(pool);
        }

        let tsa = Arc::new(TimestampAllocator::new());
        tsa.bump_to(plan.max_timestamp);
        let ctx = Arc::new(TxContext {
            tsa,
            index: Arc::new(TransactionIndex::new()),
            journal: journal.clone(),
            pools,
            accumulators: Arc::new(Accumulators::new()),
            commit_policy: config.commit_policy,
            trees: Mutex::new(FxHashMap::default()),
            commit_serial: Mutex::new(()),
            ddl_latch: Mutex::new(()),
        });

        // Volumes configured for startup must be open before phase 2.
        for spec_text in &config.volumes {
            let spec = VolumeSpecification::parse(spec_text)?;
            open_volume(&config, &ctx, &registry, &spec)?;
        }

        // Accumulator bases come from the last checkpoint's directory
        // entries; replayed deltas then land on top.
        seed_accumulators(&ctx, &registry)?;
        // Phase 2: reapply committed transactions, prune aborted ones.
        let recovery_info = recovery.apply(&plan, &ctx, &registry)?;

        journal.start_workers(&config)?;
        let shared = Arc::new(EngineShared {
            io,
            registry,
            journal,
            ctx,
            tasks: TaskRegistry::new(),
            recovery_info,
            closing: AtomicBool::new(false),
            checkpointer: Mutex::new(None),
            config,
        });
        // An immediate checkpoint makes the recovered state durable and
        // anchors the new journal generation.
        checkpoint_now(&shared)?;
        start_checkpointer(&shared)?;
        info!("persistit started");
        Ok(Self { shared })
    }

    /// Opens one additional volume from its specification text.
    pub fn load_volume(&self, spec_text: &str) -> Result<Arc<Volume>> {
        let spec = VolumeSpecification::parse(spec_text)?;
        open_volume(
            &self.shared.config,
            &self.shared.ctx,
            &self.shared.registry,
            &spec,
        )
    }

    pub fn volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.shared
            .registry
            .by_name(name)
            .ok_or_else(|| PersistitError::VolumeClosed(name.to_string()))
    }

    /// Builds an exchange over `(volume, tree)`, optionally creating the
    /// tree.
    pub fn exchange(
        &self,
        volume_name: &str,
        tree_name: &str,
        create_if_absent: bool,
    ) -> Result<Exchange> {
        self.check_open()?;
        let volume = self.volume(volume_name)?;
        let tree = match exchange::lookup_tree(&self.shared.ctx, &volume, tree_name)? {
            Some(tree) => tree,
            None if create_if_absent => exchange::create_tree(&self.shared.ctx, &volume, tree_name)?,
            None => return Err(PersistitError::TreeNotFound(tree_name.to_string())),
        };
        Exchange::new(self.shared.ctx.clone(), volume, tree)
    }

    /// Removes a tree and everything in it.
    pub fn remove_tree(
        &self,
        volume_name: &str,
        tree_name: &str,
        tx: Option<&mut Transaction>,
    ) -> Result<()> {
        self.check_open()?;
        let volume = self.volume(volume_name)?;
        let Some(tree) = exchange::lookup_tree(&self.shared.ctx, &volume, tree_name)? else {
            return Err(PersistitError::TreeNotFound(tree_name.to_string()));
        };
        exchange::remove_tree(&self.shared.ctx, &volume, &tree, tx)
    }

    /// Truncates a temporary volume back to its initial page count,
    /// dropping all of its trees.
    pub fn truncate_volume(&self, volume_name: &str) -> Result<()> {
        self.check_open()?;
        let volume = self.volume(volume_name)?;
        for pool in &self.shared.ctx.pools {
            if pool.page_size() == volume.page_size() {
                retry_invalidate(pool, &volume, self.shared.config.close_grace_ms)?;
            }
        }
        volume.truncate()?;
        self.shared
            .ctx
            .trees
            .lock()
            .retain(|(volume_id, _), _| *volume_id != volume.id());
        exchange::init_directory(&self.shared.ctx, &volume)
    }

    /// Names of the trees in a volume, directory excluded.
    pub fn tree_names(&self, volume_name: &str) -> Result<Vec<String>> {
        let volume = self.volume(volume_name)?;
        let directory = exchange::directory_tree(&self.shared.ctx, &volume)?;
        let mut ex = Exchange::new(self.shared.ctx.clone(), volume, directory)?;
        let filter = KeyFilter::parse("{\"byName\",*}")?;
        let mut names = Vec::new();
        ex.key.clear();
        while ex.traverse(Direction::Gt, Some(&filter), None)? {
            if let Some(KeySegment::String(name)) = ex.key.decode_segments()?.get(1) {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    /// Starts a transaction bound to an explicit handle.
    pub fn begin(&self) -> Result<Transaction> {
        self.check_open()?;
        Ok(Transaction::begin(self.shared.ctx.clone()))
    }

    /// Forces a checkpoint now.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.check_open()?;
        checkpoint_now(&self.shared)
    }

    /// Flushes and fsyncs the journal.
    pub fn flush(&self) -> Result<()> {
        self.shared.journal.flush(true)?;
        Ok(())
    }

    /// AppendOnly mode passthrough (used by online backup).
    pub fn set_append_only(&self, enabled: bool) {
        self.shared.journal.set_append_only(enabled);
    }

    /// FastCopying mode passthrough.
    pub fn set_fast_copying(&self, enabled: bool) {
        self.shared.journal.set_fast_copying(enabled);
    }

    pub fn io_meter(&self) -> &Arc<IoMeter> {
        &self.shared.io
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.shared.tasks
    }

    pub fn recovery_info(&self) -> RecoveryInfo {
        self.shared.recovery_info.clone()
    }

    pub fn buffer_pool_info(&self) -> Vec<BufferPoolInfo> {
        let time = management::acquisition_time();
        self.shared
            .ctx
            .pools
            .iter()
            .map(|pool| {
                let c = pool.counters();
                let load = |a: &std::sync::atomic::AtomicU64| a.load(Ordering::Relaxed);
                BufferPoolInfo {
                    acquisition_time: time,
                    page_size: pool.page_size(),
                    frame_count: pool.frame_count(),
                    hit_count: load(&c.hit),
                    miss_count: load(&c.miss),
                    new_count: load(&c.new),
                    evict_count: load(&c.evict),
                    write_count: load(&c.write),
                    forced_write_count: load(&c.forced_write),
                    forced_checkpoint_write_count: load(&c.forced_checkpoint_write),
                    get_count: load(&c.get_total),
                    hit_ratio: pool.hit_ratio(),
                    valid_page_count: pool.valid_page_count(),
                    dirty_page_count: pool.dirty_page_count(),
                    reader_claimed_page_count: c.reader_claims.load(Ordering::Relaxed),
                    writer_claimed_page_count: c.writer_claims.load(Ordering::Relaxed),
                    earliest_dirty_timestamp: pool.earliest_dirty_timestamp(),
                }
            })
            .collect()
    }

    pub fn volume_info(&self) -> Vec<VolumeInfo> {
        let time = management::acquisition_time();
        self.shared
            .registry
            .list()
            .into_iter()
            .map(|volume| {
                let head = volume.head_state();
                let c = volume.counters();
                VolumeInfo {
                    acquisition_time: time,
                    id: volume.id(),
                    name: volume.name().to_string(),
                    path: volume.path().display().to_string(),
                    page_size: volume.page_size(),
                    page_count: head.page_count,
                    highest_page_used: head.highest_page_used,
                    garbage_root: head.garbage_root,
                    read_only: volume.is_read_only(),
                    temporary: volume.is_temporary(),
                    fetch_counter: c.fetch.load(Ordering::Relaxed),
                    traverse_counter: c.traverse.load(Ordering::Relaxed),
                    store_counter: c.store.load(Ordering::Relaxed),
                    remove_counter: c.remove.load(Ordering::Relaxed),
                    last_error: volume.last_error(),
                }
            })
            .collect()
    }

    pub fn tree_info(&self, volume_name: &str) -> Result<Vec<TreeInfo>> {
        let time = management::acquisition_time();
        let volume = self.volume(volume_name)?;
        let mut out = Vec::new();
        for name in self.tree_names(volume_name)? {
            let Some(tree) = exchange::lookup_tree(&self.shared.ctx, &volume, &name)? else {
                continue;
            };
            out.push(tree_info_for(&tree, time));
        }
        Ok(out)
    }

    pub fn journal_info(&self) -> JournalSnapshot {
        let info = self.shared.journal.info();
        JournalSnapshot {
            acquisition_time: management::acquisition_time(),
            current_address: info.current_address,
            base_address: info.base_address,
            flushed_address: info.flushed_address,
            page_map_size: info.page_map_size,
            tx_map_size: info.tx_map_size,
            current_generation: info.current_generation,
            append_only: info.append_only,
            fast_copying: info.fast_copying,
            last_checkpoint_timestamp: info.last_checkpoint_timestamp,
        }
    }

    pub fn transaction_info(&self) -> TransactionInfo {
        TransactionInfo {
            acquisition_time: management::acquisition_time(),
            current_timestamp: self.shared.ctx.tsa.current(),
            active_transaction_count: self.shared.ctx.index.active_count(),
        }
    }

    /// Live accumulator value, if any.
    pub fn accumulator_value(&self, volume_name: &str, tree_name: &str, index: u8) -> Result<Option<i64>> {
        let volume = self.volume(volume_name)?;
        let handle = self.shared.journal.handle_for_tree(&volume, tree_name)?;
        Ok(self.shared.ctx.accumulators.get(handle, index))
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(PersistitError::IllegalState("engine is closing"));
        }
        Ok(())
    }

    /// Orderly shutdown: final checkpoint, full copy-back, workers joined,
    /// volumes marked CLEAN.
    pub fn close(self) -> Result<()> {
        let shared = self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(handle) = shared.checkpointer.lock().take() {
            let _ = handle.join();
        }
        // Deferred deallocations become durable garbage chains first.
        let timestamp = shared.ctx.tsa.next();
        for volume in shared.registry.list() {
            if volume.is_read_only() || volume.is_temporary() {
                continue;
            }
            if let Ok(pool) = shared.ctx.pool_for(volume.page_size()) {
                volume.flush_deferred_deallocations(pool, &shared.journal, timestamp)?;
            }
        }
        checkpoint_now(&shared)?;
        shared.journal.copy_back_pages()?;
        shared
            .journal
            .close(Duration::from_millis(shared.config.close_grace_ms))?;
        for volume in shared.registry.list() {
            for pool in &shared.ctx.pools {
                if pool.page_size() == volume.page_size() {
                    retry_invalidate(pool, &volume, shared.config.close_grace_ms)?;
                }
            }
            volume.fsync()?;
            volume.close()?;
        }
        shared.io.close_log()?;
        info!("persistit closed");
        Ok(())
    }
}

fn plan_block_size(plan: &crate::recovery::RecoveryPlan) -> u64 {
    // The plan's block size came from the keystone JH.
    plan.block_size()
}

fn tree_info_for(tree: &Arc<Tree>, time: u64) -> TreeInfo {
    let (root_page, depth) = tree.root();
    let (fetch, traverse, store, remove) = tree.counters();
    TreeInfo {
        acquisition_time: time,
        name: tree.name().to_string(),
        volume_id: tree.volume_id(),
        index: tree.index(),
        root_page,
        depth,
        fetch_counter: fetch,
        traverse_counter: traverse,
        store_counter: store,
        remove_counter: remove,
    }
}

fn open_volume(
    config: &Configuration,
    ctx: &Arc<TxContext>,
    registry: &Arc<VolumeRegistry>,
    spec: &VolumeSpecification,
) -> Result<Arc<Volume>> {
    let mut spec = spec.clone();
    if spec.temporary {
        if let Some(tmp_dir) = &config.tmp_dir {
            if spec.path.is_relative() {
                spec.path = tmp_dir.join(&spec.path);
            }
        }
    }
    if let Some(existing) = registry.by_name(&spec.name()?) {
        return Ok(existing);
    }
    let volume = Volume::open_with_spec(&spec, ctx.journal.io_meter())?;
    // The pool for this page size must exist.
    ctx.pool_for(volume.page_size())?;
    registry.register(volume.clone())?;
    if !volume.is_read_only() {
        ctx.journal.handle_for_volume(&volume)?;
        if !volume.is_temporary() {
            // After a crash the file's head page is stale; the journal's
            // newest page-0 image carries the real roots and counters.
            let mut head_image = vec![0u8; volume.page_size()];
            if ctx.journal.read_page_image(&volume, 0, &mut head_image)? {
                volume.adopt_head(&head_image)?;
            }
        }
        exchange::init_directory(ctx, &volume)?;
    }
    Ok(volume)
}

/// Reads checkpointed accumulator base values back out of each volume's
/// directory tree.
fn seed_accumulators(ctx: &Arc<TxContext>, registry: &Arc<VolumeRegistry>) -> Result<()> {
    for volume in registry.list() {
        if volume.is_read_only() {
            continue;
        }
        let directory = exchange::directory_tree(ctx, &volume)?;
        let mut ex = Exchange::new(ctx.clone(), volume.clone(), directory)?;
        let filter = KeyFilter::parse("{\"accumulator\",*,*}")?;
        ex.key.clear();
        while ex.traverse(Direction::Gt, Some(&filter), None)? {
            let segments = ex.key.decode_segments()?;
            let (Some(KeySegment::String(tree_name)), Some(KeySegment::Int(index))) =
                (segments.get(1), segments.get(2))
            else {
                continue;
            };
            let payload = ex.value.as_bytes();
            if payload.len() < 9 {
                continue;
            }
            let accumulator_type = AccumulatorType::from_u8(payload[0])?;
            let value = i64::from_le_bytes(payload[1..9].try_into().expect("8 bytes"));
            let handle = ctx.journal.handle_for_tree(&volume, tree_name)?;
            ctx.accumulators
                .seed(handle, *index as u8, accumulator_type, value);
        }
    }
    Ok(())
}

/// Takes one checkpoint: accumulator snapshot under the commit monitor,
/// dirty pages at or below the timestamp flushed, CP appended and synced.
fn checkpoint_now(shared: &Arc<EngineShared>) -> Result<Checkpoint> {
    let timestamp = {
        let _serial = shared.ctx.commit_serial.lock();
        let snapshot = shared.ctx.accumulators.snapshot();
        for (tree_handle, index, accumulator_type, value) in snapshot {
            let Some(ident) = shared.journal.tree_ident(tree_handle) else {
                continue;
            };
            let Some(volume_ident) = shared.journal.volume_ident(ident.volume_handle) else {
                continue;
            };
            let Some(volume) = shared.registry.by_id(volume_ident.id) else {
                continue;
            };
            let directory = exchange::directory_tree(&shared.ctx, &volume)?;
            let mut ex = Exchange::new(shared.ctx.clone(), volume, directory)?;
            ex.key = tree::accumulator_key(&ident.name, index)?;
            let mut payload = Vec::with_capacity(9);
            payload.push(accumulator_type as u8);
            payload.extend_from_slice(&value.to_le_bytes());
            ex.value.put_bytes(&payload);
            ex.store(None)?;
        }
        shared.ctx.tsa.next()
    };
    for pool in &shared.ctx.pools {
        pool.flush_dirty(timestamp, true)?;
    }
    let checkpoint = shared.journal.checkpoint(timestamp)?;
    debug!(timestamp, "checkpoint complete");
    Ok(checkpoint)
}

fn retry_invalidate(pool: &Arc<BufferPool>, volume: &Arc<Volume>, grace_ms: u64) -> Result<()> {
    let deadline = Instant::now() + Duration::from_millis(grace_ms);
    crate::error::retry_with_deadline(deadline, "volume invalidate", || {
        match pool.invalidate(volume) {
            Ok(()) => Ok(crate::error::Acquired::Ok(())),
            Err(e) if e.is_transient() => Ok(crate::error::Acquired::Retry),
            Err(e) => Err(e),
        }
    })
}

fn start_checkpointer(shared: &Arc<EngineShared>) -> Result<()> {
    if shared.config.checkpoint_interval_ms == 0 {
        return Ok(());
    }
    let interval = Duration::from_millis(shared.config.checkpoint_interval_ms);
    let weak = Arc::downgrade(shared);
    let handle = std::thread::Builder::new()
        .name("persistit-checkpointer".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            loop {
                std::thread::sleep(Duration::from_millis(50));
                let Some(shared) = weak.upgrade() else { break };
                if shared.closing.load(Ordering::Acquire) {
                    break;
                }
                if last.elapsed() >= interval {
                    match checkpoint_now(&shared) {
                        Ok(_) => {}
                        Err(e) => {
                            if e.is_transient() {
                                warn!(error = %e, "periodic checkpoint deferred");
                            } else {
                                error!(error = %e, "periodic checkpoint failed");
                            }
                        }
                    }
                    last = Instant::now();
                }
            }
            debug!("checkpointer stopped");
        })?;
    *shared.checkpointer.lock() = Some(handle);
    Ok(())
}
