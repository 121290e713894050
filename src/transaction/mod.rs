//! Transaction engine: timestamps, status index, explicit handles.
//!
//! A transaction is an explicit handle, never bound to thread identity.
//! Reads resolve through an MVCC lens keyed by the start timestamp;
//! writes land in the trees as versions tagged with the start timestamp
//! and resolve to commit timestamps through the [`TransactionIndex`].
//! Commit appends the chained TX records and waits on the flusher per the
//! configured policy; rollback writes a zero-op ABORTED record and strips
//! the aborted versions.

pub mod accumulator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::CommitPolicy;
use crate::error::{PersistitError, Result};
use crate::journal::{record, JournalManager};
use crate::key::Key;
use crate::mvv::{self, TxVisibility};
use crate::pool::BufferPool;
use crate::tree::Tree;
use crate::volume::Volume;
use accumulator::{AccumulatorType, Accumulators};

/// Monotonic timestamp source; never reuses a value.
pub struct TimestampAllocator {
    next: AtomicU64,
}

impl TimestampAllocator {
    /// Timestamps below this are reserved (guards, primordial pages).
    pub const FIRST: u64 = 16;

    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(Self::FIRST),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Newest allocated timestamp.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Advances past `floor`; recovery calls this with the highest
    /// timestamp observed in the journal.
    pub fn bump_to(&self, floor: u64) {
        let mut current = self.next.load(Ordering::Acquire);
        while current <= floor {
            match self.next.compare_exchange(
                current,
                floor + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed(u64),
    Aborted,
}

/// Status table mapping start timestamps to transaction outcomes.
///
/// Version tags in MVVs are start timestamps until pruning rewrites them;
/// any tag the index does not know is already resolved.
#[derive(Default)]
pub struct TransactionIndex {
    map: Mutex<FxHashMap<u64, TxStatus>>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, start_ts: u64) {
        self.map.lock().insert(start_ts, TxStatus::Active);
    }

    pub fn commit(&self, start_ts: u64, commit_ts: u64) {
        self.map
            .lock()
            .insert(start_ts, TxStatus::Committed(commit_ts));
    }

    pub fn abort(&self, start_ts: u64) {
        self.map.lock().insert(start_ts, TxStatus::Aborted);
    }

    /// Drops a fully pruned transaction from the table.
    pub fn forget(&self, start_ts: u64) {
        self.map.lock().remove(&start_ts);
    }

    /// The MVCC lens used by readers and the pruner.
    pub fn visibility(&self, version_ts: u64) -> TxVisibility {
        match self.map.lock().get(&version_ts) {
            Some(TxStatus::Active) => TxVisibility::Active,
            Some(TxStatus::Committed(commit_ts)) => TxVisibility::Committed(*commit_ts),
            Some(TxStatus::Aborted) => TxVisibility::Aborted,
            None => TxVisibility::Resolved,
        }
    }

    /// Oldest start timestamp still active, bounding MVV pruning.
    pub fn oldest_active(&self) -> Option<u64> {
        self.map
            .lock()
            .iter()
            .filter_map(|(&ts, status)| {
                if *status == TxStatus::Active {
                    Some(ts)
                } else {
                    None
                }
            })
            .min()
    }

    pub fn active_count(&self) -> usize {
        self.map
            .lock()
            .values()
            .filter(|s| matches!(s, TxStatus::Active))
            .count()
    }
}

/// Shared engine context threaded through exchanges and transactions.
pub struct TxContext {
    pub tsa: Arc<TimestampAllocator>,
    pub index: Arc<TransactionIndex>,
    pub journal: Arc<JournalManager>,
    pub pools: Vec<Arc<BufferPool>>,
    pub accumulators: Arc<Accumulators>,
    pub commit_policy: CommitPolicy,
    /// Canonical tree handles, keyed by (volume id, tree name). One
    /// instance per tree so the writer latch is shared.
    pub trees: Mutex<FxHashMap<(u64, String), Arc<Tree>>>,
    /// Serializes commit-timestamp assignment, TX append and accumulator
    /// application, so a checkpoint snapshot taken under this monitor sees
    /// every delta whose commit timestamp precedes the checkpoint's.
    pub commit_serial: Mutex<()>,
    /// Serializes tree creation and removal.
    pub ddl_latch: Mutex<()>,
}

impl TxContext {
    pub fn pool_for(&self, page_size: usize) -> Result<&Arc<BufferPool>> {
        self.pools
            .iter()
            .find(|p| p.page_size() == page_size)
            .ok_or(PersistitError::IllegalState(
                "no buffer pool for this page size",
            ))
    }

    /// Snapshot timestamp for a non-transactional read: everything
    /// committed so far.
    pub fn read_snapshot(&self) -> u64 {
        self.tsa.current()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

struct TouchedKey {
    volume: Arc<Volume>,
    tree: Arc<Tree>,
    key: Key,
}

/// An explicit transaction handle.
pub struct Transaction {
    ctx: Arc<TxContext>,
    start_ts: u64,
    state: TxState,
    ops: BytesMut,
    touched: Vec<TouchedKey>,
    deltas: Vec<(i32, u8, AccumulatorType, i64)>,
}

impl Transaction {
    pub(crate) fn begin(ctx: Arc<TxContext>) -> Self {
        let start_ts = ctx.tsa.next();
        ctx.index.begin(start_ts);
        debug!(start_ts, "transaction started");
        Self {
            ctx,
            start_ts,
            state: TxState::Active,
            ops: BytesMut::new(),
            touched: Vec::new(),
            deltas: Vec::new(),
        }
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_ts
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(PersistitError::IllegalState("transaction not active"));
        }
        Ok(())
    }

    /// Records a store op in the TX buffer and remembers the touched key
    /// for post-commit pruning.
    pub(crate) fn note_store(
        &mut self,
        tree_handle: i32,
        volume: &Arc<Volume>,
        tree: &Arc<Tree>,
        key: &Key,
        value_envelope: &[u8],
    ) {
        record::encode_sr(tree_handle, key.encoded(), value_envelope, &mut self.ops);
        self.note_touched(volume, tree, key);
    }

    pub(crate) fn note_delete_range(
        &mut self,
        tree_handle: i32,
        volume: &Arc<Volume>,
        tree: &Arc<Tree>,
        key_low: &Key,
        key_high: &Key,
    ) {
        record::encode_dr(tree_handle, key_low.encoded(), key_high.encoded(), &mut self.ops);
        self.note_touched(volume, tree, key_low);
    }

    pub(crate) fn note_delete_tree(&mut self, tree_handle: i32) {
        record::encode_dt(tree_handle, &mut self.ops);
    }

    fn note_touched(&mut self, volume: &Arc<Volume>, tree: &Arc<Tree>, key: &Key) {
        self.touched.push(TouchedKey {
            volume: volume.clone(),
            tree: tree.clone(),
            key: key.clone(),
        });
    }

    /// Registers an accumulator delta; visible to others at commit.
    pub fn accumulate(
        &mut self,
        tree_handle: i32,
        index: u8,
        accumulator_type: AccumulatorType,
        delta: i64,
    ) -> Result<()> {
        self.ensure_active()?;
        self.deltas
            .push((tree_handle, index, accumulator_type, delta));
        Ok(())
    }

    /// Whether any operation has been buffered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.deltas.is_empty()
    }

    /// Commits: assigns the commit timestamp, appends the TX chain, waits
    /// for durability per policy, publishes the outcome and prunes.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        for &(tree_handle, index, accumulator_type, delta) in &self.deltas {
            record::encode_delta(
                tree_handle,
                index,
                accumulator_type as u8,
                delta,
                &mut self.ops,
            );
        }
        // Timestamp assignment, journal append, visibility and delta
        // application are one atom with respect to checkpoint snapshots.
        let (commit_ts, end_address) = {
            let _serial = self.ctx.commit_serial.lock();
            let commit_ts = self.ctx.tsa.next();
            let end_address = self
                .ctx
                .journal
                .write_transaction(self.start_ts, commit_ts, &self.ops)?;
            self.ctx.index.commit(self.start_ts, commit_ts);
            for &(tree_handle, index, accumulator_type, delta) in &self.deltas {
                self.ctx
                    .accumulators
                    .apply_delta(tree_handle, index, accumulator_type, delta);
            }
            (commit_ts, end_address)
        };
        match self.ctx.commit_policy {
            CommitPolicy::Hard => {
                self.ctx.journal.flush(true)?;
            }
            CommitPolicy::Group | CommitPolicy::Commit => {
                self.ctx.journal.wait_for_durability(end_address)?;
            }
        }
        self.state = TxState::Committed;
        if self.prune_touched() {
            // Every version tag was rewritten to the commit timestamp; the
            // index entry has nothing left to resolve.
            self.ctx.index.forget(self.start_ts);
        }
        debug!(start_ts = self.start_ts, commit_ts, "transaction committed");
        Ok(())
    }

    /// Rolls back: writes the zero-op ABORTED record and strips this
    /// transaction's versions from every touched key.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.ctx
            .journal
            .write_transaction(self.start_ts, mvv::ABORTED, &[])?;
        self.ctx.index.abort(self.start_ts);
        self.state = TxState::RolledBack;
        if self.prune_touched() {
            self.ctx.index.forget(self.start_ts);
        }
        debug!(start_ts = self.start_ts, "transaction rolled back");
        Ok(())
    }

    /// Best-effort MVV maintenance on the keys this transaction wrote.
    /// Returns whether every touched key was pruned.
    fn prune_touched(&mut self) -> bool {
        let touched = std::mem::take(&mut self.touched);
        let mut complete = true;
        for item in touched {
            if let Err(e) =
                crate::exchange::prune_key(&self.ctx, &item.volume, &item.tree, &item.key)
            {
                complete = false;
                if !e.is_transient() {
                    warn!(error = %e, "prune after transaction end failed");
                }
            }
        }
        complete
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(
                start_ts = self.start_ts,
                "transaction dropped while active; rolling back"
            );
            let _ = self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic_and_unique() {
        let tsa = TimestampAllocator::new();
        let a = tsa.next();
        let b = tsa.next();
        assert!(b > a);
        tsa.bump_to(1000);
        assert!(tsa.next() > 1000);
        tsa.bump_to(10);
        assert!(tsa.next() > 1000);
    }

    #[test]
    fn index_reports_visibility() {
        let index = TransactionIndex::new();
        index.begin(5);
        assert_eq!(index.visibility(5), TxVisibility::Active);
        index.commit(5, 9);
        assert_eq!(index.visibility(5), TxVisibility::Committed(9));
        index.begin(11);
        index.abort(11);
        assert_eq!(index.visibility(11), TxVisibility::Aborted);
        assert_eq!(index.visibility(999), TxVisibility::Resolved);
    }

    #[test]
    fn oldest_active_tracks_minimum() {
        let index = TransactionIndex::new();
        assert_eq!(index.oldest_active(), None);
        index.begin(20);
        index.begin(10);
        index.begin(30);
        assert_eq!(index.oldest_active(), Some(10));
        index.commit(10, 35);
        assert_eq!(index.oldest_active(), Some(20));
    }
}
