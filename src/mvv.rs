//! Multi-version value layout and pruning.
//!
//! A key under transactional control stores an MVV: a list of co-resident
//! versions, each tagged with the writing transaction's timestamp. Version
//! tags are *start* timestamps until pruning resolves them through the
//! transaction index and rewrites them to commit timestamps; readers always
//! resolve through the index so both forms are equivalent.

use crate::error::{PersistitError, Result};
use crate::value::TAG_MVV;

/// Sentinel commit timestamp marking an aborted transaction.
pub const ABORTED: u64 = u64::MAX;

/// Visibility of one version tag, as answered by the transaction index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxVisibility {
    /// Committed at the given commit timestamp.
    Committed(u64),
    Aborted,
    Active,
    /// Tag is already a resolved commit timestamp (pruned entry).
    Resolved,
}

/// One version inside an MVV.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvvVersion {
    /// Start timestamp (unpruned) or commit timestamp (pruned).
    pub version: u64,
    pub tombstone: bool,
    pub payload: Vec<u8>,
}

const FLAG_TOMBSTONE: u8 = 0x01;
const FLAG_RESOLVED: u8 = 0x02;

/// Decoded MVV entry list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mvv {
    entries: Vec<(MvvVersion, bool)>,
}

impl Mvv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a stored value beginning with [`TAG_MVV`].
    pub fn decode(stored: &[u8]) -> Result<Self> {
        if stored.is_empty() || stored[0] != TAG_MVV {
            return Err(PersistitError::Corrupt("not a multi-version value".into()));
        }
        let mut entries = Vec::new();
        let mut pos = 1;
        while pos < stored.len() {
            if pos + 13 > stored.len() {
                return Err(PersistitError::Corrupt("truncated MVV entry".into()));
            }
            let version = u64::from_le_bytes(stored[pos..pos + 8].try_into().expect("8 bytes"));
            let flags = stored[pos + 8];
            let len =
                u32::from_le_bytes(stored[pos + 9..pos + 13].try_into().expect("4 bytes")) as usize;
            pos += 13;
            if pos + len > stored.len() {
                return Err(PersistitError::Corrupt("MVV payload overrun".into()));
            }
            entries.push((
                MvvVersion {
                    version,
                    tombstone: flags & FLAG_TOMBSTONE != 0,
                    payload: stored[pos..pos + len].to_vec(),
                },
                flags & FLAG_RESOLVED != 0,
            ));
            pos += len;
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + self
                .entries
                .iter()
                .map(|(v, _)| 13 + v.payload.len())
                .sum::<usize>(),
        );
        out.push(TAG_MVV);
        for (v, resolved) in &self.entries {
            out.extend_from_slice(&v.version.to_le_bytes());
            let mut flags = 0u8;
            if v.tombstone {
                flags |= FLAG_TOMBSTONE;
            }
            if *resolved {
                flags |= FLAG_RESOLVED;
            }
            out.push(flags);
            out.extend_from_slice(&(v.payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&v.payload);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version_count(&self) -> usize {
        self.entries.len()
    }

    /// Adds (or replaces) the version written by `version`. A transaction
    /// re-storing the same key folds into its existing entry.
    pub fn put(&mut self, version: u64, tombstone: bool, payload: &[u8]) {
        if let Some((existing, resolved)) = self
            .entries
            .iter_mut()
            .find(|(v, resolved)| !*resolved && v.version == version)
        {
            existing.tombstone = tombstone;
            existing.payload = payload.to_vec();
            let _ = resolved;
            return;
        }
        self.entries.push((
            MvvVersion {
                version,
                tombstone,
                payload: payload.to_vec(),
            },
            false,
        ));
    }

    /// Adds an already-resolved version tagged with its commit timestamp
    /// (recovery replay path).
    pub fn put_resolved(&mut self, commit_ts: u64, tombstone: bool, payload: &[u8]) {
        if let Some((existing, _)) = self
            .entries
            .iter_mut()
            .find(|(v, resolved)| *resolved && v.version == commit_ts)
        {
            existing.tombstone = tombstone;
            existing.payload = payload.to_vec();
            return;
        }
        self.entries.push((
            MvvVersion {
                version: commit_ts,
                tombstone,
                payload: payload.to_vec(),
            },
            true,
        ));
    }

    /// All versions, newest-insertion last.
    pub fn versions(&self) -> impl Iterator<Item = &MvvVersion> {
        self.entries.iter().map(|(v, _)| v)
    }

    /// Resolves the version visible to a reader with snapshot `snapshot_ts`.
    ///
    /// `own_start_ts` makes a transaction's uncommitted writes visible to
    /// itself. `visibility` answers for unresolved tags. Returns `None` when
    /// no version is visible or the visible version is a tombstone.
    pub fn visible<'a>(
        &'a self,
        snapshot_ts: u64,
        own_start_ts: Option<u64>,
        visibility: &dyn Fn(u64) -> TxVisibility,
    ) -> Option<&'a MvvVersion> {
        let mut best: Option<(u64, &MvvVersion)> = None;
        for (entry, resolved) in &self.entries {
            // Own uncommitted write wins over anything committed earlier.
            if Some(entry.version) == own_start_ts && !*resolved {
                return if entry.tombstone { None } else { Some(entry) };
            }
            let commit_ts = if *resolved {
                Some(entry.version)
            } else {
                match visibility(entry.version) {
                    TxVisibility::Committed(ts) => Some(ts),
                    TxVisibility::Resolved => Some(entry.version),
                    TxVisibility::Aborted | TxVisibility::Active => None,
                }
            };
            if let Some(ts) = commit_ts {
                if ts <= snapshot_ts && best.map(|(b, _)| ts > b).unwrap_or(true) {
                    best = Some((ts, entry));
                }
            }
        }
        best.and_then(|(_, entry)| if entry.tombstone { None } else { Some(entry) })
    }

    /// Removes obsolete versions: aborted entries are dropped, committed
    /// entries are rewritten to their commit timestamps, and resolved
    /// versions older than both `floor` and the newest resolved version are
    /// discarded. `floor` is the oldest active start timestamp (or the
    /// current timestamp when no transaction is active).
    pub fn prune(&mut self, floor: u64, visibility: &dyn Fn(u64) -> TxVisibility) {
        let mut kept: Vec<(MvvVersion, bool)> = Vec::with_capacity(self.entries.len());
        for (mut entry, resolved) in self.entries.drain(..) {
            if resolved {
                kept.push((entry, true));
                continue;
            }
            match visibility(entry.version) {
                TxVisibility::Aborted => {}
                TxVisibility::Committed(ts) => {
                    entry.version = ts;
                    kept.push((entry, true));
                }
                TxVisibility::Resolved => kept.push((entry, true)),
                TxVisibility::Active => kept.push((entry, false)),
            }
        }
        // Newest resolved version at or below the floor shadows everything
        // older than it.
        let shadow = kept
            .iter()
            .filter(|(v, resolved)| *resolved && v.version <= floor)
            .map(|(v, _)| v.version)
            .max();
        if let Some(shadow) = shadow {
            kept.retain(|(v, resolved)| !*resolved || v.version >= shadow);
        }
        self.entries = kept;
    }

    /// Drops every unresolved version tagged by `start_ts` (rollback path).
    pub fn strip(&mut self, start_ts: u64) {
        self.entries
            .retain(|(v, resolved)| *resolved || v.version != start_ts);
    }

    /// The newest resolved (committed) version, ignoring the index.
    pub fn newest_resolved(&self) -> Option<&MvvVersion> {
        self.entries
            .iter()
            .filter(|(_, resolved)| *resolved)
            .map(|(v, _)| v)
            .max_by_key(|v| v.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_resolved(_: u64) -> TxVisibility {
        TxVisibility::Resolved
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let mut mvv = Mvv::new();
        mvv.put(10, false, b"ten");
        mvv.put(20, true, b"");
        let decoded = Mvv::decode(&mvv.encode())?;
        assert_eq!(decoded, mvv);
        Ok(())
    }

    #[test]
    fn newest_committed_version_wins() {
        let mut mvv = Mvv::new();
        mvv.put(10, false, b"old");
        mvv.put(20, false, b"new");
        let visible = mvv.visible(25, None, &all_resolved).expect("visible");
        assert_eq!(visible.payload, b"new");
        let older = mvv.visible(15, None, &all_resolved).expect("visible");
        assert_eq!(older.payload, b"old");
        assert!(mvv.visible(5, None, &all_resolved).is_none());
    }

    #[test]
    fn own_writes_visible_before_commit() {
        let mut mvv = Mvv::new();
        mvv.put(10, false, b"committed");
        mvv.put(30, false, b"mine");
        let lens = |ts| {
            if ts == 30 {
                TxVisibility::Active
            } else {
                TxVisibility::Resolved
            }
        };
        assert_eq!(
            mvv.visible(15, Some(30), &lens).expect("own write").payload,
            b"mine"
        );
        // Another transaction at the same snapshot sees only the committed one.
        assert_eq!(
            mvv.visible(15, Some(99), &lens).expect("other").payload,
            b"committed"
        );
    }

    #[test]
    fn tombstone_hides_key() {
        let mut mvv = Mvv::new();
        mvv.put(10, false, b"x");
        mvv.put(20, true, b"");
        assert!(mvv.visible(25, None, &all_resolved).is_none());
        assert!(mvv.visible(15, None, &all_resolved).is_some());
    }

    #[test]
    fn prune_drops_aborted_and_rewrites_committed() {
        let mut mvv = Mvv::new();
        mvv.put(10, false, b"a");
        mvv.put(20, false, b"b");
        mvv.put(30, false, b"c");
        let lens = |ts| match ts {
            10 => TxVisibility::Committed(11),
            20 => TxVisibility::Aborted,
            30 => TxVisibility::Committed(31),
            _ => TxVisibility::Resolved,
        };
        mvv.prune(100, &lens);
        // Aborted 20 gone; 11 shadowed by 31 at floor 100.
        assert_eq!(mvv.version_count(), 1);
        let v = mvv.newest_resolved().expect("resolved");
        assert_eq!(v.version, 31);
        assert_eq!(v.payload, b"c");
    }

    #[test]
    fn prune_keeps_versions_needed_by_old_readers() {
        let mut mvv = Mvv::new();
        mvv.put(11, false, b"a");
        mvv.put(31, false, b"c");
        let lens = |_| TxVisibility::Resolved;
        mvv.prune(15, &lens);
        // A reader with snapshot 15 still needs version 11.
        assert_eq!(mvv.version_count(), 2);
    }

    #[test]
    fn strip_removes_only_the_aborted_writer() {
        let mut mvv = Mvv::new();
        mvv.put(10, false, b"keep");
        mvv.put(40, false, b"gone");
        let lens = |ts| {
            if ts == 10 {
                TxVisibility::Committed(12)
            } else {
                TxVisibility::Active
            }
        };
        mvv.prune(5, &lens);
        mvv.strip(40);
        assert_eq!(mvv.version_count(), 1);
        assert_eq!(mvv.newest_resolved().expect("v").payload, b"keep");
    }
}
