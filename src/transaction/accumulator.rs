//! Accumulators: per-(tree, index) running aggregates maintained
//! transactionally. Updates travel as deltas inside the owning
//! transaction; base values are materialized into the directory tree at
//! each checkpoint so recovery can seed them before replaying deltas.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{PersistitError, Result};

/// Aggregate flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AccumulatorType {
    Sum = 0,
    Min = 1,
    Max = 2,
    /// Monotonic sequence; deltas accumulate exactly like `Sum`.
    Seq = 3,
}

impl AccumulatorType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Sum),
            1 => Ok(Self::Min),
            2 => Ok(Self::Max),
            3 => Ok(Self::Seq),
            _ => Err(PersistitError::Corrupt(format!(
                "unknown accumulator type {value}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct AccumulatorEntry {
    accumulator_type: AccumulatorType,
    value: i64,
}

/// Live accumulator values keyed by (tree journal handle, index).
#[derive(Default)]
pub struct Accumulators {
    map: Mutex<FxHashMap<(i32, u8), AccumulatorEntry>>,
}

impl Accumulators {
    pub fn new() -> Self {
        Self::default()
    }

    fn initial(accumulator_type: AccumulatorType) -> i64 {
        match accumulator_type {
            AccumulatorType::Sum | AccumulatorType::Seq => 0,
            AccumulatorType::Min => i64::MAX,
            AccumulatorType::Max => i64::MIN,
        }
    }

    /// Applies one committed delta.
    pub fn apply_delta(
        &self,
        tree_handle: i32,
        index: u8,
        accumulator_type: AccumulatorType,
        delta: i64,
    ) {
        let mut map = self.map.lock();
        let entry = map.entry((tree_handle, index)).or_insert(AccumulatorEntry {
            accumulator_type,
            value: Self::initial(accumulator_type),
        });
        entry.value = match accumulator_type {
            AccumulatorType::Sum | AccumulatorType::Seq => entry.value.wrapping_add(delta),
            AccumulatorType::Min => entry.value.min(delta),
            AccumulatorType::Max => entry.value.max(delta),
        };
    }

    /// Replaces the base value (checkpoint seed during recovery).
    pub fn seed(&self, tree_handle: i32, index: u8, accumulator_type: AccumulatorType, value: i64) {
        self.map.lock().insert(
            (tree_handle, index),
            AccumulatorEntry {
                accumulator_type,
                value,
            },
        );
    }

    pub fn get(&self, tree_handle: i32, index: u8) -> Option<i64> {
        self.map.lock().get(&(tree_handle, index)).map(|e| e.value)
    }

    /// Every live accumulator, for checkpoint materialization.
    pub fn snapshot(&self) -> Vec<(i32, u8, AccumulatorType, i64)> {
        self.map
            .lock()
            .iter()
            .map(|(&(tree, index), entry)| (tree, index, entry.accumulator_type, entry.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_accumulates() {
        let acc = Accumulators::new();
        acc.apply_delta(1, 0, AccumulatorType::Sum, 5);
        acc.apply_delta(1, 0, AccumulatorType::Sum, -2);
        assert_eq!(acc.get(1, 0), Some(3));
    }

    #[test]
    fn min_max_track_extremes() {
        let acc = Accumulators::new();
        acc.apply_delta(1, 1, AccumulatorType::Min, 10);
        acc.apply_delta(1, 1, AccumulatorType::Min, 4);
        acc.apply_delta(1, 1, AccumulatorType::Min, 9);
        assert_eq!(acc.get(1, 1), Some(4));
        acc.apply_delta(1, 2, AccumulatorType::Max, -3);
        acc.apply_delta(1, 2, AccumulatorType::Max, 7);
        assert_eq!(acc.get(1, 2), Some(7));
    }

    #[test]
    fn seed_overrides_running_value() {
        let acc = Accumulators::new();
        acc.apply_delta(2, 0, AccumulatorType::Sum, 100);
        acc.seed(2, 0, AccumulatorType::Sum, 10);
        acc.apply_delta(2, 0, AccumulatorType::Sum, 1);
        assert_eq!(acc.get(2, 0), Some(11));
    }
}
