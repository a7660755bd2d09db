// src/dependencies/reduction.rs

//! Reduction groups: operators, per-group private slots and the final
//! combination into the region's storage.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::region::Region;

/// Identifier of a built-in reduction operator, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReductionOperatorId(pub u32);

impl ReductionOperatorId {
    pub const SUM_I64: Self = Self(0);
    pub const PROD_I64: Self = Self(1);
    pub const MAX_I64: Self = Self(2);
    pub const MIN_I64: Self = Self(3);
    pub const SUM_F64: Self = Self(4);

    pub fn operator(self) -> Option<&'static ReductionOperator> {
        OPERATORS.get(self.0 as usize)
    }
}

/// Element-wise operator over little-endian 8-byte lanes.
pub struct ReductionOperator {
    pub name: &'static str,
    identity: fn(&mut [u8]),
    combine: fn(&mut [u8], &[u8]),
}

impl fmt::Debug for ReductionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl ReductionOperator {
    pub fn fill_identity(&self, buf: &mut [u8]) {
        (self.identity)(buf)
    }

    pub fn combine(&self, acc: &mut [u8], other: &[u8]) {
        (self.combine)(acc, other)
    }
}

static OPERATORS: [ReductionOperator; 5] = [
    ReductionOperator {
        name: "sum_i64",
        identity: |buf| fill_i64(buf, 0),
        combine: |acc, other| zip_i64(acc, other, i64::wrapping_add),
    },
    ReductionOperator {
        name: "prod_i64",
        identity: |buf| fill_i64(buf, 1),
        combine: |acc, other| zip_i64(acc, other, i64::wrapping_mul),
    },
    ReductionOperator {
        name: "max_i64",
        identity: |buf| fill_i64(buf, i64::MIN),
        combine: |acc, other| zip_i64(acc, other, i64::max),
    },
    ReductionOperator {
        name: "min_i64",
        identity: |buf| fill_i64(buf, i64::MAX),
        combine: |acc, other| zip_i64(acc, other, i64::min),
    },
    ReductionOperator {
        name: "sum_f64",
        identity: |buf| {
            for lane in buf.chunks_exact_mut(8) {
                lane.copy_from_slice(&0f64.to_le_bytes());
            }
        },
        combine: |acc, other| {
            for (a, b) in acc.chunks_exact_mut(8).zip(other.chunks_exact(8)) {
                let sum = lane_f64(a) + lane_f64(b);
                a.copy_from_slice(&sum.to_le_bytes());
            }
        },
    },
];

fn fill_i64(buf: &mut [u8], value: i64) {
    for lane in buf.chunks_exact_mut(8) {
        lane.copy_from_slice(&value.to_le_bytes());
    }
}

fn zip_i64(acc: &mut [u8], other: &[u8], op: fn(i64, i64) -> i64) {
    for (a, b) in acc.chunks_exact_mut(8).zip(other.chunks_exact(8)) {
        let value = op(lane_i64(a), lane_i64(b));
        a.copy_from_slice(&value.to_le_bytes());
    }
}

fn lane_i64(lane: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(lane);
    i64::from_le_bytes(raw)
}

fn lane_f64(lane: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(lane);
    f64::from_le_bytes(raw)
}

/// Shared state of one reduction group on one region.
///
/// Every participating access runs against a private slot; slots are
/// handed out through an atomic bitset so that concurrent participants
/// never share one. The slots are folded into the region exactly once, when
/// the last access of the group forwards satisfiability past the group.
pub struct ReductionInfo {
    region: Region,
    operator: ReductionOperatorId,
    slots: Vec<Mutex<Vec<u8>>>,
    busy: AtomicU64,
    used: AtomicU64,
    participants: AtomicUsize,
    combined: AtomicBool,
}

impl fmt::Debug for ReductionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReductionInfo")
            .field("region", &self.region)
            .field("operator", &self.operator)
            .field("slots", &self.slots.len())
            .field("participants", &self.participants.load(Ordering::Relaxed))
            .finish()
    }
}

impl ReductionInfo {
    pub fn new(region: Region, operator: ReductionOperatorId, slot_count: usize) -> Self {
        assert!(
            (1..=64).contains(&slot_count),
            "reduction slot count must be within 1..=64"
        );
        let op = operator
            .operator()
            .unwrap_or_else(|| panic!("unknown reduction operator {operator:?}"));
        let slots = (0..slot_count)
            .map(|_| {
                let mut buf = vec![0u8; region.len as usize];
                op.fill_identity(&mut buf);
                Mutex::new(buf)
            })
            .collect();
        Self {
            region,
            operator,
            slots,
            busy: AtomicU64::new(0),
            used: AtomicU64::new(0),
            participants: AtomicUsize::new(0),
            combined: AtomicBool::new(false),
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn operator(&self) -> ReductionOperatorId {
        self.operator
    }

    pub fn participants(&self) -> usize {
        self.participants.load(Ordering::Acquire)
    }

    pub(crate) fn register_participant(&self) {
        self.participants.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_combined(&self) -> bool {
        self.combined.load(Ordering::Acquire)
    }

    /// Grab a free private slot, spinning while all of them are taken.
    pub fn acquire_slot(&self) -> ReductionSlot<'_> {
        let count = self.slots.len();
        loop {
            let busy = self.busy.load(Ordering::Acquire);
            let free = (!busy).trailing_zeros() as usize;
            if free < count {
                let bit = 1u64 << free;
                if self
                    .busy
                    .compare_exchange(busy, busy | bit, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.used.fetch_or(bit, Ordering::AcqRel);
                    return ReductionSlot {
                        info: self,
                        index: free,
                        storage: self.slots[free].lock(),
                    };
                }
                continue;
            }
            std::thread::yield_now();
        }
    }

    /// Fold every used slot into `original`, which holds the region's
    /// value from before the group.
    pub fn combine_into(&self, original: &mut [u8]) {
        let already = self.combined.swap(true, Ordering::AcqRel);
        assert!(!already, "reduction on {} combined twice", self.region);
        assert_eq!(original.len() as u64, self.region.len);
        let op = self
            .operator
            .operator()
            .unwrap_or_else(|| panic!("unknown reduction operator {:?}", self.operator));
        let used = self.used.load(Ordering::Acquire);
        for (index, slot) in self.slots.iter().enumerate() {
            if used & (1 << index) != 0 {
                op.combine(original, &slot.lock());
            }
        }
    }
}

/// Exclusive use of one private slot; released on drop.
pub struct ReductionSlot<'a> {
    info: &'a ReductionInfo,
    index: usize,
    storage: MutexGuard<'a, Vec<u8>>,
}

impl ReductionSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage
    }
}

impl Drop for ReductionSlot<'_> {
    fn drop(&mut self) {
        self.info
            .busy
            .fetch_and(!(1u64 << self.index), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i64s(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn concurrent_slots_are_distinct_and_combine_once() {
        let info = ReductionInfo::new(Region::new(0, 16), ReductionOperatorId::SUM_I64, 4);
        {
            let mut a = info.acquire_slot();
            let mut b = info.acquire_slot();
            assert_ne!(a.index(), b.index());
            ReductionOperatorId::SUM_I64
                .operator()
                .unwrap()
                .combine(a.as_mut_slice(), &i64s(&[1, 2]));
            ReductionOperatorId::SUM_I64
                .operator()
                .unwrap()
                .combine(b.as_mut_slice(), &i64s(&[10, 20]));
        }
        let mut original = i64s(&[100, 200]);
        info.combine_into(&mut original);
        assert_eq!(original, i64s(&[111, 222]));
    }

    #[test]
    #[should_panic(expected = "combined twice")]
    fn second_combination_is_rejected() {
        let info = ReductionInfo::new(Region::new(0, 8), ReductionOperatorId::MAX_I64, 1);
        let mut buf = i64s(&[3]);
        info.combine_into(&mut buf);
        info.combine_into(&mut buf);
    }
}
