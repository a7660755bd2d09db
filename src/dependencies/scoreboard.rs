// src/dependencies/scoreboard.rs

//! Commutative scoreboard: at most one holder per overlapping region.
//!
//! A task acquires all of its commutative regions at once or none of them.
//! Tasks that cannot acquire wait in FIFO order and are retried whenever a
//! holder releases.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::region::Region;
use crate::types::TaskId;

#[derive(Debug, Default)]
struct Board {
    /// Held regions keyed by start address.
    held: BTreeMap<u64, (Region, TaskId)>,
    waiters: VecDeque<(TaskId, Vec<Region>)>,
}

impl Board {
    fn conflicts(&self, region: Region) -> bool {
        // Held regions never overlap each other, so only the last one
        // starting before `region.end()` can intersect it.
        self.held
            .range(..region.end())
            .next_back()
            .is_some_and(|(_, (held, _))| held.overlaps(&region))
    }

    fn try_take(&mut self, task: TaskId, regions: &[Region]) -> bool {
        if regions.iter().any(|r| self.conflicts(*r)) {
            return false;
        }
        for region in regions {
            self.held.insert(region.start, (*region, task));
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct CommutativeScoreboard {
    board: Mutex<Board>,
}

impl CommutativeScoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every region for `task`, or queue it. Returns whether the
    /// task now holds its regions.
    pub fn acquire(&self, task: TaskId, regions: &[Region]) -> bool {
        let mut board = self.board.lock();
        // Queued tasks go first so that a newcomer cannot overtake them.
        let blocked_by_queue = board
            .waiters
            .iter()
            .any(|(_, queued)| queued.iter().any(|q| regions.iter().any(|r| q.overlaps(r))));
        if !blocked_by_queue && board.try_take(task, regions) {
            trace!(%task, count = regions.len(), "commutative regions acquired");
            return true;
        }
        trace!(%task, "commutative acquisition queued");
        board.waiters.push_back((task, regions.to_vec()));
        false
    }

    /// Release `task`'s regions and return the waiters that acquired theirs
    /// as a consequence, in queue order.
    pub fn release(&self, task: TaskId, regions: &[Region]) -> Vec<TaskId> {
        let mut board = self.board.lock();
        for region in regions {
            match board.held.get(&region.start) {
                Some((held, holder)) if *holder == task && held == region => {
                    board.held.remove(&region.start);
                }
                other => panic!("{task} releases commutative {region} held by {other:?}"),
            }
        }

        let mut granted = Vec::new();
        let mut still_waiting = VecDeque::new();
        let waiters = std::mem::take(&mut board.waiters);
        for (waiter, wanted) in waiters {
            // A waiter may not overtake an earlier, still blocked, one.
            let behind_blocked = still_waiting.iter().any(|(_, queued): &(TaskId, Vec<Region>)| {
                queued.iter().any(|q| wanted.iter().any(|r| q.overlaps(r)))
            });
            if !behind_blocked && board.try_take(waiter, &wanted) {
                granted.push(waiter);
            } else {
                still_waiting.push_back((waiter, wanted));
            }
        }
        board.waiters = still_waiting;
        granted
    }

    pub fn holder_of(&self, region: Region) -> Option<TaskId> {
        let board = self.board.lock();
        board
            .held
            .values()
            .find(|(held, _)| held.overlaps(&region))
            .map(|(_, task)| *task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_holders_are_serialized_in_fifo_order() {
        let board = CommutativeScoreboard::new();
        let r = Region::new(0x100, 64);
        assert!(board.acquire(TaskId(1), &[r]));
        assert!(!board.acquire(TaskId(2), &[Region::new(0x120, 8)]));
        assert!(!board.acquire(TaskId(3), &[r]));
        assert_eq!(board.holder_of(r), Some(TaskId(1)));

        assert_eq!(board.release(TaskId(1), &[r]), vec![TaskId(2)]);
        assert_eq!(board.release(TaskId(2), &[Region::new(0x120, 8)]), vec![TaskId(3)]);
        assert_eq!(board.holder_of(r), Some(TaskId(3)));
    }

    #[test]
    fn acquisition_is_all_or_nothing() {
        let board = CommutativeScoreboard::new();
        let a = Region::new(0, 8);
        let b = Region::new(64, 8);
        assert!(board.acquire(TaskId(1), &[b]));
        assert!(!board.acquire(TaskId(2), &[a, b]));
        assert_eq!(board.holder_of(a), None);
        assert_eq!(board.release(TaskId(1), &[b]), vec![TaskId(2)]);
        assert_eq!(board.holder_of(a), Some(TaskId(2)));
    }

    #[test]
    fn disjoint_regions_do_not_contend() {
        let board = CommutativeScoreboard::new();
        assert!(board.acquire(TaskId(1), &[Region::new(0, 8)]));
        assert!(board.acquire(TaskId(2), &[Region::new(8, 8)]));
    }
}
