// src/dependencies/batch.rs

//! Scratch area collecting the effects of one dependency operation.
//!
//! Transitions never recurse into other tasks. They push their effects
//! here, and `DependencySystem::process` drains them with no task lock
//! held.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::dependencies::access::{AccessView, DataLinkSink, DataReleaseSink};
use crate::dependencies::reduction::ReductionInfo;
use crate::dependencies::update::{DelayedOperation, UpdateOperation};
use crate::region::Region;
use crate::tasks::Task;
use crate::types::{NodeId, WriteId};

/// Satisfiability reaching an access that feeds an offloaded task's
/// data-link step.
pub struct PendingLink {
    pub sink: Arc<dyn DataLinkSink>,
    pub region: Region,
    pub location: Option<NodeId>,
    pub write_id: WriteId,
    pub read: bool,
    pub write: bool,
}

/// A completed access of a task executed for another node.
pub struct PendingRelease {
    pub sink: Arc<dyn DataReleaseSink>,
    pub access: AccessView,
}

/// End of a reduction group. `deferred` is forwarded once the slots have
/// been folded into the region.
pub struct PendingCombination {
    pub info: Arc<ReductionInfo>,
    pub location: Option<NodeId>,
    pub write_id: WriteId,
    pub deferred: Option<UpdateOperation>,
}

/// A taskwait sink that became read and write satisfied.
pub struct SatisfiedSink {
    pub task: Arc<Task>,
    pub region: Region,
    pub location: Option<NodeId>,
    pub write_id: WriteId,
}

#[derive(Default)]
pub struct DependencyBatch {
    pub(crate) delayed: VecDeque<DelayedOperation>,
    pub(crate) satisfied_originators: Vec<Arc<Task>>,
    pub(crate) satisfied_commutative_originators: Vec<Arc<Task>>,
    pub(crate) released_commutative: Vec<Arc<Task>>,
    pub(crate) removable_tasks: Vec<Arc<Task>>,
    pub(crate) completed_taskwaits: Vec<Arc<Task>>,
    pub(crate) taskwait_sinks: Vec<SatisfiedSink>,
    pub(crate) pending_links: Vec<PendingLink>,
    pub(crate) pending_releases: Vec<PendingRelease>,
    pub(crate) combinations: Vec<PendingCombination>,
    #[cfg(debug_assertions)]
    in_use: bool,
}

impl DependencyBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DelayedOperation) {
        self.delayed.push_back(op);
    }

    pub fn is_empty(&self) -> bool {
        self.delayed.is_empty()
            && self.satisfied_originators.is_empty()
            && self.satisfied_commutative_originators.is_empty()
            && self.released_commutative.is_empty()
            && self.removable_tasks.is_empty()
            && self.completed_taskwaits.is_empty()
            && self.taskwait_sinks.is_empty()
            && self.pending_links.is_empty()
            && self.pending_releases.is_empty()
            && self.combinations.is_empty()
    }

    /// Mark the batch as being drained. Draining the same batch twice at
    /// once is a bug.
    pub(crate) fn begin(&mut self) {
        #[cfg(debug_assertions)]
        {
            assert!(!self.in_use, "dependency batch drained re-entrantly");
            self.in_use = true;
        }
    }

    pub(crate) fn end(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.in_use = false;
        }
    }
}

impl Drop for DependencyBatch {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.is_empty(), "dependency batch dropped with pending work");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::access::AccessHandle;
    use crate::types::TaskId;
    use crate::util::ArenaIndex;

    #[test]
    fn drained_batch_is_empty() {
        let mut batch = DependencyBatch::new();
        batch.push(DelayedOperation::Detached {
            target: AccessHandle {
                task: TaskId(1),
                index: ArenaIndex::new(0, 0),
            },
        });
        assert!(!batch.is_empty());
        batch.delayed.clear();
        assert!(batch.is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "re-entrantly")]
    fn nested_draining_is_rejected() {
        let mut batch = DependencyBatch::new();
        batch.begin();
        batch.begin();
    }
}
