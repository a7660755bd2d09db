// src/workflow/steps.rs

//! Step kinds of an execution workflow and their per-kind state.

use std::collections::HashSet;
use std::fmt;

use crate::cluster::offloading::SatisfiabilityInfo;
use crate::region::Region;
use crate::types::{NodeId, WriteId};
use crate::util::ArenaIndex;

pub type NotificationCallback = Box<dyn FnOnce() + Send>;

/// Satisfiability of one access of an offloaded task, collected until the
/// region has been linked for both reading and writing.
#[derive(Debug)]
pub struct DataLinkState {
    pub(crate) region: Region,
    pub(crate) read_linked: bool,
    pub(crate) write_linked: bool,
    /// Bytes still to be linked: the region size once per dimension.
    pub(crate) remaining: u64,
    pub(crate) location: Option<NodeId>,
    pub(crate) write_id: WriteId,
}

impl DataLinkState {
    /// Record the dimensions in `read`/`write` that are new. Returns the
    /// dimensions that were actually linked by this call.
    pub(crate) fn link(
        &mut self,
        location: Option<NodeId>,
        write_id: WriteId,
        read: bool,
        write: bool,
    ) -> (bool, bool) {
        let read = read && !self.read_linked;
        let write = write && !self.write_linked;
        if read {
            self.read_linked = true;
            self.remaining -= self.region.len;
        }
        if write {
            self.write_linked = true;
            self.remaining -= self.region.len;
        }
        if read || write {
            self.location = location;
            self.write_id = write_id;
        }
        (read, write)
    }
}

/// Copy of one region into this node, if it is not here yet.
#[derive(Debug, Clone, Copy)]
pub struct DataCopyState {
    pub(crate) region: Region,
    pub(crate) source: Option<NodeId>,
    pub(crate) write_id: WriteId,
}

#[derive(Debug)]
pub struct ClusterExecutionState {
    pub(crate) target: NodeId,
    pub(crate) infos: Vec<SatisfiabilityInfo>,
}

/// Release bookkeeping for the accesses of a task run for another node.
#[derive(Debug)]
pub struct DataReleaseState {
    pub(crate) remaining: u64,
    pub(crate) released: HashSet<Region>,
}

pub enum StepKind {
    DataLink(DataLinkState),
    DataCopy(DataCopyState),
    /// Placeholder for an access that needs no data movement.
    Null,
    HostExecution,
    ClusterExecution(ClusterExecutionState),
    DataRelease(DataReleaseState),
    Notification(Option<NotificationCallback>),
}

impl StepKind {
    pub fn data_link(region: Region) -> Self {
        StepKind::DataLink(DataLinkState {
            region,
            read_linked: false,
            write_linked: false,
            remaining: 2 * region.len,
            location: None,
            write_id: WriteId::NONE,
        })
    }

    pub fn data_copy(region: Region, source: Option<NodeId>, write_id: WriteId) -> Self {
        StepKind::DataCopy(DataCopyState {
            region,
            source,
            write_id,
        })
    }

    pub fn cluster_execution(target: NodeId) -> Self {
        StepKind::ClusterExecution(ClusterExecutionState {
            target,
            infos: Vec::new(),
        })
    }

    /// Release step covering `regions`.
    pub fn data_release(regions: impl IntoIterator<Item = Region>) -> Self {
        StepKind::DataRelease(DataReleaseState {
            remaining: regions.into_iter().map(|region| region.len).sum(),
            released: HashSet::new(),
        })
    }

    pub fn notification(callback: impl FnOnce() + Send + 'static) -> Self {
        StepKind::Notification(Some(Box::new(callback)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::DataLink(_) => "data-link",
            StepKind::DataCopy(_) => "data-copy",
            StepKind::Null => "null",
            StepKind::HostExecution => "host-execution",
            StepKind::ClusterExecution(_) => "cluster-execution",
            StepKind::DataRelease(_) => "data-release",
            StepKind::Notification(_) => "notification",
        }
    }

    /// Contributions still expected after the step's own action finished.
    pub(crate) fn outstanding(&self) -> u64 {
        match self {
            StepKind::DataLink(state) => state.remaining,
            StepKind::DataRelease(state) => state.remaining,
            _ => 0,
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::DataLink(state) => f.debug_tuple("DataLink").field(state).finish(),
            StepKind::DataCopy(state) => f.debug_tuple("DataCopy").field(state).finish(),
            StepKind::ClusterExecution(state) => {
                f.debug_tuple("ClusterExecution").field(state).finish()
            }
            StepKind::DataRelease(state) => f.debug_tuple("DataRelease").field(state).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// One node of a workflow graph.
#[derive(Debug)]
pub(crate) struct Step {
    pub(crate) kind: StepKind,
    /// Predecessors that have not released this step yet.
    pub(crate) waiting: usize,
    pub(crate) successors: Vec<ArenaIndex>,
    pub(crate) started: bool,
    /// The step's own action is over and its successors were released.
    pub(crate) completed: bool,
}

impl Step {
    pub(crate) fn new(kind: StepKind) -> Self {
        Self {
            kind,
            waiting: 0,
            successors: Vec::new(),
            started: false,
            completed: false,
        }
    }

    /// Nothing can reach the step any more.
    pub(crate) fn retirable(&self) -> bool {
        self.started && self.completed && self.kind.outstanding() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_counts_each_dimension_once() {
        let StepKind::DataLink(mut state) = StepKind::data_link(Region::new(0, 100)) else {
            unreachable!()
        };
        assert_eq!(state.remaining, 200);
        assert_eq!(state.link(Some(1), WriteId(4), true, false), (true, false));
        assert_eq!(state.link(Some(1), WriteId(4), true, true), (false, true));
        assert_eq!(state.link(Some(1), WriteId(4), true, true), (false, false));
        assert_eq!(state.remaining, 0);
    }

    #[test]
    fn release_covers_every_region() {
        let kind = StepKind::data_release([Region::new(0, 10), Region::new(64, 6)]);
        assert_eq!(kind.outstanding(), 16);
    }
}
