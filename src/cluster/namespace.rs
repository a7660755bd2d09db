// src/cluster/namespace.rs

//! Remote tasks living on this node, keyed by `(offloader, offloaded id)`.
//!
//! The namespace does three jobs:
//! - buffer satisfiability that overtakes its `TASK_NEW`;
//! - find the local task a `SATISFIABILITY` or `RELEASE_ACCESS` refers to;
//! - resolve namespace predecessors, so that two tasks offloaded here by the
//!   same node can hand satisfiability to each other directly.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::cluster::offloading::SatisfiabilityInfo;
use crate::types::{NodeId, TaskId};

pub type RemoteKey = (NodeId, u64);

#[derive(Debug)]
enum Entry {
    Pending(Vec<SatisfiabilityInfo>),
    Live(TaskId),
    Finished,
}

/// Where a piece of satisfiability for a remote task has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Apply it to this task now.
    Live(TaskId),
    /// Kept until the task is created.
    Buffered,
    /// The task is gone; drop it.
    Finished,
}

#[derive(Debug)]
pub struct NodeNamespace {
    enabled: bool,
    entries: Mutex<HashMap<RemoteKey, Entry>>,
}

impl NodeNamespace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether predecessor links between remote tasks are used.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn buffer_or_lookup(&self, key: RemoteKey, info: SatisfiabilityInfo) -> Delivery {
        let mut entries = self.entries.lock();
        match entries.entry(key).or_insert_with(|| Entry::Pending(Vec::new())) {
            Entry::Pending(buffered) => {
                trace!(offloader = key.0, id = key.1, region = %info.region, "satisfiability buffered");
                buffered.push(info);
                Delivery::Buffered
            }
            Entry::Live(task) => Delivery::Live(*task),
            Entry::Finished => Delivery::Finished,
        }
    }

    /// Register a freshly created remote task and hand back whatever was
    /// buffered for it.
    pub fn insert(&self, key: RemoteKey, task: TaskId) -> Vec<SatisfiabilityInfo> {
        let mut entries = self.entries.lock();
        match entries.insert(key, Entry::Live(task)) {
            Some(Entry::Pending(buffered)) => buffered,
            None => Vec::new(),
            Some(Entry::Live(previous)) => {
                panic!("remote task {key:?} created twice ({previous} and {task})")
            }
            Some(Entry::Finished) => panic!("remote task {key:?} created after finishing"),
        }
    }

    pub fn lookup(&self, key: RemoteKey) -> Option<TaskId> {
        match self.entries.lock().get(&key) {
            Some(Entry::Live(task)) => Some(*task),
            _ => None,
        }
    }

    /// Local task of a namespace predecessor, when the shortcut is on.
    pub fn resolve(&self, offloader: NodeId, offloaded_id: u64) -> Option<TaskId> {
        if !self.enabled {
            return None;
        }
        self.lookup((offloader, offloaded_id))
    }

    pub fn finish(&self, key: RemoteKey) {
        let previous = self.entries.lock().insert(key, Entry::Finished);
        if !matches!(previous, Some(Entry::Live(_))) {
            warn!(offloader = key.0, id = key.1, "finished a remote task that was not live");
        }
    }

    pub fn is_live(&self, offloader: NodeId, offloaded_id: u64) -> bool {
        self.lookup((offloader, offloaded_id)).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, Entry::Live(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::types::WriteId;

    fn info(read: bool) -> SatisfiabilityInfo {
        SatisfiabilityInfo::new(Region::new(0, 8), Some(0), read, !read, WriteId(1))
    }

    #[test]
    fn early_satisfiability_is_handed_over_on_insert() {
        let namespace = NodeNamespace::new(true);
        assert_eq!(namespace.buffer_or_lookup((0, 5), info(true)), Delivery::Buffered);
        assert_eq!(namespace.buffer_or_lookup((0, 5), info(false)), Delivery::Buffered);
        let buffered = namespace.insert((0, 5), TaskId(9));
        assert_eq!(buffered.len(), 2);
        assert_eq!(namespace.buffer_or_lookup((0, 5), info(true)), Delivery::Live(TaskId(9)));
    }

    #[test]
    fn finished_tasks_drop_satisfiability() {
        let namespace = NodeNamespace::new(true);
        namespace.insert((1, 2), TaskId(3));
        namespace.finish((1, 2));
        assert_eq!(namespace.buffer_or_lookup((1, 2), info(true)), Delivery::Finished);
        assert!(!namespace.is_live(1, 2));
    }

    #[test]
    fn disabled_namespace_never_resolves_predecessors() {
        let namespace = NodeNamespace::new(false);
        namespace.insert((0, 1), TaskId(4));
        assert_eq!(namespace.resolve(0, 1), None);
        assert_eq!(namespace.lookup((0, 1)), Some(TaskId(4)));
    }
}
