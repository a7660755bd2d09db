// src/scheduler.rs

//! Ready queue of one node and the cluster placement policies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::trace;

use crate::dependencies::access::AccessView;
use crate::memory::Directory;
use crate::tasks::Task;
use crate::types::{NodeId, SchedulingPolicy};

/// Why a task enters the ready queue.
///
/// - `Fresh`: its dependencies were just satisfied.
/// - `Deferred`: its execution step started outside a worker and the task
///   must run on a genuine worker thread. Deferred tasks go to the front,
///   since their data is already in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyHint {
    Fresh,
    Deferred,
}

#[derive(Debug)]
pub struct Scheduler {
    node: NodeId,
    cluster_size: usize,
    policy: SchedulingPolicy,
    queue: Mutex<VecDeque<Arc<Task>>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(node: NodeId, cluster_size: usize, policy: SchedulingPolicy) -> Self {
        Self {
            node,
            cluster_size: cluster_size.max(1),
            policy,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn add_ready_task(&self, task: Arc<Task>, hint: ReadyHint) {
        trace!(task = %task.id(), ?hint, "task queued");
        let mut queue = self.queue.lock();
        match hint {
            ReadyHint::Fresh => queue.push_back(task),
            ReadyHint::Deferred => queue.push_front(task),
        }
        self.available.notify_one();
    }

    pub fn get_ready_task(&self) -> Option<Arc<Task>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park until a task is queued, shutdown starts, or `timeout` elapses.
    pub fn wait_for_work(&self, timeout: Duration) {
        let mut queue = self.queue.lock();
        if queue.is_empty() && !self.is_shutting_down() {
            self.available.wait_for(&mut queue, timeout);
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _queue = self.queue.lock();
        self.available.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Node a ready, offloadable task should run on.
    ///
    /// - `Local` keeps everything here.
    /// - `Random` picks any node.
    /// - `Locality` picks the node holding most of the task's bytes, using
    ///   each access's current location or else its home node. Ties go to
    ///   this node, then to the lowest index.
    pub fn select_node(&self, accesses: &[AccessView], directory: &Directory) -> NodeId {
        if self.cluster_size == 1 {
            return self.node;
        }
        match self.policy {
            SchedulingPolicy::Local => self.node,
            SchedulingPolicy::Random => rand::thread_rng().gen_range(0..self.cluster_size),
            SchedulingPolicy::Locality => {
                let mut bytes: HashMap<NodeId, u64> = HashMap::new();
                for access in accesses {
                    if let Some(node) = access.location.or_else(|| directory.home(access.region)) {
                        *bytes.entry(node).or_default() += access.region.len;
                    }
                }
                let local = bytes.get(&self.node).copied().unwrap_or(0);
                let (best, most) = bytes
                    .iter()
                    .map(|(node, count)| (*node, *count))
                    .min_by_key(|(node, count)| (std::cmp::Reverse(*count), *node))
                    .unwrap_or((self.node, 0));
                if most > local { best } else { self.node }
            }
        }
    }
}
