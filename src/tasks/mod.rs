// src/tasks/mod.rs

//! Tasks: what the user submits, what the runtime tracks per task, and the
//! context a task body runs with.

mod blocking;
mod context;

pub use blocking::BlockingHandle;
pub use context::TaskContext;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cluster::offloading::ClusterTaskContext;
use crate::dependencies::access::{AccessSpec, AccessType, DataReleaseSink};
use crate::dependencies::reduction::ReductionOperatorId;
use crate::dependencies::TaskDataAccesses;
use crate::region::Region;
use crate::types::{NodeId, TaskId};
use crate::util::ArenaIndex;
use crate::workflow::Workflow;

pub(crate) use blocking::BlockingState;

/// A task implementation. Registered by name so that any node can run it.
pub type TaskFn = Arc<dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Completion callback fired once when a task is discarded.
pub type FinishCallback = Box<dyn FnOnce() + Send>;

/// Table of task implementations shared by every node of a cluster.
#[derive(Clone, Default)]
pub struct ImplementationTable {
    entries: HashMap<String, TaskFn>,
}

impl ImplementationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(body));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, body);
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl fmt::Debug for ImplementationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("ImplementationTable")
            .field("entries", &names)
            .finish()
    }
}

/// A task as submitted by a body through [`TaskContext::spawn`].
pub struct TaskSpec {
    pub label: String,
    pub implementation: String,
    pub args: Bytes,
    pub accesses: Vec<AccessSpec>,
    /// Preferred node; honoured whenever the task may be offloaded.
    pub on_node: Option<NodeId>,
    pub on_finish: Option<FinishCallback>,
}

impl TaskSpec {
    pub fn new(implementation: impl Into<String>) -> Self {
        let implementation = implementation.into();
        Self {
            label: implementation.clone(),
            implementation,
            args: Bytes::new(),
            accesses: Vec::new(),
            on_node: None,
            on_finish: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn args(mut self, args: impl Into<Bytes>) -> Self {
        self.args = args.into();
        self
    }

    pub fn access(mut self, access: AccessSpec) -> Self {
        self.accesses.push(access);
        self
    }

    pub fn read(self, region: Region) -> Self {
        self.access(AccessSpec::new(AccessType::Read, region))
    }

    pub fn write(self, region: Region) -> Self {
        self.access(AccessSpec::new(AccessType::Write, region))
    }

    pub fn read_write(self, region: Region) -> Self {
        self.access(AccessSpec::new(AccessType::ReadWrite, region))
    }

    pub fn concurrent(self, region: Region) -> Self {
        self.access(AccessSpec::new(AccessType::Concurrent, region))
    }

    pub fn commutative(self, region: Region) -> Self {
        self.access(AccessSpec::new(AccessType::Commutative, region))
    }

    pub fn reduction(self, region: Region, operator: ReductionOperatorId) -> Self {
        self.access(AccessSpec::reduction(region, operator))
    }

    pub fn on_node(mut self, node: NodeId) -> Self {
        self.on_node = Some(node);
        self
    }

    pub fn on_finish(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("label", &self.label)
            .field("implementation", &self.implementation)
            .field("args", &self.args.len())
            .field("accesses", &self.accesses)
            .field("on_node", &self.on_node)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub label: String,
    pub implementation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// The main program of a node.
    Root,
    User,
    /// A closure run through `spawn_function`; never has accesses.
    Spawned,
    /// Executes here on behalf of `offloader`, where it is `offloaded_id`.
    Remote { offloader: NodeId, offloaded_id: u64 },
}

pub(crate) enum TaskBody {
    None,
    Registered(TaskFn),
    Spawned(Mutex<Option<Box<dyn FnOnce() + Send>>>),
}

/// The workflow a task is currently driven by, and its execution step.
#[derive(Clone)]
pub struct ExecutionSlot {
    pub workflow: Arc<Workflow>,
    pub step: ArenaIndex,
}

pub struct Task {
    id: TaskId,
    info: TaskInfo,
    args: Bytes,
    declared: Vec<AccessSpec>,
    parent: Option<Arc<Task>>,
    pub(crate) body: TaskBody,
    kind: TaskKind,
    node_hint: Option<NodeId>,
    pub(crate) accesses: Mutex<TaskDataAccesses>,
    /// Registration guard plus unsatisfied non-weak accesses.
    pub(crate) pending_predecessors: AtomicUsize,
    /// "Not finished" plus incomplete accesses plus live children.
    pub(crate) removal_blockers: AtomicUsize,
    pub(crate) live_children: AtomicUsize,
    pub(crate) taskwait_pending: AtomicUsize,
    finished: AtomicBool,
    disposed: AtomicBool,
    waiting: AtomicBool,
    pub(crate) cluster_context: Mutex<Option<ClusterTaskContext>>,
    pub(crate) workflow: Mutex<Option<ExecutionSlot>>,
    pub(crate) release_sink: Mutex<Option<Arc<dyn DataReleaseSink>>>,
    on_finish: Mutex<Option<FinishCallback>>,
    pub(crate) blocking: Arc<BlockingState>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        info: TaskInfo,
        args: Bytes,
        declared: Vec<AccessSpec>,
        parent: Option<Arc<Task>>,
        body: TaskBody,
        kind: TaskKind,
        node_hint: Option<NodeId>,
        on_finish: Option<FinishCallback>,
    ) -> Self {
        Self {
            id,
            info,
            args,
            declared,
            parent,
            body,
            kind,
            node_hint,
            accesses: Mutex::new(TaskDataAccesses::default()),
            pending_predecessors: AtomicUsize::new(1),
            removal_blockers: AtomicUsize::new(1),
            live_children: AtomicUsize::new(0),
            taskwait_pending: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            cluster_context: Mutex::new(None),
            workflow: Mutex::new(None),
            release_sink: Mutex::new(None),
            on_finish: Mutex::new(on_finish),
            blocking: Arc::new(BlockingState::new(id)),
        }
    }

    /// A task without a body, for driving a
    /// [`DependencySystem`](crate::dependencies::DependencySystem) directly.
    pub fn bare(
        id: TaskId,
        label: impl Into<String>,
        accesses: Vec<AccessSpec>,
        parent: Option<Arc<Task>>,
        kind: TaskKind,
    ) -> Self {
        let label = label.into();
        Self::new(
            id,
            TaskInfo {
                implementation: label.clone(),
                label,
            },
            Bytes::new(),
            accesses,
            parent,
            TaskBody::None,
            kind,
            None,
            None,
        )
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn label(&self) -> &str {
        &self.info.label
    }

    pub fn args(&self) -> &Bytes {
        &self.args
    }

    pub fn declared(&self) -> &[AccessSpec] {
        &self.declared
    }

    pub fn parent(&self) -> Option<&Arc<Task>> {
        self.parent.as_ref()
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn node_hint(&self) -> Option<NodeId> {
        self.node_hint
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, TaskKind::Remote { .. })
    }

    pub fn is_spawned(&self) -> bool {
        matches!(self.kind, TaskKind::Spawned)
    }

    pub fn has_commutative(&self) -> bool {
        self.declared
            .iter()
            .any(|a| a.kind == AccessType::Commutative && !a.weak)
    }

    pub fn has_reduction(&self) -> bool {
        self.declared.iter().any(|a| a.kind == AccessType::Reduction)
    }

    pub(crate) fn commutative_regions(&self) -> Vec<Region> {
        self.declared
            .iter()
            .filter(|a| a.kind == AccessType::Commutative && !a.weak)
            .map(|a| a.region)
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Returns false if the task was already marked finished.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn take_on_finish(&self) -> Option<FinishCallback> {
        self.on_finish.lock().take()
    }

    /// Whether every taskwait sink and every child is gone.
    pub fn taskwait_satisfied(&self) -> bool {
        self.taskwait_pending.load(Ordering::SeqCst) == 0
            && self.live_children.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn begin_taskwait(&self) {
        let was_waiting = self.waiting.swap(true, Ordering::SeqCst);
        assert!(!was_waiting, "{} entered a taskwait twice", self.id);
    }

    /// Returns true for exactly one caller once the taskwait can complete.
    pub(crate) fn try_complete_taskwait(&self) -> bool {
        self.taskwait_satisfied() && self.waiting.swap(false, Ordering::SeqCst)
    }

    pub fn in_taskwait(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn execution_slot(&self) -> Option<ExecutionSlot> {
        self.workflow.lock().clone()
    }

    pub fn cluster_context(&self) -> Option<ClusterTaskContext> {
        *self.cluster_context.lock()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.info.label)
            .field("kind", &self.kind)
            .field(
                "pending",
                &self.pending_predecessors.load(Ordering::Relaxed),
            )
            .field("blockers", &self.removal_blockers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
