// src/dependencies/system.rs

//! The dependency system of one node.
//!
//! Accesses are linked per region in program order through the bottom map
//! of their parent task. Every entry point works the same way: mutate the
//! accesses of one task under that task's lock, collect the effects in a
//! [`DependencyBatch`], then [`DependencySystem::process`] the batch, which
//! applies deferred operations one task lock at a time and finally calls
//! out to the listener with no lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::cluster::offloading::SatisfiabilityInfo;
use crate::dependencies::access::{
    AccessFlags, AccessHandle, AccessSpec, AccessType, AccessView, DataAccess, DataLinkSink,
    SinkRole, Successor,
};
use crate::dependencies::automaton::DataAccessMessage;
use crate::dependencies::batch::{
    DependencyBatch, PendingCombination, PendingRelease, SatisfiedSink,
};
use crate::dependencies::reduction::ReductionInfo;
use crate::dependencies::scoreboard::CommutativeScoreboard;
use crate::dependencies::update::{DelayedOperation, UpdateOperation};
use crate::errors::fatal;
use crate::memory::NodeMemory;
use crate::region::Region;
use crate::tasks::Task;
use crate::types::{NodeId, TaskId, WriteId};
use crate::util::{Arena, ArenaIndex};

const R: AccessFlags = AccessFlags::READ_SATISFIED;
const W: AccessFlags = AccessFlags::WRITE_SATISFIED;

/// What the bottom map of a task knows about one region.
#[derive(Debug, Clone, Copy)]
pub enum BottomEntry {
    /// Last access registered on the region by a child.
    Access(Successor),
    /// The chain completed; new accesses start satisfied with this data.
    Satisfied {
        location: Option<NodeId>,
        write_id: WriteId,
    },
}

/// Accesses owned by one task, plus the bottom map of its children.
#[derive(Debug, Default)]
pub struct TaskDataAccesses {
    pub(crate) arena: Arena<DataAccess>,
    pub(crate) declared: HashMap<Region, ArenaIndex>,
    pub(crate) bottom_map: HashMap<Region, BottomEntry>,
}

impl TaskDataAccesses {
    pub fn get(&self, index: ArenaIndex) -> Option<&DataAccess> {
        self.arena.get(index)
    }

    pub fn by_region(&self, region: Region) -> Option<&DataAccess> {
        self.declared
            .get(&region)
            .and_then(|index| self.arena.get(*index))
    }

    pub fn bottom_entry(&self, region: Region) -> Option<BottomEntry> {
        self.bottom_map.get(&region).copied()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// Callbacks from the dependency system into the rest of the node.
pub trait DependencyListener: Send + Sync {
    /// Every non-weak access is eligible (and commutative regions are held).
    fn task_ready(&self, task: Arc<Task>);

    /// The task finished and every access, sink and child is gone.
    fn task_removable(&self, task: Arc<Task>);

    fn taskwait_completed(&self, _task: &Arc<Task>) {}

    /// Bring `region` at version `write_id` from `from` into this node's
    /// memory, then call `then`.
    fn fetch_region(
        &self,
        _region: Region,
        _from: NodeId,
        _write_id: WriteId,
        then: Box<dyn FnOnce() + Send>,
    ) {
        then()
    }
}

enum InitialState {
    /// Waits for `predecessor`; a reduction may inherit its group.
    Linked {
        predecessor: AccessHandle,
        inherits_group: bool,
    },
    Satisfied {
        location: Option<NodeId>,
        write_id: WriteId,
    },
    /// Nested under the parent's own access.
    Child,
}

pub struct DependencySystem {
    node: NodeId,
    memory: Arc<NodeMemory>,
    tasks: RwLock<HashMap<TaskId, Arc<Task>>>,
    next_task_id: AtomicU64,
    scoreboard: CommutativeScoreboard,
    reduction_slots: usize,
    listener: Arc<dyn DependencyListener>,
    me: Weak<DependencySystem>,
}

impl DependencySystem {
    pub fn new(
        node: NodeId,
        memory: Arc<NodeMemory>,
        reduction_slots: usize,
        listener: Arc<dyn DependencyListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            node,
            memory,
            tasks: RwLock::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            scoreboard: CommutativeScoreboard::new(),
            reduction_slots,
            listener,
            me: me.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn memory(&self) -> &Arc<NodeMemory> {
        &self.memory
    }

    pub fn scoreboard(&self) -> &CommutativeScoreboard {
        &self.scoreboard
    }

    pub fn new_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn lookup(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Tasks registered and not yet discarded.
    pub fn live_tasks(&self) -> usize {
        self.tasks.read().len()
    }

    /// Make the task known to the node and to its parent.
    pub fn register_task(&self, task: &Arc<Task>) {
        if let Some(parent) = task.parent() {
            parent.live_children.fetch_add(1, Ordering::SeqCst);
            parent.removal_blockers.fetch_add(1, Ordering::AcqRel);
        }
        self.tasks.write().insert(task.id(), task.clone());
        trace!(task = %task.id(), label = task.label(), "task registered");
    }

    fn create_accesses(
        &self,
        task: &Arc<Task>,
        bottom_owner: Option<TaskId>,
    ) -> Vec<(ArenaIndex, AccessSpec)> {
        let created: Vec<(ArenaIndex, AccessSpec)> = {
            let mut accesses = task.accesses.lock();
            task.declared()
                .iter()
                .map(|spec| {
                    let index = accesses.arena.insert_with(|index| {
                        DataAccess::new(
                            AccessHandle {
                                task: task.id(),
                                index,
                            },
                            spec,
                            bottom_owner,
                        )
                    });
                    accesses.declared.insert(spec.region, index);
                    (index, spec.clone())
                })
                .collect()
        };
        let non_weak = created.iter().filter(|(_, spec)| !spec.weak).count();
        task.pending_predecessors
            .fetch_add(non_weak, Ordering::AcqRel);
        task.removal_blockers
            .fetch_add(created.len(), Ordering::AcqRel);
        created
    }

    fn new_reduction_info(&self, spec: &AccessSpec) -> Arc<ReductionInfo> {
        let operator = spec
            .reduction
            .unwrap_or_else(|| panic!("reduction access on {} without operator", spec.region));
        Arc::new(ReductionInfo::new(spec.region, operator, self.reduction_slots))
    }

    /// Link the declared accesses of a local task behind its siblings.
    ///
    /// The registration guard stays held until [`finish_registration`].
    ///
    /// [`finish_registration`]: DependencySystem::finish_registration
    pub fn register_task_accesses(&self, task: &Arc<Task>) {
        let parent = task.parent().cloned();
        let created = self.create_accesses(task, parent.as_ref().map(|p| p.id()));
        if created.is_empty() {
            return;
        }
        let mut batch = DependencyBatch::new();

        let mut starts = Vec::with_capacity(created.len());
        match &parent {
            Some(parent) => {
                let mut parent_accesses = parent.accesses.lock();
                for (index, spec) in &created {
                    let successor = Successor {
                        handle: AccessHandle {
                            task: task.id(),
                            index: *index,
                        },
                        kind: spec.kind,
                        reduction: spec.reduction,
                    };
                    let previous = parent_accesses
                        .bottom_map
                        .insert(spec.region, BottomEntry::Access(successor));
                    let start = match previous {
                        Some(BottomEntry::Access(predecessor)) => {
                            batch.push(DelayedOperation::Link {
                                target: predecessor.handle,
                                successor,
                            });
                            InitialState::Linked {
                                predecessor: predecessor.handle,
                                inherits_group: spec.kind == AccessType::Reduction
                                    && predecessor.kind == AccessType::Reduction
                                    && predecessor.reduction == spec.reduction,
                            }
                        }
                        Some(BottomEntry::Satisfied { location, write_id }) => {
                            InitialState::Satisfied { location, write_id }
                        }
                        None => match parent_accesses.declared.get(&spec.region).copied() {
                            Some(parent_index) => {
                                let parent_access = parent_accesses
                                    .arena
                                    .get_mut(parent_index)
                                    .unwrap_or_else(|| {
                                        panic!("{} lost its access on {}", parent.id(), spec.region)
                                    });
                                assert!(
                                    parent_access.child.is_none(),
                                    "access {:?} already has a child chain",
                                    parent_access.handle
                                );
                                parent_access.child = Some(successor);
                                parent_access.set_flags(AccessFlags::HAS_CHILD);
                                let msg = parent_access.reevaluate();
                                self.route(parent, parent_access, msg, &mut batch);
                                InitialState::Child
                            }
                            None => InitialState::Satisfied {
                                location: self
                                    .memory
                                    .directory
                                    .home(spec.region)
                                    .or(Some(self.node)),
                                write_id: WriteId::NONE,
                            },
                        },
                    };
                    starts.push((*index, spec, start));
                }
            }
            None => {
                for (index, spec) in &created {
                    let location = self.memory.directory.home(spec.region).or(Some(self.node));
                    starts.push((
                        *index,
                        spec,
                        InitialState::Satisfied {
                            location,
                            write_id: WriteId::NONE,
                        },
                    ));
                }
            }
        }

        {
            let mut accesses = task.accesses.lock();
            for (index, spec, start) in starts {
                let Some(access) = accesses.arena.get_mut(index) else {
                    unreachable!("{} lost a freshly created access", task.id());
                };
                let is_reduction = spec.kind == AccessType::Reduction;
                let msg = match start {
                    InitialState::Linked {
                        predecessor,
                        inherits_group,
                    } => {
                        access.predecessor = Some(predecessor);
                        if is_reduction && !inherits_group {
                            access.bind_reduction_info(self.new_reduction_info(spec));
                            access.apply_single(AccessFlags::HAS_REDUCTION_INFO, false)
                        } else {
                            continue;
                        }
                    }
                    InitialState::Satisfied { location, write_id } => {
                        access.set_location(location, write_id);
                        let mut flags = R | W;
                        if is_reduction {
                            access.bind_reduction_info(self.new_reduction_info(spec));
                            flags |= AccessFlags::HAS_REDUCTION_INFO;
                        }
                        access.apply_single(flags, false)
                    }
                    InitialState::Child => {
                        if is_reduction {
                            access.bind_reduction_info(self.new_reduction_info(spec));
                            access.apply_single(AccessFlags::HAS_REDUCTION_INFO, false)
                        } else {
                            continue;
                        }
                    }
                };
                self.route(task, access, msg, &mut batch);
            }
        }

        self.process(&mut batch);
    }

    /// Create the accesses of a task received from another node. They start
    /// from the satisfiability carried by `TASK_NEW`; `namespace_task`
    /// resolves an offloader-side id into a local remote task.
    pub fn register_remote_task_accesses(
        &self,
        task: &Arc<Task>,
        infos: &[SatisfiabilityInfo],
        namespace_task: impl Fn(u64) -> Option<TaskId>,
    ) {
        let created = self.create_accesses(task, None);
        let mut batch = DependencyBatch::new();
        {
            let mut accesses = task.accesses.lock();
            for (index, spec) in &created {
                let Some(access) = accesses.arena.get_mut(*index) else {
                    unreachable!("{} lost a freshly created access", task.id());
                };
                let Some(info) = infos.iter().find(|info| info.region == spec.region) else {
                    continue;
                };
                if let Some(predecessor) = info.namespace_predecessor.and_then(&namespace_task) {
                    batch.push(DelayedOperation::NamespaceLink {
                        predecessor,
                        region: spec.region,
                        successor: access.as_successor(),
                    });
                }
                let mut op = UpdateOperation::new(access.handle);
                op.make_read = info.read;
                op.make_write = info.write;
                op.location = info.location;
                op.write_id = info.write_id;
                if op.is_empty() {
                    continue;
                }
                let msg = access.apply_propagated(&op);
                self.route(task, access, msg, &mut batch);
            }
        }
        self.process(&mut batch);
    }

    /// Drop the registration guard. The task may become ready right here.
    pub fn finish_registration(&self, task: &Arc<Task>) {
        let mut batch = DependencyBatch::new();
        self.decrement_pending(task, &mut batch);
        self.process(&mut batch);
    }

    /// Give the writable accesses of a task about to run here a new local
    /// version, so that children spawned by the body see it.
    pub fn stamp_local_versions(&self, task: &Arc<Task>) {
        let mut accesses = task.accesses.lock();
        for spec in task.declared() {
            if spec.weak || !matches!(spec.kind, AccessType::Write | AccessType::ReadWrite) {
                continue;
            }
            let Some(index) = accesses.declared.get(&spec.region).copied() else {
                continue;
            };
            if let Some(access) = accesses.arena.get_mut(index) {
                let write_id = self.memory.next_write_id();
                access.set_location(Some(self.node), write_id);
                self.memory.versions.register(spec.region, write_id);
            }
        }
    }

    /// Release every access of a task whose body returned on this node.
    pub fn unregister_task_accesses(&self, task: &Arc<Task>) {
        let mut batch = DependencyBatch::new();
        {
            let mut accesses = task.accesses.lock();
            self.close_bottom_map(task, &mut accesses, false, &mut batch);
            for spec in task.declared() {
                let Some(index) = accesses.declared.get(&spec.region).copied() else {
                    continue;
                };
                let Some(access) = accesses.arena.get_mut(index) else {
                    continue;
                };
                let msg = access.apply_single(AccessFlags::RELEASED, false);
                self.route(task, access, msg, &mut batch);
            }
        }
        if task.has_commutative() {
            batch.released_commutative.push(task.clone());
        }
        self.process(&mut batch);
    }

    /// Put a sink after every bottom-map entry of `task` and empty the map.
    fn close_bottom_map(
        &self,
        task: &Arc<Task>,
        accesses: &mut TaskDataAccesses,
        taskwait: bool,
        batch: &mut DependencyBatch,
    ) {
        let mut entries: Vec<(Region, BottomEntry)> = accesses.bottom_map.drain().collect();
        entries.sort_by_key(|(region, _)| region.start);
        for (region, entry) in entries {
            let role = if taskwait {
                SinkRole::Taskwait
            } else {
                match accesses.declared.get(&region) {
                    Some(parent_access) => SinkRole::ChildrenFinished {
                        parent_access: *parent_access,
                    },
                    None => SinkRole::Region,
                }
            };
            let index = accesses.arena.insert_with(|index| {
                DataAccess::new_sink(
                    AccessHandle {
                        task: task.id(),
                        index,
                    },
                    region,
                    role,
                )
            });
            task.removal_blockers.fetch_add(1, Ordering::AcqRel);
            if taskwait {
                task.taskwait_pending.fetch_add(1, Ordering::SeqCst);
            }
            let Some(sink) = accesses.arena.get_mut(index) else {
                unreachable!("sink vanished");
            };
            match entry {
                BottomEntry::Access(predecessor) => {
                    sink.predecessor = Some(predecessor.handle);
                    batch.push(DelayedOperation::Link {
                        target: predecessor.handle,
                        successor: sink.as_successor(),
                    });
                }
                BottomEntry::Satisfied { location, write_id } => {
                    sink.set_location(location, write_id);
                    let msg = sink.apply_single(R | W, false);
                    self.route(task, sink, msg, batch);
                }
            }
        }
    }

    /// Start a taskwait in the body of `task`. Completion is reported through
    /// [`Task::in_taskwait`] turning false and the listener.
    pub fn taskwait(&self, task: &Arc<Task>) {
        task.begin_taskwait();
        let mut batch = DependencyBatch::new();
        {
            let mut accesses = task.accesses.lock();
            self.close_bottom_map(task, &mut accesses, true, &mut batch);
        }
        self.check_taskwait(task, &mut batch);
        self.process(&mut batch);
    }

    /// Satisfiability for a remote task's access, from `SATISFIABILITY`.
    /// Bits that are already set are ignored.
    pub fn propagate_satisfiability(&self, task: &Arc<Task>, info: &SatisfiabilityInfo) {
        let mut batch = DependencyBatch::new();
        {
            let mut accesses = task.accesses.lock();
            let Some(index) = accesses.declared.get(&info.region).copied() else {
                warn!(task = %task.id(), region = %info.region, "satisfiability for an undeclared region");
                return;
            };
            let Some(access) = accesses.arena.get_mut(index) else {
                return;
            };
            let mut op = UpdateOperation::new(access.handle);
            op.make_read = info.read;
            op.make_write = info.write;
            op.location = info.location;
            op.write_id = info.write_id;
            let msg = access.apply_propagated(&op);
            self.route(task, access, msg, &mut batch);
        }
        self.process(&mut batch);
    }

    /// The remote copy of an offloaded task released one access.
    pub fn release_remote_access(
        &self,
        task: &Arc<Task>,
        region: Region,
        location: Option<NodeId>,
        write_id: WriteId,
    ) {
        let mut batch = DependencyBatch::new();
        {
            let mut accesses = task.accesses.lock();
            let Some(index) = accesses.declared.get(&region).copied() else {
                warn!(task = %task.id(), %region, "release for an undeclared region");
                return;
            };
            let Some(access) = accesses.arena.get_mut(index) else {
                return;
            };
            if access.flags().contains(AccessFlags::RELEASED) {
                warn!(task = %task.id(), %region, "duplicate release ignored");
                return;
            }
            if location.is_some() {
                access.set_location(location, write_id);
                access.set_flags(AccessFlags::LOCATION_PINNED);
            }
            let msg = access.apply_single(AccessFlags::RELEASED, false);
            self.route(task, access, msg, &mut batch);
        }
        self.process(&mut batch);
    }

    /// Record where the data of one access now lives (after a copy).
    pub fn update_access_location(
        &self,
        task: &Arc<Task>,
        region: Region,
        location: NodeId,
        write_id: WriteId,
    ) {
        let mut accesses = task.accesses.lock();
        if let Some(index) = accesses.declared.get(&region).copied() {
            if let Some(access) = accesses.arena.get_mut(index) {
                access.set_location(Some(location), write_id);
            }
        }
    }

    /// Route later satisfiability of an access into `sink`, and return what
    /// the access already has.
    pub fn attach_data_link(
        &self,
        task: &Arc<Task>,
        region: Region,
        sink: Arc<dyn DataLinkSink>,
    ) -> Option<AccessView> {
        let mut accesses = task.accesses.lock();
        let index = accesses.declared.get(&region).copied()?;
        let access = accesses.arena.get_mut(index)?;
        access.data_link = Some(sink);
        Some(access.view())
    }

    /// Snapshot of the declared accesses, in declaration order.
    pub fn access_views(&self, task: &Arc<Task>) -> Vec<AccessView> {
        let accesses = task.accesses.lock();
        task.declared()
            .iter()
            .filter_map(|spec| accesses.by_region(spec.region).map(DataAccess::view))
            .collect()
    }

    pub fn reduction_info(&self, task: &Arc<Task>, region: Region) -> Option<Arc<ReductionInfo>> {
        let accesses = task.accesses.lock();
        accesses
            .by_region(region)
            .and_then(|access| access.reduction_info().cloned())
    }

    /// The body (or the remote copy of the task) is over.
    pub fn finish_task(&self, task: &Arc<Task>) {
        assert!(task.mark_finished(), "{} finished twice", task.id());
        let mut batch = DependencyBatch::new();
        self.decrement_removal(task, &mut batch);
        self.process(&mut batch);
    }

    /// `TASK_FINISHED` arrived for a task offloaded from here.
    ///
    /// The remote node does not report accesses whose successor it linked
    /// through its namespace. Those are released now, with the data left on
    /// the remote node at an unknown version.
    pub fn finish_offloaded_task(&self, task: &Arc<Task>) {
        debug!(task = %task.id(), "offloaded task finished remotely");
        let remote_node = task.cluster_context().map(|context| context.remote_node);
        let mut batch = DependencyBatch::new();
        {
            let mut accesses = task.accesses.lock();
            for spec in task.declared() {
                let Some(index) = accesses.declared.get(&spec.region).copied() else {
                    continue;
                };
                let Some(access) = accesses.arena.get_mut(index) else {
                    continue;
                };
                if access.flags().contains(AccessFlags::RELEASED) {
                    continue;
                }
                trace!(task = %task.id(), region = %spec.region, "releasing access settled remotely");
                access.set_location(remote_node, WriteId::NONE);
                access.set_flags(AccessFlags::LOCATION_PINNED);
                let msg = access.apply_single(AccessFlags::RELEASED, false);
                self.route(task, access, msg, &mut batch);
            }
        }
        self.process(&mut batch);
        self.finish_task(task);
    }

    fn decrement_pending(&self, task: &Arc<Task>, batch: &mut DependencyBatch) {
        let previous = task.pending_predecessors.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{} pending counter underflow", task.id());
        if previous == 1 {
            if task.has_commutative() {
                batch.satisfied_commutative_originators.push(task.clone());
            } else {
                batch.satisfied_originators.push(task.clone());
            }
        }
    }

    fn decrement_removal(&self, task: &Arc<Task>, batch: &mut DependencyBatch) {
        let previous = task.removal_blockers.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{} removal counter underflow", task.id());
        if previous == 1 {
            batch.removable_tasks.push(task.clone());
        }
    }

    fn check_taskwait(&self, task: &Arc<Task>, batch: &mut DependencyBatch) {
        if task.try_complete_taskwait() {
            batch.completed_taskwaits.push(task.clone());
        }
    }

    /// Turn the effects of one transition into task-level bookkeeping.
    fn route(
        &self,
        task: &Arc<Task>,
        access: &mut DataAccess,
        mut msg: DataAccessMessage,
        batch: &mut DependencyBatch,
    ) {
        if matches!(access.kind, AccessType::Concurrent | AccessType::Commutative)
            && !access.is_weak()
        {
            let hands_over = msg.to_next.as_ref().is_some_and(|op| op.make_read);
            if hands_over || msg.detach {
                let write_id = self.memory.next_write_id();
                access.set_location(Some(self.node), write_id);
                self.memory.versions.register(access.region, write_id);
                if let Some(op) = msg.to_next.as_mut() {
                    op.location = Some(self.node);
                    op.write_id = write_id;
                }
            }
        }

        access.apply(&mut msg, batch);

        if msg.schedule {
            match access.sink_role() {
                Some(SinkRole::Taskwait) => batch.taskwait_sinks.push(SatisfiedSink {
                    task: task.clone(),
                    region: access.region,
                    location: access.location,
                    write_id: access.write_id,
                }),
                Some(SinkRole::ChildrenFinished { parent_access }) => {
                    batch.push(DelayedOperation::ChildrenFinished {
                        target: AccessHandle {
                            task: task.id(),
                            index: parent_access,
                        },
                        location: access.location,
                        write_id: access.write_id,
                    })
                }
                Some(SinkRole::Region) => {}
                None => self.decrement_pending(task, batch),
            }
        }

        if msg.complete {
            if task.is_remote()
                && access.sink_role().is_none()
                && !access.set_flags(AccessFlags::RELEASE_NOTIFIED)
                    .contains(AccessFlags::RELEASE_NOTIFIED)
            {
                match task.release_sink.lock().clone() {
                    Some(sink) => batch.pending_releases.push(PendingRelease {
                        sink,
                        access: access.view(),
                    }),
                    None => warn!(task = %task.id(), region = %access.region, "remote access completed without a release step"),
                }
            }
            self.decrement_removal(task, batch);
        }
    }

    fn apply_delayed(&self, op: DelayedOperation, batch: &mut DependencyBatch) {
        let owner = op.owner();
        let Some(task) = self.lookup(owner) else {
            match op {
                DelayedOperation::Update(_) | DelayedOperation::NamespaceLink { .. } => {
                    debug!(task = %owner, "operation for a discarded task dropped");
                    return;
                }
                other => panic!("{other:?} targets discarded task {owner}"),
            }
        };
        let mut accesses = task.accesses.lock();
        match op {
            DelayedOperation::Update(op) => {
                let Some(access) = accesses.arena.get_mut(op.target.index) else {
                    debug!(target = ?op.target, "update for a discarded access dropped");
                    return;
                };
                let msg = access.apply_propagated(&op);
                self.route(&task, access, msg, batch);
            }
            DelayedOperation::Link { target, successor } => {
                let Some(access) = accesses.arena.get_mut(target.index) else {
                    panic!("link target {target:?} vanished");
                };
                assert!(access.next.is_none(), "access {target:?} linked twice");
                access.next = Some(successor);
                access.set_flags(AccessFlags::HAS_NEXT);
                let msg = access.reevaluate();
                self.route(&task, access, msg, batch);
            }
            DelayedOperation::NamespaceLink {
                predecessor,
                region,
                successor,
            } => {
                let Some(index) = accesses.declared.get(&region).copied() else {
                    return;
                };
                let Some(access) = accesses.arena.get_mut(index) else {
                    return;
                };
                if access.next.is_some() {
                    debug!(task = %predecessor, %region, "namespace successor already linked");
                    return;
                }
                trace!(task = %predecessor, %region, successor = ?successor.handle, "namespace link");
                access.next = Some(successor);
                access.set_flags(AccessFlags::HAS_NEXT | AccessFlags::NAMESPACE_NEXT);
                let msg = access.reevaluate();
                self.route(&task, access, msg, batch);
            }
            DelayedOperation::Detach {
                access: handle,
                region,
                location,
                write_id,
                ..
            } => {
                let still_bottom = matches!(
                    accesses.bottom_map.get(&region),
                    Some(BottomEntry::Access(successor)) if successor.handle == handle
                );
                if still_bottom {
                    accesses
                        .bottom_map
                        .insert(region, BottomEntry::Satisfied { location, write_id });
                    batch.push(DelayedOperation::Detached { target: handle });
                } else {
                    trace!(access = ?handle, "detach lost against a new successor");
                }
            }
            DelayedOperation::Detached { target } => {
                let Some(access) = accesses.arena.get_mut(target.index) else {
                    panic!("detached access {target:?} vanished");
                };
                let msg = access.apply_single(AccessFlags::DETACHED, false);
                self.route(&task, access, msg, batch);
            }
            DelayedOperation::ChildrenFinished {
                target,
                location,
                write_id,
            } => {
                let Some(access) = accesses.arena.get_mut(target.index) else {
                    panic!("parent access {target:?} vanished");
                };
                if location.is_some() {
                    access.set_location(location, write_id);
                }
                let msg = access.apply_single(AccessFlags::CHILDREN_FINISHED, false);
                self.route(&task, access, msg, batch);
            }
        }
    }

    fn combine(&self, combination: PendingCombination, batch: &mut DependencyBatch) {
        let region = combination.info.region();
        match combination.location {
            Some(from) if from != self.node && !self.memory.versions.is_local(region, combination.write_id) => {
                let Some(system) = self.me.upgrade() else {
                    return;
                };
                let write_id = combination.write_id;
                self.listener.fetch_region(
                    region,
                    from,
                    write_id,
                    Box::new(move || {
                        let mut batch = DependencyBatch::new();
                        system.combine_locally(combination, &mut batch);
                        system.process(&mut batch);
                    }),
                );
            }
            _ => self.combine_locally(combination, batch),
        }
    }

    fn combine_locally(&self, combination: PendingCombination, batch: &mut DependencyBatch) {
        let info = combination.info;
        let region = info.region();
        if let Err(err) = self
            .memory
            .update(region, |original| info.combine_into(original))
        {
            fatal("reduction combination", err);
        }
        let write_id = self.memory.next_write_id();
        self.memory.versions.register(region, write_id);
        debug!(%region, participants = info.participants(), "reduction combined");
        if let Some(mut op) = combination.deferred {
            op.location = Some(self.node);
            op.write_id = write_id;
            batch.push(DelayedOperation::Update(op));
        }
    }

    fn taskwait_sink_satisfied(&self, sink: SatisfiedSink, batch: &mut DependencyBatch) {
        let remote_copy = match sink.location {
            Some(from) if from != self.node => Some(from),
            _ => None,
        };
        let needs_fetch = remote_copy.is_some()
            && self.memory.directory.lookup(sink.region).is_some()
            && !self.memory.directory.is_distributed(sink.region)
            && !self.memory.versions.is_local(sink.region, sink.write_id);
        match remote_copy {
            Some(from) if needs_fetch => {
                let Some(system) = self.me.upgrade() else {
                    return;
                };
                let node = self.node;
                self.listener.fetch_region(
                    sink.region,
                    from,
                    sink.write_id,
                    Box::new(move || {
                        let mut batch = DependencyBatch::new();
                        system.finish_taskwait_sink(
                            &sink.task,
                            sink.region,
                            Some(node),
                            sink.write_id,
                            &mut batch,
                        );
                        system.process(&mut batch);
                    }),
                );
            }
            _ => self.finish_taskwait_sink(
                &sink.task,
                sink.region,
                sink.location,
                sink.write_id,
                batch,
            ),
        }
    }

    fn finish_taskwait_sink(
        &self,
        task: &Arc<Task>,
        region: Region,
        location: Option<NodeId>,
        write_id: WriteId,
        batch: &mut DependencyBatch,
    ) {
        task.accesses
            .lock()
            .bottom_map
            .insert(region, BottomEntry::Satisfied { location, write_id });
        let previous = task.taskwait_pending.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "{} taskwait counter underflow", task.id());
        self.check_taskwait(task, batch);
    }

    fn dispose(&self, task: Arc<Task>, batch: &mut DependencyBatch) {
        assert!(task.mark_disposed(), "{} discarded twice", task.id());
        self.tasks.write().remove(&task.id());
        trace!(task = %task.id(), label = task.label(), "task discarded");
        {
            let mut accesses = task.accesses.lock();
            accesses.arena = Arena::new();
            accesses.declared.clear();
        }
        task.workflow.lock().take();
        task.release_sink.lock().take();
        if let Some(parent) = task.parent() {
            parent.live_children.fetch_sub(1, Ordering::SeqCst);
            self.check_taskwait(parent, batch);
            self.decrement_removal(parent, batch);
        }
        if let Some(on_finish) = task.take_on_finish() {
            on_finish();
        }
        self.listener.task_removable(task);
    }

    /// Drain `batch` until it is empty.
    pub fn process(&self, batch: &mut DependencyBatch) {
        batch.begin();
        while !batch.is_empty() {
            while let Some(op) = batch.delayed.pop_front() {
                self.apply_delayed(op, batch);
            }

            for task in std::mem::take(&mut batch.satisfied_commutative_originators) {
                if self.scoreboard.acquire(task.id(), &task.commutative_regions()) {
                    batch.satisfied_originators.push(task);
                } else {
                    trace!(task = %task.id(), "waiting for commutative regions");
                }
            }
            for task in std::mem::take(&mut batch.released_commutative) {
                for granted in self.scoreboard.release(task.id(), &task.commutative_regions()) {
                    match self.lookup(granted) {
                        Some(waiter) => batch.satisfied_originators.push(waiter),
                        None => panic!("commutative waiter {granted} vanished"),
                    }
                }
            }
            for combination in std::mem::take(&mut batch.combinations) {
                self.combine(combination, batch);
            }
            for sink in std::mem::take(&mut batch.taskwait_sinks) {
                self.taskwait_sink_satisfied(sink, batch);
            }
            if !batch.delayed.is_empty() {
                continue;
            }

            for link in std::mem::take(&mut batch.pending_links) {
                link.sink.link_region(
                    link.region,
                    link.location,
                    link.write_id,
                    link.read,
                    link.write,
                );
            }
            for release in std::mem::take(&mut batch.pending_releases) {
                release.sink.release_region(&release.access);
            }
            for task in std::mem::take(&mut batch.removable_tasks) {
                self.dispose(task, batch);
            }
            for task in std::mem::take(&mut batch.satisfied_originators) {
                trace!(task = %task.id(), "task ready");
                self.listener.task_ready(task);
            }
            for task in std::mem::take(&mut batch.completed_taskwaits) {
                self.listener.taskwait_completed(&task);
            }
        }
        batch.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskBody, TaskInfo, TaskKind};
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        ready: Mutex<Vec<TaskId>>,
        removed: Mutex<Vec<TaskId>>,
    }

    impl DependencyListener for Recorder {
        fn task_ready(&self, task: Arc<Task>) {
            self.ready.lock().push(task.id());
        }

        fn task_removable(&self, task: Arc<Task>) {
            self.removed.lock().push(task.id());
        }
    }

    fn system() -> (Arc<DependencySystem>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let memory = Arc::new(NodeMemory::new(0, 1));
        (DependencySystem::new(0, memory, 4, recorder.clone()), recorder)
    }

    fn task(
        system: &DependencySystem,
        parent: Option<&Arc<Task>>,
        kind: TaskKind,
        accesses: Vec<AccessSpec>,
    ) -> Arc<Task> {
        let task = Arc::new(Task::new(
            system.new_task_id(),
            TaskInfo {
                label: "t".into(),
                implementation: "t".into(),
            },
            Bytes::new(),
            accesses,
            parent.cloned(),
            TaskBody::None,
            kind,
            None,
            None,
        ));
        system.register_task(&task);
        system.register_task_accesses(&task);
        system.finish_registration(&task);
        task
    }

    fn run(system: &DependencySystem, task: &Arc<Task>) {
        system.unregister_task_accesses(task);
        system.finish_task(task);
    }

    const REGION: Region = Region { start: 0, len: 8 };

    #[test]
    fn writer_then_reader_then_writer_run_in_order() {
        let (system, recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let w1 = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Write, REGION)]);
        let r = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Read, REGION)]);
        let w2 = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Write, REGION)]);

        assert_eq!(*recorder.ready.lock(), vec![root.id(), w1.id()]);
        run(&system, &w1);
        assert_eq!(*recorder.ready.lock(), vec![root.id(), w1.id(), r.id()]);
        run(&system, &r);
        assert_eq!(recorder.ready.lock().last(), Some(&w2.id()));
        run(&system, &w2);
        assert!(recorder.removed.lock().contains(&w2.id()));
        assert_eq!(root.live_children.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn readers_share_satisfiability() {
        let (system, recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let w = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Write, REGION)]);
        let r1 = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Read, REGION)]);
        let r2 = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Read, REGION)]);
        run(&system, &w);
        let ready = recorder.ready.lock().clone();
        assert!(ready.contains(&r1.id()) && ready.contains(&r2.id()));
    }

    #[test]
    fn commutative_tasks_take_turns() {
        let (system, recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let a = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Commutative, REGION)]);
        let b = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Commutative, REGION)]);
        assert!(recorder.ready.lock().contains(&a.id()));
        assert!(!recorder.ready.lock().contains(&b.id()));
        assert_eq!(system.scoreboard().holder_of(REGION), Some(a.id()));
        run(&system, &a);
        assert!(recorder.ready.lock().contains(&b.id()));
    }

    #[test]
    fn taskwait_completes_when_children_are_gone() {
        let (system, _recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let child = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Write, REGION)]);
        system.taskwait(&root);
        assert!(root.in_taskwait());
        run(&system, &child);
        assert!(!root.in_taskwait());
        assert!(matches!(
            root.accesses.lock().bottom_entry(REGION),
            Some(BottomEntry::Satisfied { .. })
        ));
    }

    #[test]
    fn nested_child_finishes_the_parent_access() {
        let (system, recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let parent = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::ReadWrite, REGION)]);
        let next = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Read, REGION)]);
        let child = task(&system, Some(&parent), TaskKind::User, vec![AccessSpec::new(AccessType::Write, REGION)]);
        assert!(recorder.ready.lock().contains(&child.id()));

        run(&system, &parent);
        assert!(!recorder.ready.lock().contains(&next.id()));
        run(&system, &child);
        assert!(recorder.ready.lock().contains(&next.id()));
        assert!(recorder.removed.lock().contains(&parent.id()));
    }

    #[test]
    fn updates_for_discarded_tasks_are_dropped() {
        let (system, _recorder) = system();
        let mut batch = DependencyBatch::new();
        let mut op = UpdateOperation::new(AccessHandle {
            task: TaskId(999),
            index: ArenaIndex::new(0, 0),
        });
        op.make_read = true;
        batch.push(DelayedOperation::Update(op));
        system.process(&mut batch);
        assert!(batch.is_empty());
    }

    fn offloaded(system: &DependencySystem, root: &Arc<Task>, kind: AccessType) -> Arc<Task> {
        let task = task(system, Some(root), TaskKind::User, vec![AccessSpec::new(kind, REGION)]);
        *task.cluster_context.lock() = Some(crate::cluster::offloading::ClusterTaskContext {
            remote_node: 1,
            offloaded_id: task.id().0,
        });
        task
    }

    #[test]
    fn unreported_accesses_are_released_when_the_offloaded_task_finishes() {
        let (system, recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let a = offloaded(&system, &root, AccessType::Write);
        let b = task(&system, Some(&root), TaskKind::User, vec![AccessSpec::new(AccessType::Read, REGION)]);
        assert!(!recorder.ready.lock().contains(&b.id()));

        system.finish_offloaded_task(&a);
        assert!(recorder.ready.lock().contains(&b.id()));
        assert!(recorder.removed.lock().contains(&a.id()));
        let views = system.access_views(&b);
        assert_eq!(views[0].location, Some(1));
        assert!(views[0].write_id.is_none());
    }

    #[test]
    fn remotely_released_location_survives_a_late_predecessor() {
        let (system, _recorder) = system();
        let root = task(&system, None, TaskKind::Root, vec![]);
        let a = offloaded(&system, &root, AccessType::Write);
        let b = offloaded(&system, &root, AccessType::Read);

        // b got x through the remote namespace and reported before a did.
        system.release_remote_access(&b, REGION, Some(1), WriteId(77));
        system.finish_offloaded_task(&a);
        let views = system.access_views(&b);
        assert_eq!(views[0].location, Some(1));
        assert_eq!(views[0].write_id, WriteId(77));
        assert!(views[0].read_satisfied());
    }
}
