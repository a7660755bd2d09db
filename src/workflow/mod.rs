// src/workflow/mod.rs

//! Execution workflows.
//!
//! A workflow is a small DAG of steps built for one task once it is ready.
//! It moves the task's data where the task will run, runs it (here or on
//! another node), and reports the task's accesses back when it ran for
//! another node.
//!
//! Steps live in an arena owned by the workflow. A step starts exactly once,
//! when its last predecessor completed, and is removed exactly once, when
//! its own action is over and no more contributions (linked or released
//! bytes) are expected. Every counter is only touched under the step lock,
//! so racing contributions cannot retire a step twice.

mod execute;
mod steps;

pub use execute::{ExecutionTarget, execute_task, fetch_region_workflow};
pub use steps::{StepKind, NotificationCallback};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, trace};

use crate::cluster::offloading::SatisfiabilityInfo;
use crate::dependencies::DependencySystem;
use crate::dependencies::access::{AccessView, DataLinkSink, DataReleaseSink};
use crate::region::Region;
use crate::tasks::Task;
use crate::types::{NodeId, WriteId};
use crate::util::{Arena, ArenaIndex};

use steps::{DataCopyState, Step};

/// What a workflow needs from the node it runs on.
pub trait WorkflowBackend: Send + Sync {
    fn node(&self) -> NodeId;

    fn dependencies(&self) -> &Arc<DependencySystem>;

    /// Whether offloaded tasks may name a namespace predecessor.
    fn namespace_enabled(&self) -> bool;

    /// Bring `region` at `write_id` from `source` into local memory and call
    /// `done` afterwards, possibly from a polling thread.
    fn transfer_region(
        &self,
        region: Region,
        source: NodeId,
        write_id: WriteId,
        done: Box<dyn FnOnce() + Send>,
    );

    /// Run the body of the workflow's task, then complete `step`.
    fn execute_host(&self, workflow: Arc<Workflow>, step: ArenaIndex);

    fn offload_task(&self, task: &Arc<Task>, target: NodeId, infos: Vec<SatisfiabilityInfo>);

    fn send_satisfiability(&self, task: &Arc<Task>, info: SatisfiabilityInfo);

    /// One access of a task run for another node completed here.
    fn release_access(&self, task: &Arc<Task>, access: &AccessView);
}

/// What starting a step amounts to, decided under the step lock and carried
/// out without it.
enum StartAction {
    Complete,
    /// Data links finish under the step lock, since satisfiability may race
    /// with their start.
    Link,
    Copy(DataCopyState),
    Host,
    Offload {
        target: NodeId,
        infos: Vec<SatisfiabilityInfo>,
    },
    Notify(NotificationCallback),
}

pub struct Workflow {
    task: Option<Arc<Task>>,
    backend: Arc<dyn WorkflowBackend>,
    steps: Mutex<Arena<Step>>,
    live_steps: AtomicUsize,
    started: AtomicBool,
    me: Weak<Workflow>,
}

impl Workflow {
    pub fn new(task: Option<Arc<Task>>, backend: Arc<dyn WorkflowBackend>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            task,
            backend,
            steps: Mutex::new(Arena::new()),
            live_steps: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn task(&self) -> Option<&Arc<Task>> {
        self.task.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn WorkflowBackend> {
        &self.backend
    }

    /// Steps not yet retired.
    pub fn live_steps(&self) -> usize {
        self.live_steps.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.live_steps() == 0
    }

    fn arc(&self) -> Arc<Workflow> {
        match self.me.upgrade() {
            Some(me) => me,
            None => unreachable!("workflow used after it was dropped"),
        }
    }

    pub fn add_step(&self, kind: StepKind) -> ArenaIndex {
        assert!(
            !self.started.load(Ordering::Acquire),
            "step added to a running workflow"
        );
        self.live_steps.fetch_add(1, Ordering::AcqRel);
        self.steps.lock().insert(Step::new(kind))
    }

    /// `to` waits for `from`.
    pub fn add_link(&self, from: ArenaIndex, to: ArenaIndex) {
        let mut steps = self.steps.lock();
        match steps.get_mut(to) {
            Some(step) => step.waiting += 1,
            None => panic!("link to unknown step {to:?}"),
        }
        match steps.get_mut(from) {
            Some(step) => step.successors.push(to),
            None => panic!("link from unknown step {from:?}"),
        }
    }

    /// Start every step without predecessors.
    pub fn start(&self) {
        let already = self.started.swap(true, Ordering::AcqRel);
        assert!(!already, "workflow started twice");
        let roots: Vec<ArenaIndex> = {
            let steps = self.steps.lock();
            debug_assert!(is_acyclic(&steps), "workflow steps form a cycle");
            steps
                .iter()
                .filter(|(_, step)| step.waiting == 0)
                .map(|(index, _)| index)
                .collect()
        };
        trace!(
            task = ?self.task.as_ref().map(|t| t.id()),
            steps = self.live_steps(),
            "workflow started"
        );
        if roots.is_empty() {
            self.finished();
        }
        for index in roots {
            self.start_step(index);
        }
    }

    fn start_step(&self, index: ArenaIndex) {
        let action = {
            let mut steps = self.steps.lock();
            let Some(step) = steps.get_mut(index) else {
                panic!("started unknown step {index:?}");
            };
            assert!(!step.started, "step {index:?} ({}) started twice", step.kind.name());
            step.started = true;
            trace!(step = ?index, kind = step.kind.name(), "step started");
            match &mut step.kind {
                StepKind::Null | StepKind::DataRelease(_) => StartAction::Complete,
                StepKind::DataCopy(state) => StartAction::Copy(*state),
                StepKind::HostExecution => StartAction::Host,
                StepKind::ClusterExecution(state) => StartAction::Offload {
                    target: state.target,
                    infos: std::mem::take(&mut state.infos),
                },
                StepKind::Notification(callback) => match callback.take() {
                    Some(callback) => StartAction::Notify(callback),
                    None => StartAction::Complete,
                },
                StepKind::DataLink(_) => StartAction::Link,
            }
        };

        match action {
            StartAction::Link => {
                let (ready, finished) = {
                    let mut steps = self.steps.lock();
                    self.start_data_link(&mut steps, index);
                    let ready = self.release_successors(&mut steps, index);
                    let finished = self.retire_if_done(&mut steps, index);
                    (ready, finished)
                };
                self.after_release(ready, finished);
            }
            StartAction::Complete => self.complete_step(index),
            StartAction::Copy(copy) => self.start_data_copy(index, copy),
            StartAction::Host => self.backend.execute_host(self.arc(), index),
            StartAction::Offload { target, infos } => match &self.task {
                Some(task) => self.backend.offload_task(task, target, infos),
                None => panic!("cluster execution step without a task"),
            },
            StartAction::Notify(callback) => {
                callback();
                self.complete_step(index);
            }
        }
    }

    /// Snapshot the access, route its later satisfiability here, and hand
    /// what is already known to the execution step.
    fn start_data_link(&self, steps: &mut MutexGuard<'_, Arena<Step>>, index: ArenaIndex) {
        let Some(task) = self.task.clone() else {
            panic!("data link step without a task");
        };
        let (region, successors) = match steps.get(index) {
            Some(Step {
                kind: StepKind::DataLink(state),
                successors,
                ..
            }) => (state.region, successors.clone()),
            _ => unreachable!("data link step {index:?} changed kind"),
        };
        let deps = self.backend.dependencies();
        let sink: Arc<dyn DataLinkSink> = Arc::new(StepHandle {
            workflow: self.arc(),
            step: index,
        });
        let Some(view) = deps.attach_data_link(&task, region, sink) else {
            panic!("{} has no access on {region}", task.id());
        };

        let mut info = SatisfiabilityInfo::new(region, None, false, false, WriteId::NONE);
        if let Some(StepKind::DataLink(state)) = steps.get_mut(index).map(|s| &mut s.kind) {
            state.link(view.location, view.write_id, view.read_satisfied(), view.write_satisfied());
            info.read = state.read_linked;
            info.write = state.write_linked;
            info.location = state.location;
            info.write_id = state.write_id;
        }
        let target = successors.iter().find_map(|successor| {
            match steps.get(*successor).map(|s| &s.kind) {
                Some(StepKind::ClusterExecution(state)) => Some(state.target),
                _ => None,
            }
        });
        info.namespace_predecessor = self.namespace_predecessor(&view, target);

        for successor in successors {
            if let Some(StepKind::ClusterExecution(state)) =
                steps.get_mut(successor).map(|s| &mut s.kind)
            {
                state.infos.push(info);
            }
        }
    }

    /// Offloader-side id of the previous task on the region, when it was
    /// offloaded to the same node as this one.
    fn namespace_predecessor(&self, view: &AccessView, target: Option<NodeId>) -> Option<u64> {
        if !self.backend.namespace_enabled() {
            return None;
        }
        let target = target?;
        let predecessor = self.backend.dependencies().lookup(view.predecessor?.task)?;
        let context = predecessor.cluster_context()?;
        (context.remote_node == target).then_some(context.offloaded_id)
    }

    fn start_data_copy(&self, index: ArenaIndex, copy: DataCopyState) {
        let node = self.backend.node();
        let deps = self.backend.dependencies().clone();
        match copy.source {
            Some(source)
                if source != node && !deps.memory().versions.is_local(copy.region, copy.write_id) =>
            {
                let workflow = self.arc();
                self.backend.transfer_region(
                    copy.region,
                    source,
                    copy.write_id,
                    Box::new(move || {
                        if let Some(task) = &workflow.task {
                            deps.update_access_location(task, copy.region, node, copy.write_id);
                        }
                        workflow.complete_step(index);
                    }),
                );
            }
            Some(source) if source != node => {
                trace!(region = %copy.region, "version already local, no transfer");
                if let Some(task) = &self.task {
                    deps.update_access_location(task, copy.region, node, copy.write_id);
                }
                self.complete_step(index);
            }
            _ => self.complete_step(index),
        }
    }

    /// The action of `index` is over: release its successors.
    pub fn complete_step(&self, index: ArenaIndex) {
        let (ready, finished) = {
            let mut steps = self.steps.lock();
            let ready = self.release_successors(&mut steps, index);
            let finished = self.retire_if_done(&mut steps, index);
            (ready, finished)
        };
        self.after_release(ready, finished);
    }

    fn after_release(&self, ready: Vec<ArenaIndex>, finished: bool) {
        for successor in ready {
            self.start_step(successor);
        }
        if finished {
            self.finished();
        }
    }

    fn release_successors(
        &self,
        steps: &mut MutexGuard<'_, Arena<Step>>,
        index: ArenaIndex,
    ) -> Vec<ArenaIndex> {
        let successors = match steps.get_mut(index) {
            Some(step) => {
                assert!(step.started, "step {index:?} completed before starting");
                assert!(!step.completed, "step {index:?} completed twice");
                step.completed = true;
                std::mem::take(&mut step.successors)
            }
            None => panic!("completed unknown step {index:?}"),
        };
        let mut ready = Vec::new();
        for successor in successors {
            let Some(step) = steps.get_mut(successor) else {
                panic!("successor {successor:?} vanished");
            };
            step.waiting -= 1;
            if step.waiting == 0 {
                ready.push(successor);
            }
        }
        ready
    }

    /// Remove the step if nothing can reach it any more. Returns true when
    /// this was the last step of the workflow.
    fn retire_if_done(&self, steps: &mut MutexGuard<'_, Arena<Step>>, index: ArenaIndex) -> bool {
        if !steps.get(index).is_some_and(Step::retirable) {
            return false;
        }
        if let Some(step) = steps.remove(index) {
            trace!(step = ?index, kind = step.kind.name(), "step retired");
        }
        self.live_steps.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn finished(&self) {
        debug!(task = ?self.task.as_ref().map(|t| t.id()), "workflow finished");
        if let Some(task) = &self.task {
            let mut slot = task.workflow.lock();
            if slot
                .as_ref()
                .is_some_and(|slot| std::ptr::eq(Arc::as_ptr(&slot.workflow), self))
            {
                slot.take();
            }
        }
    }

    fn link_region(
        &self,
        index: ArenaIndex,
        region: Region,
        location: Option<NodeId>,
        write_id: WriteId,
        read: bool,
        write: bool,
    ) {
        let (info, finished) = {
            let mut steps = self.steps.lock();
            let Some(step) = steps.get_mut(index) else {
                trace!(step = ?index, %region, "satisfiability after the data link retired");
                return;
            };
            let started = step.started;
            let StepKind::DataLink(state) = &mut step.kind else {
                panic!("link_region on a {} step", step.kind.name());
            };
            let (read, write) = state.link(location, write_id, read, write);
            let info = (started && (read || write))
                .then(|| SatisfiabilityInfo::new(region, location, read, write, write_id));
            let finished = self.retire_if_done(&mut steps, index);
            (info, finished)
        };
        if let (Some(info), Some(task)) = (info, &self.task) {
            self.backend.send_satisfiability(task, info);
        }
        if finished {
            self.finished();
        }
    }

    fn release_region(&self, index: ArenaIndex, access: &AccessView) {
        let finished = {
            let mut steps = self.steps.lock();
            let Some(step) = steps.get_mut(index) else {
                panic!("release of {} after the release step retired", access.region);
            };
            let StepKind::DataRelease(state) = &mut step.kind else {
                panic!("release_region on a {} step", step.kind.name());
            };
            if !state.released.insert(access.region) {
                trace!(region = %access.region, "duplicate release ignored");
                return;
            }
            state.remaining -= access.region.len;
            self.retire_if_done(&mut steps, index)
        };
        if access.namespace_next() {
            trace!(region = %access.region, "successor linked in the namespace, release not reported");
        } else if let Some(task) = &self.task {
            self.backend.release_access(task, access);
        }
        if finished {
            self.finished();
        }
    }
}

/// A step reachable from outside the workflow: the data link of an offloaded
/// access, or the release step of a task run for another node.
pub struct StepHandle {
    workflow: Arc<Workflow>,
    step: ArenaIndex,
}

impl StepHandle {
    pub fn new(workflow: Arc<Workflow>, step: ArenaIndex) -> Self {
        Self { workflow, step }
    }
}

impl DataLinkSink for StepHandle {
    fn link_region(
        &self,
        region: Region,
        location: Option<NodeId>,
        write_id: WriteId,
        read: bool,
        write: bool,
    ) {
        self.workflow
            .link_region(self.step, region, location, write_id, read, write);
    }
}

impl DataReleaseSink for StepHandle {
    fn release_region(&self, access: &AccessView) {
        self.workflow.release_region(self.step, access);
    }
}

fn is_acyclic(steps: &Arena<Step>) -> bool {
    let mut graph: DiGraphMap<u64, ()> = DiGraphMap::new();
    for (index, step) in steps.iter() {
        graph.add_node(index.to_bits());
        for successor in &step.successors {
            graph.add_edge(index.to_bits(), successor.to_bits(), ());
        }
    }
    toposort(&graph, None).is_ok()
}
