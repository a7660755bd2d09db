// src/engine/core.rs

//! One cluster node.
//!
//! A `NodeRuntime` is an explicit context object owning everything a node
//! needs: its memory image, dependency system, scheduler, namespace, polling
//! services and workers. Components reach each other through it instead of
//! through process-wide state.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::cluster::messages::TaskNewPayload;
use crate::cluster::messenger::{Messenger, Outbox};
use crate::cluster::namespace::NodeNamespace;
use crate::cluster::offloading::{self, SatisfiabilityInfo};
use crate::cluster::polling::{PollingServices, TransferRequest};
use crate::config::RuntimeConfig;
use crate::dependencies::access::AccessView;
use crate::dependencies::{DependencyListener, DependencySystem};
use crate::errors::{Result, TaskweaveError};
use crate::memory::NodeMemory;
use crate::region::Region;
use crate::scheduler::{ReadyHint, Scheduler};
use crate::tasks::{
    FinishCallback, ImplementationTable, Task, TaskBody, TaskContext, TaskFn, TaskInfo, TaskKind,
    TaskSpec,
};
use crate::types::{NodeId, TaskId, WriteId};
use crate::util::ArenaIndex;
use crate::workflow::{
    ExecutionTarget, Workflow, WorkflowBackend, execute_task, fetch_region_workflow,
};

use super::event_handlers;

thread_local! {
    /// Set while a worker builds the workflow of a task it dequeued, so the
    /// execution step knows it may run the body inline.
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

struct DispatchGuard {
    previous: bool,
}

impl DispatchGuard {
    fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        DISPATCHING.with(|flag| flag.set(previous));
    }
}

/// Dependency-system callbacks, routed back to the owning node.
struct NodeListener {
    runtime: Weak<NodeRuntime>,
}

impl DependencyListener for NodeListener {
    fn task_ready(&self, task: Arc<Task>) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.add_ready_task(task);
        }
    }

    fn task_removable(&self, task: Arc<Task>) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.task_removable(&task);
        }
    }

    fn taskwait_completed(&self, task: &Arc<Task>) {
        trace!(task = %task.id(), "taskwait completed");
    }

    fn fetch_region(
        &self,
        region: Region,
        from: NodeId,
        write_id: WriteId,
        then: Box<dyn FnOnce() + Send>,
    ) {
        match self.runtime.upgrade() {
            Some(runtime) => {
                fetch_region_workflow(runtime, region, from, write_id, then);
            }
            None => then(),
        }
    }
}

pub struct NodeRuntime {
    node: NodeId,
    config: Arc<RuntimeConfig>,
    memory: Arc<NodeMemory>,
    deps: Arc<DependencySystem>,
    scheduler: Scheduler,
    namespace: NodeNamespace,
    polling: PollingServices,
    outbox: Outbox,
    implementations: Arc<ImplementationTable>,
    root: Arc<Task>,
    shutdown_requested: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<NodeRuntime>,
}

impl NodeRuntime {
    /// Build every component of node `node` in dependency order and start
    /// its workers.
    pub fn initialize(
        node: NodeId,
        config: Arc<RuntimeConfig>,
        memory: Arc<NodeMemory>,
        messenger: Arc<dyn Messenger>,
        implementations: Arc<ImplementationTable>,
    ) -> Result<Arc<Self>> {
        info!(node, nodes = config.nodes(), "initializing node");
        debug!(node, "memory image ready");

        let runtime = Arc::new_cyclic(|me: &Weak<NodeRuntime>| {
            let listener = Arc::new(NodeListener { runtime: me.clone() });
            let deps = DependencySystem::new(
                node,
                memory.clone(),
                config.runtime.reduction_slots,
                listener,
            );
            debug!(node, "dependency system ready");
            let scheduler = Scheduler::new(node, config.nodes(), config.policy());
            debug!(node, policy = %config.policy(), "scheduler ready");
            let namespace = NodeNamespace::new(!config.cluster.disable_remote);
            debug!(node, enabled = namespace.is_enabled(), "namespace ready");
            let polling = PollingServices::new();
            let outbox = Outbox::new(messenger, polling.messages.clone(), config.cluster.eager_send);
            let root = Arc::new(Task::new(
                deps.new_task_id(),
                TaskInfo {
                    label: format!("main@{node}"),
                    implementation: "main".into(),
                },
                Bytes::new(),
                Vec::new(),
                None,
                TaskBody::None,
                TaskKind::Root,
                None,
                None,
            ));
            Self {
                node,
                config,
                memory,
                deps,
                scheduler,
                namespace,
                polling,
                outbox,
                implementations,
                root,
                shutdown_requested: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                me: me.clone(),
            }
        });

        runtime.deps.register_task(&runtime.root);
        runtime.deps.finish_registration(&runtime.root);
        runtime.start_workers()?;
        info!(node, "node initialized");
        Ok(runtime)
    }

    fn start_workers(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock();
        for index in 0..self.config.runtime.workers_per_node {
            let runtime = self.clone();
            let handle = thread::Builder::new()
                .name(format!("taskweave-{}-worker-{index}", self.node))
                .spawn(move || runtime.worker_loop(index))?;
            workers.push(handle);
        }
        debug!(node = self.node, workers = workers.len(), "workers started");
        Ok(())
    }

    fn arc(&self) -> Arc<NodeRuntime> {
        match self.me.upgrade() {
            Some(me) => me,
            None => unreachable!("node runtime used after it was dropped"),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn cluster_size(&self) -> usize {
        self.config.nodes()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<NodeMemory> {
        &self.memory
    }

    pub fn dependencies(&self) -> &Arc<DependencySystem> {
        &self.deps
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn namespace(&self) -> &NodeNamespace {
        &self.namespace
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        self.outbox.messenger()
    }

    pub fn implementations(&self) -> &ImplementationTable {
        &self.implementations
    }

    /// The task standing for this node's main program.
    pub fn root(&self) -> &Arc<Task> {
        &self.root
    }

    fn idle_wait(&self) -> Duration {
        Duration::from_micros(self.config.runtime.idle_wait_us)
    }

    /// Drive every polling service once. Returns how much progress was made.
    pub fn poll(self: &Arc<Self>) -> usize {
        self.polling.poll_all(
            self.outbox.messenger().as_ref(),
            &self.memory.versions,
            |message| event_handlers::handle_message(self, message),
        )
    }

    /// Do one unit of useful work on the calling thread: poll, then run a
    /// ready task if there is one. Returns false when there was nothing to do.
    pub fn help(self: &Arc<Self>) -> bool {
        let progress = self.poll();
        match self.scheduler.get_ready_task() {
            Some(task) => {
                self.dispatch(task);
                true
            }
            None => progress > 0,
        }
    }

    fn worker_loop(self: Arc<Self>, index: usize) {
        info!(node = self.node, worker = index, "worker started");
        let idle = self.idle_wait();
        while !self.scheduler.is_shutting_down() {
            if !self.help() {
                self.scheduler.wait_for_work(idle);
            }
        }
        info!(node = self.node, worker = index, "worker stopped");
    }

    /// Run a task taken from the ready queue on the calling thread.
    fn dispatch(self: &Arc<Self>, task: Arc<Task>) {
        if let Some(slot) = task.execution_slot() {
            trace!(task = %task.id(), "running deferred task");
            self.run_host(&slot.workflow, slot.step);
            return;
        }
        let _guard = DispatchGuard::enter();
        execute_task(&task, ExecutionTarget::Local, self.clone());
    }

    fn run_host(self: &Arc<Self>, workflow: &Arc<Workflow>, step: ArenaIndex) {
        let Some(task) = workflow.task().cloned() else {
            panic!("host execution step without a task");
        };
        self.deps.stamp_local_versions(&task);
        debug!(node = self.node, task = %task.id(), label = task.label(), "task started");

        let result = match &task.body {
            TaskBody::Registered(body) => {
                let mut context = TaskContext::new(self, &task);
                body(&mut context)
            }
            TaskBody::Spawned(body) => {
                let body = body.lock().take();
                if let Some(body) = body {
                    body();
                }
                Ok(())
            }
            TaskBody::None => Ok(()),
        };
        if let Err(err) = result {
            error!(task = %task.id(), label = task.label(), error = %format!("{err:#}"), "task body failed");
        }

        self.deps.unregister_task_accesses(&task);
        workflow.complete_step(step);
        self.deps.finish_task(&task);
        debug!(node = self.node, task = %task.id(), "task body done");
    }

    fn add_ready_task(self: &Arc<Self>, task: Arc<Task>) {
        if task.kind() == TaskKind::Root {
            return;
        }
        match self.offload_target(&task) {
            Some(target) => {
                execute_task(&task, ExecutionTarget::Cluster(target), self.clone());
            }
            None => self.scheduler.add_ready_task(task, ReadyHint::Fresh),
        }
    }

    /// Node a ready task should be sent to, if it should leave this one.
    fn offload_target(&self, task: &Arc<Task>) -> Option<NodeId> {
        let nodes = self.cluster_size();
        if nodes == 1 || task.kind() != TaskKind::User {
            return None;
        }
        if task.declared().iter().any(|access| access.kind.is_group()) {
            return None;
        }
        if task.execution_slot().is_some() {
            return None;
        }
        if task
            .declared()
            .iter()
            .any(|access| self.memory.directory.lookup(access.region).is_none())
        {
            return None;
        }
        let target = match task.node_hint() {
            Some(node) if node < nodes => node,
            _ => self
                .scheduler
                .select_node(&self.deps.access_views(task), &self.memory.directory),
        };
        (target != self.node).then_some(target)
    }

    fn task_removable(&self, task: &Arc<Task>) {
        if let TaskKind::Remote {
            offloader,
            offloaded_id,
        } = task.kind()
        {
            self.namespace.finish((offloader, offloaded_id));
            offloading::send_task_finished(&self.outbox, offloader, offloaded_id);
        }
        trace!(node = self.node, task = %task.id(), "task removed");
    }

    /// Create and register a child of `parent` from `spec`.
    pub(crate) fn submit(&self, parent: &Arc<Task>, spec: TaskSpec) -> Result<TaskId> {
        let body = self
            .implementations
            .get(&spec.implementation)
            .ok_or_else(|| TaskweaveError::UnknownTask(spec.implementation.clone()))?;
        let mut seen = HashSet::new();
        for access in &spec.accesses {
            if !seen.insert(access.region) {
                return Err(TaskweaveError::Other(anyhow::anyhow!(
                    "task `{}` declares {} more than once",
                    spec.label,
                    access.region
                )));
            }
            if let Some(operator) = access.reduction {
                if operator.operator().is_none() {
                    return Err(TaskweaveError::Other(anyhow::anyhow!(
                        "task `{}` uses unknown reduction operator {operator:?}",
                        spec.label
                    )));
                }
            }
        }

        let task = Arc::new(Task::new(
            self.deps.new_task_id(),
            TaskInfo {
                label: spec.label,
                implementation: spec.implementation,
            },
            spec.args,
            spec.accesses,
            Some(parent.clone()),
            TaskBody::Registered(body),
            TaskKind::User,
            spec.on_node,
            spec.on_finish,
        ));
        let id = task.id();
        trace!(node = self.node, task = %id, parent = %parent.id(), label = task.label(), "task spawned");
        self.deps.register_task(&task);
        self.deps.register_task_accesses(&task);
        self.deps.finish_registration(&task);
        Ok(id)
    }

    /// Run `body` as a task without accesses. `completion` fires once the
    /// task is gone.
    pub fn spawn_function(
        &self,
        body: impl FnOnce() + Send + 'static,
        completion: Option<FinishCallback>,
        label: impl Into<String>,
    ) -> TaskId {
        let task = Arc::new(Task::new(
            self.deps.new_task_id(),
            TaskInfo {
                label: label.into(),
                implementation: "spawned-function".into(),
            },
            Bytes::new(),
            Vec::new(),
            None,
            TaskBody::Spawned(Mutex::new(Some(Box::new(body)))),
            TaskKind::Spawned,
            None,
            completion,
        ));
        let id = task.id();
        self.deps.register_task(&task);
        self.deps.finish_registration(&task);
        id
    }

    /// Rebuild a task offloaded here by `offloader` and make it known to the
    /// namespace. Satisfiability buffered for it is applied right away.
    pub(crate) fn create_remote_task(
        &self,
        offloader: NodeId,
        payload: TaskNewPayload,
        body: TaskFn,
    ) -> Arc<Task> {
        let TaskNewPayload {
            offloaded_id,
            label,
            implementation,
            accesses,
            infos,
            args,
        } = payload;
        let task = Arc::new(Task::new(
            self.deps.new_task_id(),
            TaskInfo {
                label,
                implementation,
            },
            args,
            accesses,
            None,
            TaskBody::Registered(body),
            TaskKind::Remote {
                offloader,
                offloaded_id,
            },
            None,
            None,
        ));
        debug!(
            node = self.node,
            task = %task.id(),
            offloader,
            offloaded_id,
            label = task.label(),
            "remote task created"
        );
        self.deps.register_task(&task);
        self.deps
            .register_remote_task_accesses(&task, &infos, |predecessor| {
                self.namespace.resolve(offloader, predecessor)
            });
        for buffered in self.namespace.insert((offloader, offloaded_id), task.id()) {
            self.deps.propagate_satisfiability(&task, &buffered);
        }
        self.deps.finish_registration(&task);
        task
    }

    /// `SYS_FINISH` arrived, or the cluster is going down.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Poll until shutdown is requested. This is the main loop of every
    /// node but the first.
    pub fn serve(self: &Arc<Self>) {
        let idle = self.idle_wait();
        while !self.is_shutdown_requested() {
            if self.poll() == 0 {
                thread::sleep(idle);
            }
        }
        while self.poll() > 0 {}
        debug!(node = self.node, "serve loop drained");
    }

    /// Stop the workers and tear the node down in reverse construction
    /// order.
    pub fn shutdown(&self) -> Result<()> {
        info!(node = self.node, "shutting down node");
        self.request_shutdown();
        self.scheduler.begin_shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_owned();
            worker
                .join()
                .map_err(|_| TaskweaveError::Other(anyhow::anyhow!("{name} panicked")))?;
        }
        debug!(node = self.node, "workers stopped");
        debug!(
            node = self.node,
            pending_messages = self.polling.messages.len(),
            pending_transfers = self.polling.transfers.len(),
            "polling services stopped"
        );
        debug!(node = self.node, live_remote = self.namespace.live_count(), "namespace closed");
        debug!(node = self.node, live_tasks = self.deps.live_tasks(), "dependency system closed");
        info!(node = self.node, "node shut down");
        Ok(())
    }
}

impl WorkflowBackend for NodeRuntime {
    fn node(&self) -> NodeId {
        self.node
    }

    fn dependencies(&self) -> &Arc<DependencySystem> {
        &self.deps
    }

    fn namespace_enabled(&self) -> bool {
        self.namespace.is_enabled()
    }

    fn transfer_region(
        &self,
        region: Region,
        source: NodeId,
        write_id: WriteId,
        done: Box<dyn FnOnce() + Send>,
    ) {
        self.polling.transfers.request(
            self.outbox.messenger().as_ref(),
            &self.memory.versions,
            TransferRequest {
                region,
                source,
                write_id,
                max_fragment: self.config.cluster.message_max_size,
            },
            done,
        );
    }

    fn execute_host(&self, workflow: Arc<Workflow>, step: ArenaIndex) {
        if DISPATCHING.with(|flag| flag.replace(false)) {
            self.arc().run_host(&workflow, step);
            return;
        }
        let Some(task) = workflow.task().cloned() else {
            panic!("host execution step without a task");
        };
        trace!(task = %task.id(), "execution deferred to a worker");
        self.scheduler.add_ready_task(task, ReadyHint::Deferred);
    }

    fn offload_task(&self, task: &Arc<Task>, target: NodeId, infos: Vec<SatisfiabilityInfo>) {
        offloading::offload_task(&self.outbox, task, target, infos);
    }

    fn send_satisfiability(&self, task: &Arc<Task>, info: SatisfiabilityInfo) {
        offloading::send_satisfiability(&self.outbox, task, info);
    }

    fn release_access(&self, task: &Arc<Task>, access: &AccessView) {
        match task.kind() {
            TaskKind::Remote {
                offloader,
                offloaded_id,
            } => offloading::send_release_access(&self.outbox, offloader, offloaded_id, access),
            kind => panic!("release step on a {kind:?} task"),
        }
    }
}
