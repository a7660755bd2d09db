// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::cluster::messages::MessagePayload;
use crate::cluster::messenger::{LocalFabric, Messenger};
use crate::config::RuntimeConfig;
use crate::errors::{Result, TaskweaveError};
use crate::tasks::{ImplementationTable, TaskContext};
use crate::types::NodeId;

use super::core::NodeRuntime;

/// A whole cluster in one process: one `NodeRuntime` per node, wired
/// together through a [`LocalFabric`].
///
/// Node 0 runs the main program on the thread calling [`run_main`]. Every
/// other node runs a serve loop that polls until node 0 ends the job with
/// the `SYS_FINISH` handshake in [`shutdown`].
///
/// [`run_main`]: LocalCluster::run_main
/// [`shutdown`]: LocalCluster::shutdown
pub struct LocalCluster {
    nodes: Vec<Arc<NodeRuntime>>,
    serve_loops: Vec<JoinHandle<()>>,
}

impl fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl LocalCluster {
    pub fn launch(config: RuntimeConfig, implementations: ImplementationTable) -> Result<Self> {
        Self::launch_with(config, implementations, |_, messenger| messenger)
    }

    /// Like [`launch`](LocalCluster::launch), with every node's messenger
    /// passed through `wrap` first.
    pub fn launch_with(
        config: RuntimeConfig,
        implementations: ImplementationTable,
        wrap: impl Fn(NodeId, Arc<dyn Messenger>) -> Arc<dyn Messenger>,
    ) -> Result<Self> {
        let size = config.nodes();
        info!(nodes = size, policy = %config.policy(), "launching cluster");
        let config = Arc::new(config);
        let implementations = Arc::new(implementations);
        let fabric = LocalFabric::new(size);

        let mut nodes = Vec::with_capacity(size);
        for node in 0..size {
            let memory = fabric.memory(node).ok_or_else(|| {
                TaskweaveError::Transport(format!("fabric has no memory for node {node}"))
            })?;
            let endpoint: Arc<dyn Messenger> = Arc::new(fabric.endpoint(node)?);
            nodes.push(NodeRuntime::initialize(
                node,
                config.clone(),
                memory,
                wrap(node, endpoint),
                implementations.clone(),
            )?);
        }

        let mut serve_loops = Vec::with_capacity(size);
        for node in nodes.iter().skip(1) {
            let runtime = node.clone();
            let handle = thread::Builder::new()
                .name(format!("taskweave-{}-main", node.node()))
                .spawn(move || {
                    runtime.serve();
                    runtime.messenger().synchronize_all();
                })?;
            serve_loops.push(handle);
        }
        info!(nodes = size, "cluster ready");
        Ok(Self { nodes, serve_loops })
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Runtime of node `index`. Panics if there is no such node.
    pub fn node(&self, index: NodeId) -> &Arc<NodeRuntime> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<NodeRuntime>] {
        &self.nodes
    }

    /// Run `main` as the main program of node 0, then wait for every task
    /// it spawned.
    pub fn run_main<T>(
        &self,
        main: impl FnOnce(&mut TaskContext<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let master = self.node(0);
        let root = master.root().clone();
        let mut context = TaskContext::new(master, &root);
        let result = main(&mut context);
        context.taskwait();
        result
    }

    /// Poll every node from an async task until the cluster shuts down.
    pub fn spawn_leader(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let nodes = self.nodes.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if nodes.iter().all(|node| node.is_shutdown_requested()) {
                    break;
                }
                for node in &nodes {
                    node.poll();
                }
            }
            debug!("leader stopped");
        })
    }

    /// End the job: node 0 sends `SYS_FINISH` to every other node and
    /// joins the final barrier, then every node is torn down.
    pub fn shutdown(mut self) -> Result<()> {
        info!(nodes = self.nodes.len(), "cluster shutting down");
        let master = self.node(0).clone();
        master.outbox().broadcast(MessagePayload::SysFinish);
        master.messenger().synchronize_all();
        master.request_shutdown();

        for handle in self.serve_loops.drain(..) {
            let name = handle.thread().name().unwrap_or("serve loop").to_owned();
            handle
                .join()
                .map_err(|_| TaskweaveError::Other(anyhow::anyhow!("{name} panicked")))?;
        }
        for node in self.nodes.iter().rev() {
            node.shutdown()?;
        }
        info!("cluster shut down");
        Ok(())
    }
}
