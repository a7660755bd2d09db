// src/cluster/offloading.rs

//! Task offloading protocol: the offloader side of `TASK_NEW`,
//! `SATISFIABILITY`, `RELEASE_ACCESS` and `TASK_FINISHED`.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::messages::{MessagePayload, TaskNewPayload};
use crate::cluster::messenger::Outbox;
use crate::dependencies::access::AccessView;
use crate::region::Region;
use crate::tasks::Task;
use crate::types::{NodeId, WriteId};

/// Identity of an offloaded task on the node that offloaded it.
///
/// The remote node names the task by `(offloader, offloaded_id)`; the
/// offloader keeps the context to know where its task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterTaskContext {
    pub remote_node: NodeId,
    pub offloaded_id: u64,
}

/// Satisfiability of one access, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatisfiabilityInfo {
    pub region: Region,
    pub location: Option<NodeId>,
    pub read: bool,
    pub write: bool,
    pub write_id: WriteId,
    /// Offloader-side id of a task offloaded to the same node that
    /// precedes this access.
    pub namespace_predecessor: Option<u64>,
}

impl SatisfiabilityInfo {
    pub fn new(
        region: Region,
        location: Option<NodeId>,
        read: bool,
        write: bool,
        write_id: WriteId,
    ) -> Self {
        Self {
            region,
            location,
            read,
            write,
            write_id,
            namespace_predecessor: None,
        }
    }

    /// Nothing to tell the remote node.
    pub fn is_empty(&self) -> bool {
        !self.read && !self.write && self.namespace_predecessor.is_none()
    }
}

/// Send `task` to `target` with whatever satisfiability is known so far.
pub fn offload_task(
    outbox: &Outbox,
    task: &Arc<Task>,
    target: NodeId,
    infos: Vec<SatisfiabilityInfo>,
) {
    let context = ClusterTaskContext {
        remote_node: target,
        offloaded_id: task.id().0,
    };
    *task.cluster_context.lock() = Some(context);
    debug!(
        task = %task.id(),
        label = task.label(),
        target,
        infos = infos.len(),
        "offloading task"
    );
    outbox.send(
        MessagePayload::TaskNew(TaskNewPayload {
            offloaded_id: context.offloaded_id,
            label: task.info().label.clone(),
            implementation: task.info().implementation.clone(),
            accesses: task.declared().to_vec(),
            infos,
            args: task.args().clone(),
        }),
        target,
    );
}

/// Satisfiability that reached an offloaded task after `TASK_NEW`.
pub fn send_satisfiability(outbox: &Outbox, task: &Arc<Task>, info: SatisfiabilityInfo) {
    let Some(context) = task.cluster_context() else {
        panic!("{} is not offloaded", task.id());
    };
    debug!(
        task = %task.id(),
        region = %info.region,
        read = info.read,
        write = info.write,
        target = context.remote_node,
        "sending satisfiability"
    );
    outbox.send_eager(
        MessagePayload::Satisfiability {
            offloaded_id: context.offloaded_id,
            info,
        },
        context.remote_node,
    );
}

/// A remote task finished; tell its offloader.
pub fn send_task_finished(outbox: &Outbox, offloader: NodeId, offloaded_id: u64) {
    debug!(offloader, offloaded_id, "sending task finished");
    outbox.send(MessagePayload::TaskFinished { offloaded_id }, offloader);
}

/// One access of a remote task was released here.
pub fn send_release_access(
    outbox: &Outbox,
    offloader: NodeId,
    offloaded_id: u64,
    access: &AccessView,
) {
    debug!(
        offloader,
        offloaded_id,
        region = %access.region,
        location = ?access.location,
        "sending access release"
    );
    outbox.send(
        MessagePayload::ReleaseAccess {
            offloaded_id,
            region: access.region,
            write_id: access.write_id,
            location: access.location,
        },
        offloader,
    );
}
