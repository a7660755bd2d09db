// src/engine/event_handlers.rs

//! Handling of incoming cluster messages.
//!
//! Every handler runs on whichever thread is polling the mailbox. Handlers
//! never run task bodies themselves; anything that needs a worker goes
//! through the scheduler or a spawned function.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::cluster::messages::{Message, MessagePayload, TaskNewPayload};
use crate::cluster::namespace::Delivery;
use crate::cluster::offloading::SatisfiabilityInfo;
use crate::errors::{TaskweaveError, fatal};
use crate::memory::Allocation;
use crate::region::Region;
use crate::types::{NodeId, TaskId, WriteId};

use super::core::NodeRuntime;

pub(crate) fn handle_message(node: &Arc<NodeRuntime>, message: Message) {
    let sender = message.sender();
    trace!(
        node = node.node(),
        sender,
        kind = message.kind().name(),
        id = message.header.id,
        "message received"
    );
    match message.payload {
        MessagePayload::TaskNew(payload) => handle_task_new(node, sender, payload),
        MessagePayload::Satisfiability { offloaded_id, info } => {
            handle_satisfiability(node, sender, offloaded_id, info)
        }
        MessagePayload::TaskFinished { offloaded_id } => handle_task_finished(node, offloaded_id),
        MessagePayload::ReleaseAccess {
            offloaded_id,
            region,
            write_id,
            location,
        } => handle_release_access(node, offloaded_id, region, write_id, location),
        MessagePayload::Dmalloc {
            region,
            distributed,
        } => {
            node.memory().map(Allocation {
                region,
                distributed,
                allocator: sender,
            });
        }
        MessagePayload::Dfree { region } => {
            if let Err(err) = node.memory().unmap(region) {
                warn!(node = node.node(), %region, error = %err, "dfree for an unknown allocation");
            }
        }
        MessagePayload::SysFinish => handle_sys_finish(node, sender),
    }
}

/// Rebuild an offloaded task. Creation happens in a spawned function, off
/// the polling thread; satisfiability that arrives meanwhile is buffered by
/// the namespace.
fn handle_task_new(node: &Arc<NodeRuntime>, offloader: NodeId, payload: TaskNewPayload) {
    let Some(body) = node.implementations().get(&payload.implementation) else {
        fatal(
            "task_new",
            TaskweaveError::UnknownTask(payload.implementation),
        );
    };
    debug!(
        node = node.node(),
        offloader,
        offloaded_id = payload.offloaded_id,
        label = %payload.label,
        "task received"
    );
    let runtime = node.clone();
    let label = format!("remote-wrapper:{}", payload.label);
    node.spawn_function(
        move || {
            runtime.create_remote_task(offloader, payload, body);
        },
        None,
        label,
    );
}

fn handle_satisfiability(
    node: &Arc<NodeRuntime>,
    offloader: NodeId,
    offloaded_id: u64,
    info: SatisfiabilityInfo,
) {
    match node.namespace().buffer_or_lookup((offloader, offloaded_id), info) {
        Delivery::Live(task) => match node.dependencies().lookup(task) {
            Some(task) => node.dependencies().propagate_satisfiability(&task, &info),
            None => warn!(node = node.node(), %task, "satisfiability for a discarded task"),
        },
        Delivery::Buffered => {}
        Delivery::Finished => {
            warn!(
                node = node.node(),
                offloader,
                offloaded_id,
                region = %info.region,
                "satisfiability for a finished remote task dropped"
            );
        }
    }
}

fn handle_task_finished(node: &Arc<NodeRuntime>, offloaded_id: u64) {
    let id = TaskId(offloaded_id);
    let Some(task) = node.dependencies().lookup(id) else {
        panic!("task finished for unknown task {id}");
    };
    let Some(slot) = task.execution_slot() else {
        panic!("{id} finished remotely without a workflow");
    };
    debug!(node = node.node(), task = %id, "offloaded task finished");
    slot.workflow.complete_step(slot.step);
}

fn handle_release_access(
    node: &Arc<NodeRuntime>,
    offloaded_id: u64,
    region: Region,
    write_id: WriteId,
    location: Option<NodeId>,
) {
    let id = TaskId(offloaded_id);
    match node.dependencies().lookup(id) {
        Some(task) => node
            .dependencies()
            .release_remote_access(&task, region, location, write_id),
        None => panic!("access release for unknown task {id}"),
    }
}

fn handle_sys_finish(node: &Arc<NodeRuntime>, sender: NodeId) {
    assert_ne!(node.node(), 0, "node 0 received SYS_FINISH from node {sender}");
    debug!(node = node.node(), "shutdown requested");
    node.request_shutdown();
}
