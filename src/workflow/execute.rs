// src/workflow/execute.rs

//! Workflow shapes built for ready tasks.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::offloading::ClusterTaskContext;
use crate::dependencies::access::{AccessType, DataReleaseSink};
use crate::region::Region;
use crate::tasks::{ExecutionSlot, Task};
use crate::types::{NodeId, WriteId};

use super::{StepHandle, StepKind, Workflow, WorkflowBackend};

/// Where a ready task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Local,
    Cluster(NodeId),
}

/// Build and start the workflow of a ready task.
///
/// Local execution copies every access the body reads to this node, runs
/// the body, and for a task run on behalf of another node, reports each
/// access back as it completes. Cluster execution links every access to the
/// offloaded copy, sends the task, and finishes it locally once the remote
/// node reports it finished.
pub fn execute_task(
    task: &Arc<Task>,
    target: ExecutionTarget,
    backend: Arc<dyn WorkflowBackend>,
) -> Arc<Workflow> {
    let workflow = Workflow::new(Some(task.clone()), backend.clone());
    let execution = match target {
        ExecutionTarget::Local => build_local(&workflow, task, backend.as_ref()),
        ExecutionTarget::Cluster(node) => build_cluster(&workflow, task, backend.as_ref(), node),
    };
    debug!(task = %task.id(), ?target, steps = workflow.live_steps(), "executing");
    *task.workflow.lock() = Some(ExecutionSlot {
        workflow: workflow.clone(),
        step: execution,
    });
    workflow.start();
    workflow
}

fn build_local(
    workflow: &Arc<Workflow>,
    task: &Arc<Task>,
    backend: &dyn WorkflowBackend,
) -> crate::util::ArenaIndex {
    let views = backend.dependencies().access_views(task);
    let copies: Vec<_> = task
        .declared()
        .iter()
        .map(|spec| {
            let view = views.iter().find(|view| view.region == spec.region);
            let needs_copy = spec.kind.reads() && !spec.weak && spec.kind != AccessType::Reduction;
            match view {
                Some(view) if needs_copy => workflow.add_step(StepKind::data_copy(
                    spec.region,
                    view.location,
                    view.write_id,
                )),
                _ => workflow.add_step(StepKind::Null),
            }
        })
        .collect();

    let execution = workflow.add_step(StepKind::HostExecution);
    for copy in copies {
        workflow.add_link(copy, execution);
    }

    if task.is_remote() {
        let release = workflow.add_step(StepKind::data_release(
            task.declared().iter().map(|spec| spec.region),
        ));
        workflow.add_link(execution, release);
        let sink: Arc<dyn DataReleaseSink> = Arc::new(StepHandle::new(workflow.clone(), release));
        *task.release_sink.lock() = Some(sink);
    }
    execution
}

fn build_cluster(
    workflow: &Arc<Workflow>,
    task: &Arc<Task>,
    backend: &dyn WorkflowBackend,
    target: NodeId,
) -> crate::util::ArenaIndex {
    // Satisfiability may be forwarded as soon as the first link starts, so
    // the task must know where it goes before then.
    *task.cluster_context.lock() = Some(ClusterTaskContext {
        remote_node: target,
        offloaded_id: task.id().0,
    });
    let links: Vec<_> = task
        .declared()
        .iter()
        .map(|spec| workflow.add_step(StepKind::data_link(spec.region)))
        .collect();
    let execution = workflow.add_step(StepKind::cluster_execution(target));
    for link in links {
        workflow.add_link(link, execution);
    }

    let deps = backend.dependencies().clone();
    let finished = task.clone();
    let notify = workflow.add_step(StepKind::notification(move || {
        deps.finish_offloaded_task(&finished);
    }));
    workflow.add_link(execution, notify);
    execution
}

/// Copy `region` at `write_id` from `from` into this node, then call `then`.
/// Used for data a taskwait needs back.
pub fn fetch_region_workflow(
    backend: Arc<dyn WorkflowBackend>,
    region: Region,
    from: NodeId,
    write_id: WriteId,
    then: Box<dyn FnOnce() + Send>,
) -> Arc<Workflow> {
    let workflow = Workflow::new(None, backend);
    let copy = workflow.add_step(StepKind::data_copy(region, Some(from), write_id));
    let notify = workflow.add_step(StepKind::Notification(Some(then)));
    workflow.add_link(copy, notify);
    workflow.start();
    workflow
}
