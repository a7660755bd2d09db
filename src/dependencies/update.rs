// src/dependencies/update.rs

//! Deferred operations produced by automaton transitions and applied later,
//! each under the lock of the task that owns the target.

use std::sync::Arc;

use crate::dependencies::access::{AccessFlags, AccessHandle, Successor};
use crate::dependencies::reduction::ReductionInfo;
use crate::region::Region;
use crate::types::{NodeId, TaskId, WriteId};

/// One satisfiability change destined for a single access.
#[derive(Debug, Clone)]
pub struct UpdateOperation {
    pub target: AccessHandle,
    pub make_read: bool,
    pub make_write: bool,
    pub make_concurrent: bool,
    pub make_commutative: bool,
    pub location: Option<NodeId>,
    pub write_id: WriteId,
    pub set_reduction_info: Option<Arc<ReductionInfo>>,
    /// Offloader-side id of a task that precedes the target on the same
    /// remote node.
    pub namespace_predecessor: Option<u64>,
    /// Group satisfiability must stop at the target.
    pub to_next_only: bool,
}

impl UpdateOperation {
    pub fn new(target: AccessHandle) -> Self {
        Self {
            target,
            make_read: false,
            make_write: false,
            make_concurrent: false,
            make_commutative: false,
            location: None,
            write_id: WriteId::NONE,
            set_reduction_info: None,
            namespace_predecessor: None,
            to_next_only: false,
        }
    }

    /// An empty operation is a terminal no-op and is never propagated.
    pub fn is_empty(&self) -> bool {
        !self.make_read
            && !self.make_write
            && !self.make_concurrent
            && !self.make_commutative
            && self.set_reduction_info.is_none()
            && self.namespace_predecessor.is_none()
    }

    /// Satisfiability bits carried by the operation.
    pub fn flags(&self) -> AccessFlags {
        let mut flags = AccessFlags::NONE;
        if self.make_read {
            flags |= AccessFlags::READ_SATISFIED;
        }
        if self.make_write {
            flags |= AccessFlags::WRITE_SATISFIED;
        }
        if self.make_concurrent {
            flags |= AccessFlags::CONCURRENT_SATISFIED;
        }
        if self.make_commutative {
            flags |= AccessFlags::COMMUTATIVE_SATISFIED;
        }
        flags
    }
}

/// Everything the batch can defer. Each variant is applied under exactly one
/// task lock.
#[derive(Debug, Clone)]
pub enum DelayedOperation {
    Update(UpdateOperation),
    /// Make `successor` the next access of `target`.
    Link {
        target: AccessHandle,
        successor: Successor,
    },
    /// Link the access of remote task `predecessor` on `region` to a newly
    /// created remote access on the same node.
    NamespaceLink {
        predecessor: TaskId,
        region: Region,
        successor: Successor,
    },
    /// Ask the bottom-map owner to forget `access`.
    Detach {
        owner: TaskId,
        access: AccessHandle,
        region: Region,
        location: Option<NodeId>,
        write_id: WriteId,
    },
    /// The bottom-map owner forgot `target`.
    Detached { target: AccessHandle },
    /// Every child under `target` finished; the data now lives at `location`.
    ChildrenFinished {
        target: AccessHandle,
        location: Option<NodeId>,
        write_id: WriteId,
    },
}

impl DelayedOperation {
    /// Task whose lock is taken to apply the operation.
    pub fn owner(&self) -> TaskId {
        match self {
            DelayedOperation::Update(op) => op.target.task,
            DelayedOperation::Link { target, .. } => target.task,
            DelayedOperation::NamespaceLink { predecessor, .. } => *predecessor,
            DelayedOperation::Detach { owner, .. } => *owner,
            DelayedOperation::Detached { target } => target.task,
            DelayedOperation::ChildrenFinished { target, .. } => target.task,
        }
    }
}
