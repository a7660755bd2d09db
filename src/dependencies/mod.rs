// src/dependencies/mod.rs

//! Dependency tracking: per-access automaton, batched propagation and the
//! per-node dependency system.

pub mod access;
pub mod automaton;
pub mod batch;
pub mod reduction;
pub mod scoreboard;
pub mod system;
pub mod update;

pub use access::{AccessFlags, AccessHandle, AccessSpec, AccessType, AccessView, DataAccess};
pub use batch::DependencyBatch;
pub use reduction::{ReductionInfo, ReductionOperatorId};
pub use system::{BottomEntry, DependencyListener, DependencySystem, TaskDataAccesses};
pub use update::{DelayedOperation, UpdateOperation};
