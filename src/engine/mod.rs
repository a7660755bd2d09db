// src/engine/mod.rs

//! Node runtimes and the in-process cluster that hosts them.
//!
//! - [`core`]: `NodeRuntime`, one per node: lifecycle, workers, task
//!   dispatch, and the glue between the dependency system and workflows.
//! - [`event_handlers`]: what each incoming cluster message does.
//! - [`runtime`]: `LocalCluster`, the launcher, main program entry point,
//!   shutdown handshake and async leader.

pub mod core;
pub mod event_handlers;
pub mod runtime;

pub use self::core::NodeRuntime;
pub use runtime::LocalCluster;
