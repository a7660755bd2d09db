// src/cluster/mod.rs

//! Everything that crosses node boundaries.
//!
//! - `messages.rs`: wire messages and their codec.
//! - `messenger.rs`: the `Messenger` transport trait, the `Outbox` and the
//!   in-process `LocalFabric`.
//! - `offloading.rs`: the offloader side of the task offloading protocol.
//! - `namespace.rs`: remote tasks living on this node.
//! - `polling.rs`: mail, pending sends and pending data transfers.

pub mod messages;
pub mod messenger;
pub mod namespace;
pub mod offloading;
pub mod polling;

pub use messages::{Message, MessageKind, MessagePayload};
pub use messenger::{LocalFabric, Messenger, Outbox};
pub use namespace::NodeNamespace;
pub use offloading::{ClusterTaskContext, SatisfiabilityInfo};
