// src/cluster/messenger.rs

//! Transport abstraction the offloading protocol is layered on.
//!
//! The protocol only talks to a [`Messenger`]. [`LocalFabric`] is the
//! bundled in-process transport: every node gets an inbox of encoded
//! messages, and data transfers are one-sided copies between the node
//! memory images, performed when the transfer is tested for completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cluster::messages::{Message, MessageIdAllocator, MessageKind, MessagePayload};
use crate::cluster::polling::PendingMessages;
use crate::errors::{Result, TaskweaveError, fatal};
use crate::memory::NodeMemory;
use crate::region::Region;
use crate::types::NodeId;

/// An asynchronous send that has not been tested for completion yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: u32,
    pub kind: MessageKind,
    pub target: NodeId,
    pub completed: bool,
}

/// One in-flight fetch of a region from another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransfer {
    pub id: u64,
    pub region: Region,
    pub source: NodeId,
    pub completed: bool,
}

/// Send/receive primitives of one node.
///
/// Implementations report unrecoverable transport failures as
/// [`TaskweaveError::Transport`]; the protocol layer turns those into a
/// fatal error.
pub trait Messenger: Send + Sync {
    fn node(&self) -> NodeId;

    fn cluster_size(&self) -> usize;

    /// Send `message` to `target`. A non-blocking send returns a handle
    /// that completes through [`Messenger::test_messages`].
    fn send_message(
        &self,
        message: &Message,
        target: NodeId,
        blocking: bool,
    ) -> Result<Option<PendingMessage>>;

    /// At most one fully received message, without blocking.
    fn check_mail(&self) -> Result<Option<Message>>;

    /// Start copying `region` from `source` into this node's memory.
    fn fetch_data(&self, region: Region, source: NodeId) -> Result<DataTransfer>;

    /// Mark every finished transfer in `transfers` as completed.
    fn test_completion(&self, transfers: &mut [DataTransfer]) -> Result<()>;

    /// Mark every finished send in `messages` as completed.
    fn test_messages(&self, messages: &mut [PendingMessage]) -> Result<()>;

    /// Collective barrier across every node.
    fn synchronize_all(&self);
}

/// Sending side used by the protocol: message ids, the eager-send policy
/// and the registry of asynchronous sends.
pub struct Outbox {
    messenger: Arc<dyn Messenger>,
    ids: MessageIdAllocator,
    pending: Arc<PendingMessages>,
    eager_send: bool,
}

impl Outbox {
    pub fn new(messenger: Arc<dyn Messenger>, pending: Arc<PendingMessages>, eager_send: bool) -> Self {
        Self {
            messenger,
            ids: MessageIdAllocator::new(),
            pending,
            eager_send,
        }
    }

    pub fn node(&self) -> NodeId {
        self.messenger.node()
    }

    pub fn cluster_size(&self) -> usize {
        self.messenger.cluster_size()
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Send and wait for completion.
    pub fn send(&self, payload: MessagePayload, target: NodeId) {
        self.send_with(payload, target, true);
    }

    /// Send without waiting when eager sending is enabled.
    pub fn send_eager(&self, payload: MessagePayload, target: NodeId) {
        self.send_with(payload, target, !self.eager_send);
    }

    /// Send a copy of `payload` to every other node.
    pub fn broadcast(&self, payload: MessagePayload) {
        let me = self.node();
        for target in (0..self.cluster_size()).filter(|node| *node != me) {
            self.send(payload.clone(), target);
        }
    }

    fn send_with(&self, payload: MessagePayload, target: NodeId, blocking: bool) {
        let message = self.ids.message(self.node(), payload);
        trace!(
            kind = message.kind().name(),
            id = message.header.id,
            target,
            "sending message"
        );
        match self.messenger.send_message(&message, target, blocking) {
            Ok(Some(pending)) => self.pending.push(pending),
            Ok(None) => {}
            Err(err) => fatal("send_message", err),
        }
    }
}

struct FabricShared {
    memories: Vec<Arc<NodeMemory>>,
    inboxes: Vec<mpsc::UnboundedSender<Bytes>>,
    barrier: Barrier,
    next_transfer: AtomicU64,
}

/// In-process cluster transport.
pub struct LocalFabric {
    shared: Arc<FabricShared>,
    receivers: Vec<Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>>,
}

impl LocalFabric {
    pub fn new(cluster_size: usize) -> Self {
        let cluster_size = cluster_size.max(1);
        let memories = (0..cluster_size)
            .map(|node| Arc::new(NodeMemory::new(node, cluster_size)))
            .collect();
        let (inboxes, receivers): (Vec<_>, Vec<_>) = (0..cluster_size)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Mutex::new(Some(rx)))
            })
            .unzip();
        Self {
            shared: Arc::new(FabricShared {
                memories,
                inboxes,
                barrier: Barrier::new(cluster_size),
                next_transfer: AtomicU64::new(1),
            }),
            receivers,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.shared.memories.len()
    }

    pub fn memory(&self, node: NodeId) -> Option<Arc<NodeMemory>> {
        self.shared.memories.get(node).cloned()
    }

    /// Messenger endpoint of `node`. Each endpoint can be taken once.
    pub fn endpoint(&self, node: NodeId) -> Result<LocalEndpoint> {
        let inbox = self
            .receivers
            .get(node)
            .and_then(|slot| slot.lock().take())
            .ok_or_else(|| {
                TaskweaveError::Transport(format!("no unclaimed endpoint for node {node}"))
            })?;
        Ok(LocalEndpoint {
            node,
            shared: self.shared.clone(),
            inbox: Mutex::new(inbox),
        })
    }
}

/// One node's view of a [`LocalFabric`].
pub struct LocalEndpoint {
    node: NodeId,
    shared: Arc<FabricShared>,
    inbox: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl LocalEndpoint {
    fn memory(&self, node: NodeId) -> Result<&Arc<NodeMemory>> {
        self.shared
            .memories
            .get(node)
            .ok_or_else(|| TaskweaveError::Transport(format!("unknown node {node}")))
    }
}

impl Messenger for LocalEndpoint {
    fn node(&self) -> NodeId {
        self.node
    }

    fn cluster_size(&self) -> usize {
        self.shared.memories.len()
    }

    fn send_message(
        &self,
        message: &Message,
        target: NodeId,
        blocking: bool,
    ) -> Result<Option<PendingMessage>> {
        let inbox = self
            .shared
            .inboxes
            .get(target)
            .ok_or_else(|| TaskweaveError::Transport(format!("unknown node {target}")))?;
        // Delivery is immediate in both modes, which keeps per-pair FIFO
        // order; an asynchronous handle completes on its next test.
        inbox
            .send(message.encode())
            .map_err(|_| TaskweaveError::Transport(format!("inbox of node {target} is closed")))?;
        Ok((!blocking).then(|| PendingMessage {
            id: message.header.id,
            kind: message.kind(),
            target,
            completed: false,
        }))
    }

    fn check_mail(&self) -> Result<Option<Message>> {
        match self.inbox.lock().try_recv() {
            Ok(bytes) => Message::decode(bytes).map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TaskweaveError::Transport(
                format!("inbox of node {} disconnected", self.node),
            )),
        }
    }

    fn fetch_data(&self, region: Region, source: NodeId) -> Result<DataTransfer> {
        self.memory(source)?;
        let id = self.shared.next_transfer.fetch_add(1, Ordering::Relaxed);
        trace!(node = self.node, %region, source, id, "fetch started");
        Ok(DataTransfer {
            id,
            region,
            source,
            completed: false,
        })
    }

    fn test_completion(&self, transfers: &mut [DataTransfer]) -> Result<()> {
        let target = self.memory(self.node)?;
        for transfer in transfers.iter_mut().filter(|t| !t.completed) {
            let bytes = self.memory(transfer.source)?.read(transfer.region)?;
            target.write(transfer.region, &bytes)?;
            transfer.completed = true;
            debug!(
                node = self.node,
                region = %transfer.region,
                source = transfer.source,
                "fetch completed"
            );
        }
        Ok(())
    }

    fn test_messages(&self, messages: &mut [PendingMessage]) -> Result<()> {
        for message in messages.iter_mut() {
            message.completed = true;
        }
        Ok(())
    }

    fn synchronize_all(&self) {
        debug!(node = self.node, "entering cluster barrier");
        self.shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Allocation;

    #[test]
    fn messages_arrive_in_order_and_decode() {
        let fabric = LocalFabric::new(2);
        let zero = fabric.endpoint(0).unwrap();
        let one = fabric.endpoint(1).unwrap();
        let ids = MessageIdAllocator::new();

        for offloaded_id in 1..=3 {
            let message = ids.message(0, MessagePayload::TaskFinished { offloaded_id });
            let pending = zero.send_message(&message, 1, offloaded_id == 2).unwrap();
            assert_eq!(pending.is_some(), offloaded_id != 2);
        }

        let received: Vec<_> = std::iter::from_fn(|| one.check_mail().unwrap())
            .map(|m| m.payload)
            .collect();
        assert_eq!(
            received,
            (1..=3)
                .map(|offloaded_id| MessagePayload::TaskFinished { offloaded_id })
                .collect::<Vec<_>>()
        );
        assert!(zero.check_mail().unwrap().is_none());
    }

    #[test]
    fn fetch_copies_on_completion() {
        let fabric = LocalFabric::new(2);
        let region = fabric.memory(0).unwrap().reserve(16);
        for node in 0..2 {
            fabric.memory(node).unwrap().map(Allocation {
                region,
                distributed: false,
                allocator: 0,
            });
        }
        fabric.memory(0).unwrap().write(region, &[7; 16]).unwrap();

        let one = fabric.endpoint(1).unwrap();
        let mut transfers = vec![one.fetch_data(region, 0).unwrap()];
        assert_eq!(fabric.memory(1).unwrap().read(region).unwrap(), vec![0; 16]);
        one.test_completion(&mut transfers).unwrap();
        assert!(transfers[0].completed);
        assert_eq!(fabric.memory(1).unwrap().read(region).unwrap(), vec![7; 16]);
    }

    #[test]
    fn endpoints_are_claimed_once() {
        let fabric = LocalFabric::new(1);
        assert!(fabric.endpoint(0).is_ok());
        assert!(matches!(fabric.endpoint(0), Err(TaskweaveError::Transport(_))));
    }
}
