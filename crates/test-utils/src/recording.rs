use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use taskweave::cluster::messages::{Message, MessageKind};
use taskweave::cluster::messenger::{DataTransfer, Messenger, PendingMessage};
use taskweave::dependencies::DependencyListener;
use taskweave::errors::Result;
use taskweave::region::Region;
use taskweave::tasks::Task;
use taskweave::types::{NodeId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Ready(TaskId),
    Removable(TaskId),
    TaskwaitCompleted(TaskId),
}

/// Dependency listener that only records what it is told.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    pub fn ready(&self) -> Vec<TaskId> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ListenerEvent::Ready(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn is_ready(&self, task: TaskId) -> bool {
        self.events.lock().contains(&ListenerEvent::Ready(task))
    }

    pub fn is_removable(&self, task: TaskId) -> bool {
        self.events.lock().contains(&ListenerEvent::Removable(task))
    }
}

impl DependencyListener for RecordingListener {
    fn task_ready(&self, task: Arc<Task>) {
        self.events.lock().push(ListenerEvent::Ready(task.id()));
    }

    fn task_removable(&self, task: Arc<Task>) {
        self.events.lock().push(ListenerEvent::Removable(task.id()));
    }

    fn taskwait_completed(&self, task: &Arc<Task>) {
        self.events
            .lock()
            .push(ListenerEvent::TaskwaitCompleted(task.id()));
    }
}

/// Messenger wrapper that records every message sent through it and
/// silently drops the kinds it was told to drop.
pub struct FilteringMessenger {
    inner: Arc<dyn Messenger>,
    dropped: HashSet<MessageKind>,
    sent: Mutex<Vec<(MessageKind, NodeId)>>,
}

impl FilteringMessenger {
    pub fn new(inner: Arc<dyn Messenger>) -> Arc<Self> {
        Self::dropping(inner, [])
    }

    pub fn dropping(
        inner: Arc<dyn Messenger>,
        kinds: impl IntoIterator<Item = MessageKind>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            dropped: kinds.into_iter().collect(),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Every message handed to this messenger, dropped ones included.
    pub fn sent(&self) -> Vec<(MessageKind, NodeId)> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.sent.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl Messenger for FilteringMessenger {
    fn node(&self) -> NodeId {
        self.inner.node()
    }

    fn cluster_size(&self) -> usize {
        self.inner.cluster_size()
    }

    fn send_message(
        &self,
        message: &Message,
        target: NodeId,
        blocking: bool,
    ) -> Result<Option<PendingMessage>> {
        let kind = message.kind();
        self.sent.lock().push((kind, target));
        if self.dropped.contains(&kind) {
            tracing::debug!(kind = kind.name(), target, "message dropped by filter");
            return Ok(None);
        }
        self.inner.send_message(message, target, blocking)
    }

    fn check_mail(&self) -> Result<Option<Message>> {
        self.inner.check_mail()
    }

    fn fetch_data(&self, region: Region, source: NodeId) -> Result<DataTransfer> {
        self.inner.fetch_data(region, source)
    }

    fn test_completion(&self, transfers: &mut [DataTransfer]) -> Result<()> {
        self.inner.test_completion(transfers)
    }

    fn test_messages(&self, messages: &mut [PendingMessage]) -> Result<()> {
        self.inner.test_messages(messages)
    }

    fn synchronize_all(&self) {
        self.inner.synchronize_all()
    }
}
