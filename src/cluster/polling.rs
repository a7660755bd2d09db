// src/cluster/polling.rs

//! Polling services: the only places where network progress is observed.
//!
//! Each service is single-consumer. Callers enter it with `try_lock` and
//! simply move on when another thread is already polling, so idle workers,
//! helping taskwaits and the leader task can all drive them.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cluster::messages::Message;
use crate::cluster::messenger::{DataTransfer, Messenger, PendingMessage};
use crate::errors::fatal;
use crate::memory::WriteVersions;
use crate::region::Region;
use crate::types::{NodeId, WriteId};

/// Messages handled per mail poll before returning to the caller.
const MAIL_BATCH: usize = 32;

pub type TransferCallback = Box<dyn FnOnce() + Send>;

/// Asynchronous sends waiting for completion.
#[derive(Debug, Default)]
pub struct PendingMessages {
    messages: Mutex<Vec<PendingMessage>>,
}

impl PendingMessages {
    pub fn push(&self, message: PendingMessage) {
        self.messages.lock().push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of sends that completed.
    pub fn poll(&self, messenger: &dyn Messenger) -> usize {
        let Some(mut messages) = self.messages.try_lock() else {
            return 0;
        };
        if messages.is_empty() {
            return 0;
        }
        if let Err(err) = messenger.test_messages(&mut messages) {
            fatal("test_messages", err);
        }
        let before = messages.len();
        messages.retain(|message| !message.completed);
        before - messages.len()
    }
}

struct TransferGroup {
    region: Region,
    write_id: WriteId,
    fragments: Vec<DataTransfer>,
    callbacks: Vec<TransferCallback>,
}

/// Incoming data transfers, coalesced per region and version.
#[derive(Default)]
pub struct PendingTransfers {
    groups: Mutex<Vec<TransferGroup>>,
}

impl PendingTransfers {
    /// Bring `region` at `write_id` from `source` and call `done` once it is
    /// here. A request covered by a transfer already in flight joins it;
    /// a version that is already local completes immediately.
    pub fn request(
        &self,
        messenger: &dyn Messenger,
        versions: &WriteVersions,
        request: TransferRequest,
        done: TransferCallback,
    ) {
        let TransferRequest {
            region,
            source,
            write_id,
            max_fragment,
        } = request;
        let mut groups = self.groups.lock();
        if versions.is_local(region, write_id) {
            drop(groups);
            trace!(%region, write_id = write_id.0, "version already local");
            done();
            return;
        }
        if let Some(group) = groups
            .iter_mut()
            .find(|group| group.write_id == write_id && group.region.contains(&region))
        {
            trace!(%region, covering = %group.region, "transfer coalesced");
            group.callbacks.push(done);
            return;
        }
        let fragments = region
            .fragments(max_fragment)
            .map(|fragment| messenger.fetch_data(fragment, source))
            .collect::<crate::errors::Result<Vec<_>>>()
            .unwrap_or_else(|err| fatal("fetch_data", err));
        debug!(%region, source, fragments = fragments.len(), "transfer started");
        groups.push(TransferGroup {
            region,
            write_id,
            fragments,
            callbacks: vec![done],
        });
    }

    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test every transfer in flight. Finished groups record their version
    /// before they leave the registry, and their callbacks run with the
    /// registry unlocked. Returns the number of finished groups.
    pub fn poll(&self, messenger: &dyn Messenger, versions: &WriteVersions) -> usize {
        let finished: Vec<TransferGroup> = {
            let Some(mut groups) = self.groups.try_lock() else {
                return 0;
            };
            for group in groups.iter_mut() {
                if let Err(err) = messenger.test_completion(&mut group.fragments) {
                    fatal("test_completion", err);
                }
            }
            let (finished, in_flight): (Vec<_>, Vec<_>) = std::mem::take(&mut *groups)
                .into_iter()
                .partition(|group| group.fragments.iter().all(|f| f.completed));
            *groups = in_flight;
            for group in &finished {
                versions.register(group.region, group.write_id);
            }
            finished
        };
        let count = finished.len();
        for group in finished {
            debug!(region = %group.region, waiters = group.callbacks.len(), "transfer finished");
            for callback in group.callbacks {
                callback();
            }
        }
        count
    }
}

/// Parameters of [`PendingTransfers::request`].
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    pub region: Region,
    pub source: NodeId,
    pub write_id: WriteId,
    pub max_fragment: u64,
}

/// The polling services of one node.
#[derive(Default)]
pub struct PollingServices {
    mail: Mutex<()>,
    pub messages: Arc<PendingMessages>,
    pub transfers: PendingTransfers,
}

impl PollingServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain up to a batch of incoming messages into `dispatch`.
    pub fn poll_mail(&self, messenger: &dyn Messenger, mut dispatch: impl FnMut(Message)) -> usize {
        let Some(_guard) = self.mail.try_lock() else {
            return 0;
        };
        let mut handled = 0;
        while handled < MAIL_BATCH {
            match messenger.check_mail() {
                Ok(Some(message)) => {
                    handled += 1;
                    dispatch(message);
                }
                Ok(None) => break,
                Err(err) => fatal("check_mail", err),
            }
        }
        handled
    }

    /// Run every service once. Returns how much progress was made.
    pub fn poll_all(
        &self,
        messenger: &dyn Messenger,
        versions: &WriteVersions,
        dispatch: impl FnMut(Message),
    ) -> usize {
        self.poll_mail(messenger, dispatch)
            + self.messages.poll(messenger)
            + self.transfers.poll(messenger, versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messenger::LocalFabric;
    use crate::memory::Allocation;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fabric_with_region(len: u64) -> (LocalFabric, Region) {
        let fabric = LocalFabric::new(2);
        let region = fabric.memory(0).unwrap().reserve(len);
        for node in 0..2 {
            fabric.memory(node).unwrap().map(Allocation {
                region,
                distributed: false,
                allocator: 0,
            });
        }
        (fabric, region)
    }

    #[test]
    fn overlapping_requests_share_one_transfer() {
        let (fabric, region) = fabric_with_region(256);
        let endpoint = fabric.endpoint(1).unwrap();
        let memory = fabric.memory(1).unwrap();
        let transfers = PendingTransfers::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for sub in [region, Region::new(region.start, 64)] {
            let calls = calls.clone();
            transfers.request(
                &endpoint,
                &memory.versions,
                TransferRequest {
                    region: sub,
                    source: 0,
                    write_id: WriteId(11),
                    max_fragment: 100,
                },
                Box::new(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers.poll(&endpoint, &memory.versions), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(memory.versions.is_local(region, WriteId(11)));
    }

    #[test]
    fn local_version_needs_no_transfer() {
        let (fabric, region) = fabric_with_region(8);
        let endpoint = fabric.endpoint(1).unwrap();
        let memory = fabric.memory(1).unwrap();
        memory.versions.register(region, WriteId(3));
        let transfers = PendingTransfers::default();
        let called = Arc::new(AtomicUsize::new(0));
        let flag = called.clone();
        transfers.request(
            &endpoint,
            &memory.versions,
            TransferRequest {
                region,
                source: 0,
                write_id: WriteId(3),
                max_fragment: 4,
            },
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert!(transfers.is_empty());
    }
}
