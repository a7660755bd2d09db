// src/tasks/context.rs

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::cluster::messages::MessagePayload;
use crate::engine::NodeRuntime;
use crate::errors::{Result, TaskweaveError};
use crate::memory::Allocation;
use crate::region::Region;
use crate::types::{NodeId, TaskId};

use super::{BlockingHandle, Task, TaskSpec};

/// What a task body sees of the runtime while it runs.
///
/// Reads and writes go to the memory image of the node the body runs on;
/// the workflow has already copied in every version the task depends on.
pub struct TaskContext<'a> {
    runtime: &'a Arc<NodeRuntime>,
    task: &'a Arc<Task>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(runtime: &'a Arc<NodeRuntime>, task: &'a Arc<Task>) -> Self {
        Self { runtime, task }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn label(&self) -> &str {
        self.task.label()
    }

    /// Node the body is running on.
    pub fn node(&self) -> NodeId {
        self.runtime.node()
    }

    pub fn cluster_size(&self) -> usize {
        self.runtime.cluster_size()
    }

    pub fn args(&self) -> &Bytes {
        self.task.args()
    }

    pub fn read(&self, region: Region) -> Result<Vec<u8>> {
        self.runtime.memory().read(region)
    }

    pub fn write(&self, region: Region, bytes: &[u8]) -> Result<()> {
        self.runtime.memory().write(region, bytes)
    }

    /// First 8 bytes of `region` as a little-endian `i64`.
    pub fn read_i64(&self, region: Region) -> Result<i64> {
        let bytes = self.read(Region::new(region.start, 8))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn write_i64(&self, region: Region, value: i64) -> Result<()> {
        self.write(Region::new(region.start, 8), &value.to_le_bytes())
    }

    /// Fold `contribution` into this task's private slot of the reduction
    /// group on `region`.
    pub fn reduce(&self, region: Region, contribution: &[u8]) -> Result<()> {
        if contribution.len() as u64 != region.len {
            return Err(TaskweaveError::Other(anyhow::anyhow!(
                "contribution of {} bytes to {region}",
                contribution.len()
            )));
        }
        let info = self
            .runtime
            .dependencies()
            .reduction_info(self.task, region)
            .ok_or_else(|| {
                TaskweaveError::Other(anyhow::anyhow!(
                    "{} has no reduction access on {region}",
                    self.task.id()
                ))
            })?;
        let operator = info.operator().operator().ok_or_else(|| {
            TaskweaveError::Other(anyhow::anyhow!(
                "unknown reduction operator {:?}",
                info.operator()
            ))
        })?;
        let mut slot = info.acquire_slot();
        trace!(task = %self.task.id(), %region, slot = slot.index(), "reduction contribution");
        operator.combine(slot.as_mut_slice(), contribution);
        Ok(())
    }

    pub fn contribute_i64(&self, region: Region, value: i64) -> Result<()> {
        let lanes = (region.len / 8) as usize;
        let bytes: Vec<u8> = std::iter::repeat_n(value.to_le_bytes(), lanes)
            .flatten()
            .collect();
        self.reduce(region, &bytes)
    }

    /// Submit a child task. It becomes ready once its accesses are satisfied.
    pub fn spawn(&self, spec: TaskSpec) -> Result<TaskId> {
        self.runtime.submit(self.task, spec)
    }

    /// Wait for every child spawned so far, helping with other work
    /// meanwhile.
    pub fn taskwait(&self) {
        debug!(task = %self.task.id(), "taskwait");
        self.runtime.dependencies().taskwait(self.task);
        let idle = Duration::from_micros(self.runtime.config().runtime.idle_wait_us);
        while self.task.in_taskwait() {
            if !self.runtime.help() {
                self.runtime.scheduler().wait_for_work(idle);
            }
        }
        debug!(task = %self.task.id(), "taskwait done");
    }

    pub fn blocking_handle(&self) -> BlockingHandle {
        BlockingHandle {
            state: self.task.blocking.clone(),
        }
    }

    /// Park this task, and the worker running it, until its handle is
    /// unblocked.
    pub fn block_current(&self) {
        self.task.blocking.block();
    }

    /// Allocate cluster memory homed on this node.
    pub fn lmalloc(&self, len: u64) -> Region {
        self.allocate(len, false)
    }

    /// Allocate cluster memory whose homes are spread blockwise over every
    /// node.
    pub fn dmalloc(&self, len: u64) -> Region {
        self.allocate(len, true)
    }

    fn allocate(&self, len: u64, distributed: bool) -> Region {
        let memory = self.runtime.memory();
        let region = memory.reserve(len);
        memory.map(Allocation {
            region,
            distributed,
            allocator: self.runtime.node(),
        });
        self.runtime.outbox().broadcast(MessagePayload::Dmalloc {
            region,
            distributed,
        });
        region
    }

    pub fn dfree(&self, region: Region) -> Result<()> {
        self.runtime.memory().unmap(region)?;
        self.runtime
            .outbox()
            .broadcast(MessagePayload::Dfree { region });
        Ok(())
    }
}
