#![allow(dead_code)]

use bytes::Bytes;
use taskweave::config::{RawRuntimeConfig, RuntimeConfig};
use taskweave::dependencies::{AccessSpec, AccessType, ReductionOperatorId};
use taskweave::region::Region;
use taskweave::tasks::TaskSpec;
use taskweave::types::{NodeId, SchedulingPolicy};

/// Builder for `RuntimeConfig` to simplify test setup.
///
/// Starts from the defaults with one worker per node and a short idle wait.
pub struct ConfigBuilder {
    config: RawRuntimeConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = RawRuntimeConfig::default();
        config.runtime.workers_per_node = 1;
        config.runtime.idle_wait_us = 50;
        Self { config }
    }

    pub fn nodes(mut self, nodes: usize) -> Self {
        self.config.cluster.nodes = nodes;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.runtime.workers_per_node = workers;
        self
    }

    pub fn policy(mut self, policy: SchedulingPolicy) -> Self {
        self.config.scheduler.policy = policy;
        self
    }

    pub fn message_max_size(mut self, bytes: u64) -> Self {
        self.config.cluster.message_max_size = bytes;
        self
    }

    pub fn disable_remote(mut self, disabled: bool) -> Self {
        self.config.cluster.disable_remote = disabled;
        self
    }

    pub fn eager_send(mut self, eager: bool) -> Self {
        self.config.cluster.eager_send = eager;
        self
    }

    pub fn reduction_slots(mut self, slots: usize) -> Self {
        self.config.runtime.reduction_slots = slots;
        self
    }

    pub fn raw(self) -> RawRuntimeConfig {
        self.config
    }

    pub fn build(self) -> RuntimeConfig {
        RuntimeConfig::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskSpec` whose arguments are a list of little-endian
/// 64-bit words.
pub struct TaskSpecBuilder {
    spec: TaskSpec,
    words: Vec<u64>,
}

impl TaskSpecBuilder {
    pub fn new(implementation: &str) -> Self {
        Self {
            spec: TaskSpec::new(implementation),
            words: Vec::new(),
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.spec = self.spec.label(label);
        self
    }

    pub fn arg(mut self, word: u64) -> Self {
        self.words.push(word);
        self
    }

    /// Pushes `start` and `len`.
    pub fn arg_region(self, region: Region) -> Self {
        self.arg(region.start).arg(region.len)
    }

    pub fn read(mut self, region: Region) -> Self {
        self.spec = self.spec.read(region);
        self
    }

    pub fn write(mut self, region: Region) -> Self {
        self.spec = self.spec.write(region);
        self
    }

    pub fn read_write(mut self, region: Region) -> Self {
        self.spec = self.spec.read_write(region);
        self
    }

    pub fn concurrent(mut self, region: Region) -> Self {
        self.spec = self.spec.concurrent(region);
        self
    }

    pub fn commutative(mut self, region: Region) -> Self {
        self.spec = self.spec.commutative(region);
        self
    }

    pub fn reduction(mut self, region: Region, operator: ReductionOperatorId) -> Self {
        self.spec = self.spec.reduction(region, operator);
        self
    }

    pub fn weak(mut self, kind: AccessType, region: Region) -> Self {
        self.spec = self.spec.access(AccessSpec::new(kind, region).weak());
        self
    }

    pub fn on_node(mut self, node: NodeId) -> Self {
        self.spec = self.spec.on_node(node);
        self
    }

    pub fn build(self) -> TaskSpec {
        let args: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.spec.args(Bytes::from(args))
    }
}

/// Word `index` of a task's argument block.
pub fn word(args: &Bytes, index: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&args[index * 8..index * 8 + 8]);
    u64::from_le_bytes(raw)
}

/// Region stored at words `index` and `index + 1`.
pub fn region_word(args: &Bytes, index: usize) -> Region {
    Region::new(word(args, index), word(args, index + 1))
}
