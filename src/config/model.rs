// src/config/model.rs

use serde::Deserialize;

use crate::types::SchedulingPolicy;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [cluster]
/// nodes = 2
/// message_max_size = 65536
///
/// [runtime]
/// workers_per_node = 2
///
/// [scheduler]
/// policy = "locality"
/// ```
///
/// All sections are optional and have defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRuntimeConfig {
    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,
}

/// `[cluster]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterSection {
    /// Number of in-process nodes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Largest data transfer fragment, in bytes.
    #[serde(default = "default_message_max_size")]
    pub message_max_size: u64,

    /// Disable the same-node namespace shortcut; all satisfiability then goes
    /// through the offloader.
    #[serde(default)]
    pub disable_remote: bool,

    /// Send satisfiability messages without waiting for completion.
    #[serde(default = "default_eager_send")]
    pub eager_send: bool,
}

fn default_nodes() -> usize {
    1
}

fn default_message_max_size() -> u64 {
    65536
}

fn default_eager_send() -> bool {
    true
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            message_max_size: default_message_max_size(),
            disable_remote: false,
            eager_send: default_eager_send(),
        }
    }
}

/// `[runtime]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_workers_per_node")]
    pub workers_per_node: usize,

    /// Private slots per reduction group (at most 64).
    #[serde(default = "default_reduction_slots")]
    pub reduction_slots: usize,

    /// How long an idle thread parks before polling again, in microseconds.
    #[serde(default = "default_idle_wait_us")]
    pub idle_wait_us: u64,
}

fn default_workers_per_node() -> usize {
    2
}

fn default_reduction_slots() -> usize {
    4
}

fn default_idle_wait_us() -> u64 {
    200
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workers_per_node: default_workers_per_node(),
            reduction_slots: default_reduction_slots(),
            idle_wait_us: default_idle_wait_us(),
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub policy: SchedulingPolicy,
}

/// Validated configuration. Only built through `TryFrom<RawRuntimeConfig>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub cluster: ClusterSection,
    pub runtime: RuntimeSection,
    pub scheduler: SchedulerSection,
}

impl RuntimeConfig {
    pub(crate) fn new_unchecked(raw: RawRuntimeConfig) -> Self {
        Self {
            cluster: raw.cluster,
            runtime: raw.runtime,
            scheduler: raw.scheduler,
        }
    }

    pub fn nodes(&self) -> usize {
        self.cluster.nodes
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.scheduler.policy
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new_unchecked(RawRuntimeConfig::default())
    }
}
