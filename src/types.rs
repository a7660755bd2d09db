// src/types.rs

//! Small identifier and policy types shared across the crate.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Dense cluster node index, `0..cluster_size`. Node 0 coordinates shutdown.
pub type NodeId = usize;

/// Wire encoding of an optional location (`-1` means unknown).
pub fn location_to_wire(location: Option<NodeId>) -> i32 {
    location.map_or(-1, |node| node as i32)
}

pub fn location_from_wire(raw: i32) -> Option<NodeId> {
    (raw >= 0).then_some(raw as NodeId)
}

/// Node-local task identifier. Never reused within a node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Token naming one version of a region's contents.
///
/// Ids are generated as `(node << 48) | counter`, so they are unique across
/// the whole cluster without coordination. Zero means "no version known".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WriteId(pub u64);

impl WriteId {
    pub const NONE: WriteId = WriteId(0);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Cluster scheduling policy for ready tasks.
///
/// - `Locality`: run where most of the task's bytes currently live.
/// - `Random`: spread tasks uniformly over all nodes.
/// - `Local`: never offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    Locality,
    Random,
    Local,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::Locality
    }
}

impl FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "locality" => Ok(SchedulingPolicy::Locality),
            "random" => Ok(SchedulingPolicy::Random),
            "local" => Ok(SchedulingPolicy::Local),
            other => Err(format!(
                "invalid scheduling policy: {other} (expected \"locality\", \"random\" or \"local\")"
            )),
        }
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulingPolicy::Locality => "locality",
            SchedulingPolicy::Random => "random",
            SchedulingPolicy::Local => "local",
        };
        f.write_str(name)
    }
}
