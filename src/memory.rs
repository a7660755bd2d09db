// src/memory.rs

//! Node-local view of cluster memory.
//!
//! Every node keeps its own image of the cluster address space. Segments are
//! mapped on all nodes when they are allocated, and their contents diverge
//! until a data transfer copies a region from one image to another. The
//! directory remembers each allocation and its home node. The version table
//! remembers which write version of a region this node currently holds.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::errors::{Result, TaskweaveError};
use crate::region::Region;
use crate::types::{NodeId, WriteId};

/// First address handed out by the cluster allocator.
pub const CLUSTER_MEMORY_BASE: u64 = 0x1000_0000;
/// Each node reserves addresses from its own window, so allocations made on
/// different nodes never collide.
const NODE_ADDRESS_WINDOW: u64 = 1 << 40;
const ALLOCATION_ALIGN: u64 = 64;

struct Segment {
    region: Region,
    data: Mutex<Vec<u8>>,
}

/// One registered allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub region: Region,
    /// Distributed allocations spread their homes blockwise over all nodes.
    pub distributed: bool,
    pub allocator: NodeId,
}

#[derive(Debug)]
pub struct Directory {
    cluster_size: usize,
    allocations: RwLock<BTreeMap<u64, Allocation>>,
}

impl Directory {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            cluster_size: cluster_size.max(1),
            allocations: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, allocation: Allocation) {
        self.allocations
            .write()
            .insert(allocation.region.start, allocation);
    }

    pub fn unregister(&self, region: Region) -> Option<Allocation> {
        self.allocations.write().remove(&region.start)
    }

    /// Allocation that fully contains `region`.
    pub fn lookup(&self, region: Region) -> Option<Allocation> {
        let allocations = self.allocations.read();
        allocations
            .range(..=region.start)
            .next_back()
            .map(|(_, allocation)| *allocation)
            .filter(|allocation| region.fully_contained_in(&allocation.region))
    }

    pub fn is_distributed(&self, region: Region) -> bool {
        self.lookup(region).is_some_and(|a| a.distributed)
    }

    /// Home node of the first byte of `region`.
    pub fn home(&self, region: Region) -> Option<NodeId> {
        let allocation = self.lookup(region)?;
        if !allocation.distributed {
            return Some(allocation.allocator);
        }
        let nodes = self.cluster_size as u64;
        let block = allocation.region.len.div_ceil(nodes).max(1);
        let offset = region.start - allocation.region.start;
        Some(((offset / block).min(nodes - 1)) as NodeId)
    }
}

const VERSIONS_PER_REGION: usize = 16;

/// Which versions of each region this node has held.
///
/// Older versions stay listed after a newer one is produced here: the
/// dependency order guarantees that whoever still asks for an older version
/// is a member of the same concurrent or commutative group as the writer, and
/// must see the local contents.
#[derive(Debug, Default)]
pub struct WriteVersions {
    held: Mutex<HashMap<Region, VecDeque<WriteId>>>,
}

impl WriteVersions {
    pub fn register(&self, region: Region, write_id: WriteId) {
        if write_id.is_none() {
            return;
        }
        trace!(%region, write_id = write_id.0, "write version registered");
        let mut held = self.held.lock();
        let versions = held.entry(region).or_default();
        if !versions.contains(&write_id) {
            if versions.len() == VERSIONS_PER_REGION {
                versions.pop_front();
            }
            versions.push_back(write_id);
        }
    }

    pub fn is_local(&self, region: Region, write_id: WriteId) -> bool {
        !write_id.is_none()
            && self
                .held
                .lock()
                .get(&region)
                .is_some_and(|versions| versions.contains(&write_id))
    }

    pub fn forget(&self, region: Region) {
        self.held.lock().remove(&region);
    }
}

/// The memory image of one node.
pub struct NodeMemory {
    node: NodeId,
    segments: RwLock<BTreeMap<u64, Segment>>,
    pub directory: Directory,
    pub versions: WriteVersions,
    write_counter: AtomicU64,
    bump: Mutex<u64>,
}

impl NodeMemory {
    pub fn new(node: NodeId, cluster_size: usize) -> Self {
        Self {
            node,
            segments: RwLock::new(BTreeMap::new()),
            directory: Directory::new(cluster_size),
            versions: WriteVersions::default(),
            write_counter: AtomicU64::new(1),
            bump: Mutex::new(CLUSTER_MEMORY_BASE + node as u64 * NODE_ADDRESS_WINDOW),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Fresh cluster-unique write version.
    pub fn next_write_id(&self) -> WriteId {
        let counter = self.write_counter.fetch_add(1, Ordering::Relaxed);
        WriteId(((self.node as u64) << 48) | counter)
    }

    /// Reserve address space from this node's window. The caller maps the
    /// result on every node.
    pub fn reserve(&self, len: u64) -> Region {
        let mut bump = self.bump.lock();
        let start = bump.next_multiple_of(ALLOCATION_ALIGN);
        *bump = start + len.max(1);
        Region::new(start, len)
    }

    /// Map a zero-filled segment and record the allocation.
    pub fn map(&self, allocation: Allocation) {
        let region = allocation.region;
        debug!(node = self.node, %region, distributed = allocation.distributed, "segment mapped");
        self.segments.write().insert(
            region.start,
            Segment {
                region,
                data: Mutex::new(vec![0; region.len as usize]),
            },
        );
        self.directory.register(allocation);
    }

    pub fn unmap(&self, region: Region) -> Result<()> {
        let removed = self.segments.write().remove(&region.start);
        self.directory.unregister(region);
        self.versions.forget(region);
        match removed {
            Some(segment) if segment.region == region => {
                debug!(node = self.node, %region, "segment unmapped");
                Ok(())
            }
            _ => Err(TaskweaveError::UnmappedRegion(region)),
        }
    }

    pub fn is_mapped(&self, region: Region) -> bool {
        self.with_segment(region, |_, _| ()).is_ok()
    }

    pub fn read(&self, region: Region) -> Result<Vec<u8>> {
        self.with_segment(region, |data, offset| {
            data[offset..offset + region.len as usize].to_vec()
        })
    }

    pub fn write(&self, region: Region, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != region.len {
            return Err(TaskweaveError::Other(anyhow::anyhow!(
                "write of {} bytes into {region}",
                bytes.len()
            )));
        }
        self.with_segment(region, |data, offset| {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// Run `f` over the bytes of `region` in place.
    pub fn update(&self, region: Region, f: impl FnOnce(&mut [u8])) -> Result<()> {
        self.with_segment(region, |data, offset| {
            f(&mut data[offset..offset + region.len as usize])
        })
    }

    fn with_segment<T>(&self, region: Region, f: impl FnOnce(&mut Vec<u8>, usize) -> T) -> Result<T> {
        let segments = self.segments.read();
        let segment = segments
            .range(..=region.start)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| region.fully_contained_in(&segment.region))
            .ok_or(TaskweaveError::UnmappedRegion(region))?;
        let offset = (region.start - segment.region.start) as usize;
        let mut data = segment.data.lock();
        Ok(f(&mut data, offset))
    }
}
