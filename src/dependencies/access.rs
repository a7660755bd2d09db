// src/dependencies/access.rs

//! One task's access to one region, plus the handles that link accesses
//! into per-region chains.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::dependencies::reduction::{ReductionInfo, ReductionOperatorId};
use crate::region::Region;
use crate::types::{NodeId, TaskId, WriteId};
use crate::util::ArenaIndex;

/// Kind of a declared (or runtime-created) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessType {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
    Concurrent = 3,
    Commutative = 4,
    Reduction = 5,
    /// Taskwait and end-of-task sinks. Never declared by user tasks.
    NoAccess = 6,
}

impl AccessType {
    pub fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => AccessType::Read,
            1 => AccessType::Write,
            2 => AccessType::ReadWrite,
            3 => AccessType::Concurrent,
            4 => AccessType::Commutative,
            5 => AccessType::Reduction,
            6 => AccessType::NoAccess,
            _ => return None,
        })
    }

    /// Whether executing the access produces a new version of the data.
    pub fn writes(self) -> bool {
        !matches!(self, AccessType::Read | AccessType::NoAccess)
    }

    /// Whether executing the access needs the current contents locally.
    pub fn reads(self) -> bool {
        !matches!(self, AccessType::Write | AccessType::NoAccess)
    }

    /// Kinds whose members may be active simultaneously.
    pub fn is_group(self) -> bool {
        matches!(
            self,
            AccessType::Concurrent | AccessType::Commutative | AccessType::Reduction
        )
    }
}

/// Atomic flag word of a [`DataAccess`].
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const NONE: AccessFlags = AccessFlags(0);
    pub const READ_SATISFIED: AccessFlags = AccessFlags(1 << 0);
    pub const WRITE_SATISFIED: AccessFlags = AccessFlags(1 << 1);
    pub const CONCURRENT_SATISFIED: AccessFlags = AccessFlags(1 << 2);
    pub const COMMUTATIVE_SATISFIED: AccessFlags = AccessFlags(1 << 3);
    /// The originator finished with this access (unregistered).
    pub const RELEASED: AccessFlags = AccessFlags(1 << 4);
    /// Every child access nested under this one has finished.
    pub const CHILDREN_FINISHED: AccessFlags = AccessFlags(1 << 5);
    pub const HAS_NEXT: AccessFlags = AccessFlags(1 << 6);
    pub const HAS_CHILD: AccessFlags = AccessFlags(1 << 7);
    pub const NEXT_READ_SENT: AccessFlags = AccessFlags(1 << 8);
    pub const NEXT_WRITE_SENT: AccessFlags = AccessFlags(1 << 9);
    pub const NEXT_CONCURRENT_SENT: AccessFlags = AccessFlags(1 << 10);
    pub const NEXT_COMMUTATIVE_SENT: AccessFlags = AccessFlags(1 << 11);
    pub const NEXT_REDUCTION_SENT: AccessFlags = AccessFlags(1 << 12);
    pub const CHILD_READ_SENT: AccessFlags = AccessFlags(1 << 13);
    pub const CHILD_WRITE_SENT: AccessFlags = AccessFlags(1 << 14);
    pub const CHILD_CONCURRENT_SENT: AccessFlags = AccessFlags(1 << 15);
    pub const CHILD_COMMUTATIVE_SENT: AccessFlags = AccessFlags(1 << 16);
    pub const WEAK: AccessFlags = AccessFlags(1 << 17);
    /// The originator's readiness counter already accounted for this access.
    pub const SATISFIED_COUNTED: AccessFlags = AccessFlags(1 << 18);
    pub const COMPLETE: AccessFlags = AccessFlags(1 << 19);
    pub const DETACH_REQUESTED: AccessFlags = AccessFlags(1 << 20);
    /// The bottom map no longer references this access.
    pub const DETACHED: AccessFlags = AccessFlags(1 << 21);
    pub const HAS_REDUCTION_INFO: AccessFlags = AccessFlags(1 << 22);
    pub const REDUCTION_COMBINED: AccessFlags = AccessFlags(1 << 23);
    /// Group satisfiability is handed to the immediate destination only.
    pub const NO_GROUP_FANOUT: AccessFlags = AccessFlags(1 << 24);
    pub const NAMESPACE_NEXT: AccessFlags = AccessFlags(1 << 25);
    pub const RELEASE_NOTIFIED: AccessFlags = AccessFlags(1 << 26);
    /// The location was reported by the remote copy of the task on release.
    pub const LOCATION_PINNED: AccessFlags = AccessFlags(1 << 27);

    /// Bits that may arrive from another access.
    pub const SATISFIABILITY: AccessFlags = AccessFlags(0b1111);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        AccessFlags(bits)
    }

    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: AccessFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: AccessFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AccessFlags {
    type Output = AccessFlags;

    fn bitand(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 27] = [
            "R", "W", "C", "M", "REL", "CHFIN", "NEXT", "CHILD", "nR", "nW", "nC", "nM", "nRED",
            "cR", "cW", "cC", "cM", "WEAK", "CNT", "DONE", "DETREQ", "DET", "RED", "COMB",
            "NOFAN", "NS", "RELNOT",
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{{{}}}", names.join("|"))
    }
}

/// Stable, cross-task reference to an access: the owning task plus the
/// index of the access inside that task's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessHandle {
    pub task: TaskId,
    pub index: ArenaIndex,
}

/// An access as declared by a task before registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSpec {
    pub kind: AccessType,
    pub region: Region,
    pub weak: bool,
    pub reduction: Option<ReductionOperatorId>,
}

impl AccessSpec {
    pub fn new(kind: AccessType, region: Region) -> Self {
        Self {
            kind,
            region,
            weak: false,
            reduction: None,
        }
    }

    pub fn weak(mut self) -> Self {
        self.weak = true;
        self
    }

    pub fn reduction(region: Region, operator: ReductionOperatorId) -> Self {
        Self {
            kind: AccessType::Reduction,
            region,
            weak: false,
            reduction: Some(operator),
        }
    }
}

/// What an access knows about the access after it in program order.
#[derive(Debug, Clone, Copy)]
pub struct Successor {
    pub handle: AccessHandle,
    pub kind: AccessType,
    pub reduction: Option<ReductionOperatorId>,
}

/// Either the declared reduction length, or the shared reduction info once
/// the group has been formed. Never both.
#[derive(Debug, Clone)]
pub enum ReductionStorage {
    Length(u64),
    Info(Arc<ReductionInfo>),
}

#[derive(Debug, Clone)]
pub struct ReductionBinding {
    pub operator: ReductionOperatorId,
    pub storage: ReductionStorage,
}

/// Purpose of a runtime-created `NoAccess` sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkRole {
    /// Explicit taskwait inside the owner's body.
    Taskwait,
    /// End of the owner's body: finishing the sink finishes the owner's
    /// own access at `parent_access`.
    ChildrenFinished { parent_access: ArenaIndex },
    /// End of the owner's body for a region the owner never declared.
    Region,
}

/// Any object interested in satisfiability that reaches an access after it
/// was linked into a workflow (the data-link step of an offloaded task).
pub trait DataLinkSink: Send + Sync {
    fn link_region(
        &self,
        region: Region,
        location: Option<NodeId>,
        write_id: WriteId,
        read: bool,
        write: bool,
    );
}

/// Receiver of completed accesses of a task executed on behalf of another
/// node (the data-release step of that task's workflow).
pub trait DataReleaseSink: Send + Sync {
    fn release_region(&self, access: &AccessView);
}

/// Snapshot handed to release bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct AccessView {
    pub handle: AccessHandle,
    pub kind: AccessType,
    pub region: Region,
    pub flags: AccessFlags,
    pub location: Option<NodeId>,
    pub write_id: WriteId,
    /// Previous access on the same region in program order, if linked.
    pub predecessor: Option<AccessHandle>,
}

impl AccessView {
    pub fn has_next(&self) -> bool {
        self.flags.contains(AccessFlags::HAS_NEXT)
    }

    /// The successor runs on this node and was linked through the namespace.
    pub fn namespace_next(&self) -> bool {
        self.flags.contains(AccessFlags::NAMESPACE_NEXT)
    }

    pub fn read_satisfied(&self) -> bool {
        self.flags.contains(AccessFlags::READ_SATISFIED)
    }

    pub fn write_satisfied(&self) -> bool {
        self.flags.contains(AccessFlags::WRITE_SATISFIED)
    }

    pub fn complete(&self) -> bool {
        self.flags.contains(AccessFlags::COMPLETE)
    }

    pub fn released(&self) -> bool {
        self.flags.contains(AccessFlags::RELEASED)
    }

    /// Released by the originator and by every nested child.
    pub fn finished_with_children(&self) -> bool {
        self.released()
            && (!self.flags.contains(AccessFlags::HAS_CHILD)
                || self.flags.contains(AccessFlags::CHILDREN_FINISHED))
    }
}

/// One task's access to one region.
///
/// All mutation happens under the owning task's access lock. The flag word
/// is atomic so other threads can observe satisfiability without it.
pub struct DataAccess {
    pub(crate) handle: AccessHandle,
    pub(crate) kind: AccessType,
    pub(crate) region: Region,
    pub(crate) flags: AtomicU32,
    pub(crate) next: Option<Successor>,
    pub(crate) child: Option<Successor>,
    /// Task whose bottom map references this access; `None` for accesses of
    /// remote tasks, which live outside any bottom map.
    pub(crate) bottom_owner: Option<TaskId>,
    pub(crate) predecessor: Option<AccessHandle>,
    pub(crate) location: Option<NodeId>,
    pub(crate) write_id: WriteId,
    pub(crate) reduction: Option<ReductionBinding>,
    pub(crate) sink: Option<SinkRole>,
    pub(crate) data_link: Option<Arc<dyn DataLinkSink>>,
}

impl DataAccess {
    pub fn new(handle: AccessHandle, spec: &AccessSpec, bottom_owner: Option<TaskId>) -> Self {
        let mut flags = AccessFlags::NONE;
        if spec.weak {
            flags |= AccessFlags::WEAK | AccessFlags::SATISFIED_COUNTED;
        }
        let reduction = spec.reduction.map(|operator| ReductionBinding {
            operator,
            storage: ReductionStorage::Length(spec.region.len),
        });
        Self {
            handle,
            kind: spec.kind,
            region: spec.region,
            flags: AtomicU32::new(flags.bits()),
            next: None,
            child: None,
            bottom_owner,
            predecessor: None,
            location: None,
            write_id: WriteId::NONE,
            reduction,
            sink: None,
            data_link: None,
        }
    }

    /// Runtime-created sink, already released by its owner. Sinks never
    /// enter a bottom map.
    pub fn new_sink(handle: AccessHandle, region: Region, role: SinkRole) -> Self {
        let mut access = Self::new(handle, &AccessSpec::new(AccessType::NoAccess, region), None);
        access.sink = Some(role);
        access.flags = AtomicU32::new(AccessFlags::RELEASED.bits());
        access
    }

    pub fn handle(&self) -> AccessHandle {
        self.handle
    }

    pub fn kind(&self) -> AccessType {
        self.kind
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn flags(&self) -> AccessFlags {
        AccessFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn is_weak(&self) -> bool {
        self.flags().contains(AccessFlags::WEAK)
    }

    pub fn location(&self) -> Option<NodeId> {
        self.location
    }

    pub fn write_id(&self) -> WriteId {
        self.write_id
    }

    pub fn next(&self) -> Option<&Successor> {
        self.next.as_ref()
    }

    pub fn predecessor(&self) -> Option<AccessHandle> {
        self.predecessor
    }

    pub fn sink_role(&self) -> Option<SinkRole> {
        self.sink
    }

    pub fn reduction_operator(&self) -> Option<ReductionOperatorId> {
        self.reduction.as_ref().map(|binding| binding.operator)
    }

    pub fn reduction_info(&self) -> Option<&Arc<ReductionInfo>> {
        match &self.reduction {
            Some(ReductionBinding {
                storage: ReductionStorage::Info(info),
                ..
            }) => Some(info),
            _ => None,
        }
    }

    pub fn as_successor(&self) -> Successor {
        Successor {
            handle: self.handle,
            kind: self.kind,
            reduction: self.reduction_operator(),
        }
    }

    pub fn view(&self) -> AccessView {
        AccessView {
            handle: self.handle,
            kind: self.kind,
            region: self.region,
            flags: self.flags(),
            location: self.location,
            write_id: self.write_id,
            predecessor: self.predecessor,
        }
    }

    pub(crate) fn set_flags(&self, flags: AccessFlags) -> AccessFlags {
        AccessFlags(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    pub(crate) fn set_location(&mut self, location: Option<NodeId>, write_id: WriteId) {
        self.location = location;
        self.write_id = write_id;
    }

    /// Swap the declared length for the group's shared info.
    pub(crate) fn bind_reduction_info(&mut self, info: Arc<ReductionInfo>) {
        let binding = self
            .reduction
            .as_mut()
            .unwrap_or_else(|| panic!("access {:?} is not a reduction", self.handle));
        if let ReductionStorage::Length(len) = binding.storage {
            debug_assert_eq!(len, info.region().len, "reduction length mismatch");
        }
        info.register_participant();
        binding.storage = ReductionStorage::Info(info);
    }
}

impl fmt::Debug for DataAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAccess")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("region", &self.region)
            .field("flags", &self.flags())
            .field("next", &self.next.map(|s| s.handle))
            .field("child", &self.child.map(|s| s.handle))
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}
