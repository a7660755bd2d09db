// src/dependencies/automaton.rs

//! Per-kind transition rules of [`DataAccess`].
//!
//! Every entry point sets some flags and then calls `advance`, which
//! derives what must happen next: readiness of the originator, operations
//! for the next and child accesses, detaching from the bottom map,
//! completion and reduction combination. `advance` records everything it
//! emits with a `*_SENT` bit, so each effect is produced at most once no
//! matter how often or in which order contributions arrive.

use crate::dependencies::access::{AccessFlags, AccessType, DataAccess};
use crate::dependencies::batch::{DependencyBatch, PendingCombination, PendingLink};
use crate::dependencies::update::{DelayedOperation, UpdateOperation};

/// Effects of one transition, routed by [`DataAccess::apply`].
#[derive(Debug, Default)]
pub struct DataAccessMessage {
    pub to_next: Option<UpdateOperation>,
    pub to_child: Option<UpdateOperation>,
    /// The access just became eligible; the originator counts it once.
    pub schedule: bool,
    /// The access just became complete and may be discarded with its task.
    pub complete: bool,
    /// The reduction group ends here; `to_next` waits for the combination.
    pub combine: bool,
    pub detach: bool,
    pub newly_set: AccessFlags,
}

const R: AccessFlags = AccessFlags::READ_SATISFIED;
const W: AccessFlags = AccessFlags::WRITE_SATISFIED;
const C: AccessFlags = AccessFlags::CONCURRENT_SATISFIED;
const M: AccessFlags = AccessFlags::COMMUTATIVE_SATISFIED;

/// Whether an access of `kind` with `flags` may run.
pub fn eligible(kind: AccessType, flags: AccessFlags) -> bool {
    let rw = flags.contains(R | W);
    match kind {
        AccessType::Read => flags.contains(R),
        AccessType::Write | AccessType::ReadWrite | AccessType::NoAccess => rw,
        AccessType::Concurrent => rw || flags.contains(C),
        AccessType::Commutative => rw || flags.contains(M),
        AccessType::Reduction => flags.contains(AccessFlags::HAS_REDUCTION_INFO),
    }
}

/// Released by the originator and, if it had children, by all of them.
fn done(flags: AccessFlags) -> bool {
    flags.contains(AccessFlags::RELEASED)
        && (!flags.contains(AccessFlags::HAS_CHILD)
            || flags.contains(AccessFlags::CHILDREN_FINISHED))
}

/// (read, write) satisfiability the access may hand to its next access.
fn forwardable(kind: AccessType, flags: AccessFlags) -> (bool, bool) {
    let read = flags.contains(R);
    let write = flags.contains(W);
    let done = done(flags);
    match kind {
        AccessType::Read => (read, read && write && done),
        AccessType::NoAccess => (read, write),
        AccessType::Write | AccessType::ReadWrite => (read && done, write && done),
        AccessType::Concurrent | AccessType::Commutative | AccessType::Reduction => {
            let all = read && write && done;
            (all, all)
        }
    }
}

impl DataAccess {
    /// Apply flags that the access cannot have yet (registration, release,
    /// children finished). Setting an already-set flag is a broken
    /// invariant.
    pub fn apply_single(&mut self, flags: AccessFlags, to_next_only: bool) -> DataAccessMessage {
        let current = self.flags();
        assert!(
            !current.intersects(flags),
            "access {:?}: {:?} already set in {:?}",
            self.handle,
            flags,
            current
        );
        let mut add = flags;
        if to_next_only {
            add |= AccessFlags::NO_GROUP_FANOUT;
        }
        self.set_flags(add);
        self.advance(flags)
    }

    /// Merge an operation coming from another access or from another node.
    ///
    /// Bits that are already set are ignored, so duplicate deliveries (for
    /// instance through both the offloader and a same-node namespace) have
    /// no further effect.
    pub fn apply_propagated(&mut self, op: &UpdateOperation) -> DataAccessMessage {
        debug_assert_eq!(op.target, self.handle);
        let current = self.flags();
        let fresh = op.flags().without(current);

        // Group members learn where the data is from the group bit until
        // real read satisfiability arrives.
        // A location pinned by a remote release is newer than any predecessor's.
        let pinned = current.contains(AccessFlags::LOCATION_PINNED);
        if !pinned && (fresh.contains(R) || (fresh.intersects(C | M) && !current.contains(R))) {
            self.location = op.location;
            self.write_id = op.write_id;
        }

        let mut add = fresh;
        if let Some(info) = &op.set_reduction_info {
            if !current.contains(AccessFlags::HAS_REDUCTION_INFO) {
                self.bind_reduction_info(info.clone());
                add |= AccessFlags::HAS_REDUCTION_INFO;
            }
        }
        if op.to_next_only && fresh.intersects(C | M) {
            self.set_flags(AccessFlags::NO_GROUP_FANOUT);
        }
        self.set_flags(add);
        self.advance(add)
    }

    /// Re-evaluate after a structural change (a next access was linked or the
    /// bottom map let go of this access).
    pub fn reevaluate(&mut self) -> DataAccessMessage {
        self.advance(AccessFlags::NONE)
    }

    fn advance(&mut self, newly_set: AccessFlags) -> DataAccessMessage {
        let mut msg = DataAccessMessage {
            newly_set,
            ..DataAccessMessage::default()
        };
        let flags = self.flags();
        let kind = self.kind;
        let can_run = eligible(kind, flags);

        if can_run && !flags.contains(AccessFlags::SATISFIED_COUNTED) {
            self.set_flags(AccessFlags::SATISFIED_COUNTED);
            msg.schedule = true;
        }

        if let Some(next) = self.next {
            let mut op = UpdateOperation::new(next.handle);
            let (send_read, send_write) = forwardable(kind, flags);
            if send_read && !flags.contains(AccessFlags::NEXT_READ_SENT) {
                self.set_flags(AccessFlags::NEXT_READ_SENT);
                op.make_read = true;
            }
            if send_write && !flags.contains(AccessFlags::NEXT_WRITE_SENT) {
                self.set_flags(AccessFlags::NEXT_WRITE_SENT);
                op.make_write = true;
            }
            if op.make_read || op.make_write {
                op.location = self.location;
                op.write_id = self.write_id;
            }

            let fanout =
                can_run && next.kind == kind && !flags.contains(AccessFlags::NO_GROUP_FANOUT);
            match kind {
                AccessType::Concurrent
                    if fanout && !flags.contains(AccessFlags::NEXT_CONCURRENT_SENT) =>
                {
                    self.set_flags(AccessFlags::NEXT_CONCURRENT_SENT);
                    op.make_concurrent = true;
                }
                AccessType::Commutative
                    if fanout && !flags.contains(AccessFlags::NEXT_COMMUTATIVE_SENT) =>
                {
                    self.set_flags(AccessFlags::NEXT_COMMUTATIVE_SENT);
                    op.make_commutative = true;
                }
                _ => {}
            }
            if (op.make_concurrent || op.make_commutative) && !op.make_read {
                op.location = self.location;
                op.write_id = self.write_id;
            }

            if kind == AccessType::Reduction {
                let same_group = next.kind == AccessType::Reduction
                    && next.reduction.is_some()
                    && next.reduction == self.reduction_operator();
                if same_group
                    && flags.contains(AccessFlags::HAS_REDUCTION_INFO)
                    && !flags.contains(AccessFlags::NEXT_REDUCTION_SENT)
                {
                    self.set_flags(AccessFlags::NEXT_REDUCTION_SENT);
                    op.set_reduction_info = self.reduction_info().cloned();
                }
                if !same_group
                    && (op.make_read || op.make_write)
                    && !flags.contains(AccessFlags::REDUCTION_COMBINED)
                {
                    self.set_flags(AccessFlags::REDUCTION_COMBINED);
                    msg.combine = true;
                }
            }

            if !op.is_empty() {
                msg.to_next = Some(op);
            }
        }

        if let Some(child) = self.child {
            let mut op = UpdateOperation::new(child.handle);
            if flags.contains(R) && !flags.contains(AccessFlags::CHILD_READ_SENT) {
                self.set_flags(AccessFlags::CHILD_READ_SENT);
                op.make_read = true;
            }
            if flags.contains(W) && !flags.contains(AccessFlags::CHILD_WRITE_SENT) {
                self.set_flags(AccessFlags::CHILD_WRITE_SENT);
                op.make_write = true;
            }
            if op.make_read || op.make_write {
                op.location = self.location;
                op.write_id = self.write_id;
            }
            if can_run && child.kind == kind {
                match kind {
                    AccessType::Concurrent
                        if !flags.contains(AccessFlags::CHILD_CONCURRENT_SENT) =>
                    {
                        self.set_flags(AccessFlags::CHILD_CONCURRENT_SENT);
                        op.make_concurrent = true;
                        op.to_next_only = flags.contains(AccessFlags::WEAK);
                    }
                    AccessType::Commutative
                        if !flags.contains(AccessFlags::CHILD_COMMUTATIVE_SENT) =>
                    {
                        self.set_flags(AccessFlags::CHILD_COMMUTATIVE_SENT);
                        op.make_commutative = true;
                        op.to_next_only = flags.contains(AccessFlags::WEAK);
                    }
                    _ => {}
                }
                if !op.make_read {
                    op.location = self.location;
                    op.write_id = self.write_id;
                }
            }
            if !op.is_empty() {
                msg.to_child = Some(op);
            }
        }

        let flags = self.flags();
        let satisfied = flags.contains(R | W);

        // Reductions stay in the bottom map until a successor (at worst an
        // end-of-task sink) is linked, which is where the group combines.
        if self.bottom_owner.is_some()
            && self.next.is_none()
            && kind != AccessType::Reduction
            && satisfied
            && done(flags)
            && !flags.contains(AccessFlags::DETACH_REQUESTED)
        {
            self.set_flags(AccessFlags::DETACH_REQUESTED);
            msg.detach = true;
        }

        let next_settled = match self.next {
            Some(_) => flags.contains(AccessFlags::NEXT_READ_SENT | AccessFlags::NEXT_WRITE_SENT),
            None => self.bottom_owner.is_none() || flags.contains(AccessFlags::DETACHED),
        };
        if satisfied && done(flags) && next_settled && !flags.contains(AccessFlags::COMPLETE) {
            self.set_flags(AccessFlags::COMPLETE);
            msg.complete = true;
        }

        msg
    }

    /// Route the operations of `msg` that concern other accesses into the
    /// batch. Task-level effects (`schedule`, `complete`) are left to the
    /// caller, which knows the originator.
    pub fn apply(&self, msg: &mut DataAccessMessage, batch: &mut DependencyBatch) {
        if let Some(op) = msg.to_child.take() {
            batch.push(DelayedOperation::Update(op));
        }

        let to_next = msg.to_next.take();
        if msg.combine {
            match self.reduction_info() {
                Some(info) => batch.combinations.push(PendingCombination {
                    info: info.clone(),
                    location: self.location,
                    write_id: self.write_id,
                    deferred: to_next,
                }),
                None => unreachable!("reduction {:?} finished without info", self.handle),
            }
        } else if let Some(op) = to_next {
            batch.push(DelayedOperation::Update(op));
        }

        if msg.detach {
            if let Some(owner) = self.bottom_owner {
                batch.push(DelayedOperation::Detach {
                    owner,
                    access: self.handle,
                    region: self.region,
                    location: self.location,
                    write_id: self.write_id,
                });
            }
        }

        if let Some(sink) = &self.data_link {
            let read = msg.newly_set.contains(R);
            let write = msg.newly_set.contains(W);
            if read || write {
                batch.pending_links.push(PendingLink {
                    sink: sink.clone(),
                    region: self.region,
                    location: self.location,
                    write_id: self.write_id,
                    read,
                    write,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::access::{AccessHandle, AccessSpec, Successor};
    use crate::region::Region;
    use crate::types::{TaskId, WriteId};
    use crate::util::ArenaIndex;

    fn access(task: u64, kind: AccessType) -> DataAccess {
        let handle = AccessHandle {
            task: TaskId(task),
            index: ArenaIndex::new(0, 0),
        };
        DataAccess::new(handle, &AccessSpec::new(kind, Region::new(0, 64)), Some(TaskId(0)))
    }

    fn link(from: &mut DataAccess, to: &DataAccess) {
        from.next = Some(to.as_successor());
        from.set_flags(AccessFlags::HAS_NEXT);
    }

    #[test]
    fn read_becomes_eligible_with_read_satisfiability_only() {
        let mut read = access(1, AccessType::Read);
        let msg = read.apply_single(R, false);
        assert!(msg.schedule);
        let msg = read.apply_single(W, false);
        assert!(!msg.schedule, "readiness is counted once");
    }

    #[test]
    fn writer_forwards_only_after_release() {
        let mut writer = access(1, AccessType::Write);
        let reader = access(2, AccessType::Read);
        link(&mut writer, &reader);

        let mut op = UpdateOperation::new(writer.handle());
        op.make_read = true;
        op.make_write = true;
        op.location = Some(0);
        op.write_id = WriteId(5);
        let msg = writer.apply_propagated(&op);
        assert!(msg.schedule);
        assert!(msg.to_next.is_none());

        let msg = writer.apply_single(AccessFlags::RELEASED, false);
        let forwarded = msg.to_next.expect("release forwards satisfiability");
        assert!(forwarded.make_read && forwarded.make_write);
        assert_eq!(forwarded.location, Some(0));
        assert_eq!(forwarded.write_id, WriteId(5));
        assert!(msg.complete);
    }

    #[test]
    fn duplicate_propagation_is_ignored() {
        let mut read = access(1, AccessType::Read);
        let mut op = UpdateOperation::new(read.handle());
        op.make_read = true;
        op.location = Some(1);
        let first = read.apply_propagated(&op);
        assert!(first.schedule);
        let second = read.apply_propagated(&op);
        assert!(!second.schedule);
        assert!(second.newly_set.is_empty());
    }

    #[test]
    fn concurrent_fans_out_before_completion() {
        let mut first = access(1, AccessType::Concurrent);
        let second = access(2, AccessType::Concurrent);
        link(&mut first, &second);
        let msg = first.apply_single(R | W, false);
        let op = msg.to_next.expect("fan-out");
        assert!(op.make_concurrent);
        assert!(!op.make_read && !op.make_write);
    }

    #[test]
    fn to_next_only_stops_group_fanout() {
        let mut middle = access(1, AccessType::Concurrent);
        let last = access(2, AccessType::Concurrent);
        link(&mut middle, &last);
        let mut op = UpdateOperation::new(middle.handle());
        op.make_concurrent = true;
        op.to_next_only = true;
        let msg = middle.apply_propagated(&op);
        assert!(msg.schedule);
        assert!(msg.to_next.is_none());
    }

    #[test]
    fn lone_finished_access_requests_detach_then_completes() {
        let mut writer = access(1, AccessType::ReadWrite);
        let msg = writer.apply_single(R | W | AccessFlags::RELEASED, false);
        assert!(msg.detach);
        assert!(!msg.complete);
        writer.set_flags(AccessFlags::DETACHED);
        let msg = writer.reevaluate();
        assert!(msg.complete);
        assert!(!msg.detach);
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn apply_single_rejects_set_flags() {
        let mut read = access(1, AccessType::Read);
        read.apply_single(AccessFlags::RELEASED, false);
        read.apply_single(AccessFlags::RELEASED, false);
    }

    #[test]
    fn successor_kind_is_visible_for_group_decisions() {
        let first = access(1, AccessType::Commutative);
        let succ: Successor = first.as_successor();
        assert_eq!(succ.kind, AccessType::Commutative);
        assert!(succ.reduction.is_none());
    }
}
