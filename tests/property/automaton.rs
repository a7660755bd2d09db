use proptest::prelude::*;
use taskweave::dependencies::{AccessFlags, AccessHandle, AccessSpec, AccessType, DataAccess, UpdateOperation};
use taskweave::region::Region;
use taskweave::types::{TaskId, WriteId};
use taskweave::util::ArenaIndex;

#[derive(Debug, Clone)]
enum Step {
    Propagate {
        read: bool,
        write: bool,
        concurrent: bool,
        commutative: bool,
    },
    Release,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
            |(read, write, concurrent, commutative)| Step::Propagate {
                read,
                write,
                concurrent,
                commutative,
            }
        ),
        1 => Just(Step::Release),
    ]
}

fn kind_strategy() -> impl Strategy<Value = AccessType> {
    prop_oneof![
        Just(AccessType::Read),
        Just(AccessType::Write),
        Just(AccessType::ReadWrite),
        Just(AccessType::Concurrent),
        Just(AccessType::Commutative),
    ]
}

/// An access of a remote task: no bottom map, no successor.
fn remote_access(kind: AccessType, weak: bool) -> DataAccess {
    let mut spec = AccessSpec::new(kind, Region::new(0x1000, 64));
    if weak {
        spec = spec.weak();
    }
    DataAccess::new(
        AccessHandle {
            task: TaskId(1),
            index: ArenaIndex::new(0, 0),
        },
        &spec,
        None,
    )
}

proptest! {
    // Flags only ever gain bits, and readiness and completion are each
    // reported at most once, whatever order contributions arrive in.
    #[test]
    fn flags_are_monotonic_and_effects_fire_once(
        kind in kind_strategy(),
        weak in any::<bool>(),
        steps in proptest::collection::vec(step_strategy(), 1..24),
    ) {
        let mut access = remote_access(kind, weak);
        let handle = access.handle();
        let mut released = false;
        let mut schedules = 0;
        let mut completions = 0;

        for step in steps {
            let before = access.flags();
            let msg = match step {
                Step::Propagate { read, write, concurrent, commutative } => {
                    let mut op = UpdateOperation::new(handle);
                    op.make_read = read;
                    op.make_write = write;
                    op.make_concurrent = concurrent;
                    op.make_commutative = commutative;
                    op.location = Some(0);
                    op.write_id = WriteId(3);
                    access.apply_propagated(&op)
                }
                Step::Release if !released => {
                    released = true;
                    access.apply_single(AccessFlags::RELEASED, false)
                }
                Step::Release => continue,
            };
            let after = access.flags();
            prop_assert!(after.contains(before), "{before:?} lost bits, now {after:?}");
            prop_assert!(!msg.newly_set.intersects(before));
            schedules += usize::from(msg.schedule);
            completions += usize::from(msg.complete);
            if msg.complete {
                prop_assert!(after.contains(AccessFlags::READ_SATISFIED | AccessFlags::WRITE_SATISFIED));
                prop_assert!(after.contains(AccessFlags::RELEASED));
            }
        }

        prop_assert!(schedules <= 1);
        prop_assert!(completions <= 1);
        if weak {
            prop_assert_eq!(schedules, 0, "weak accesses are counted at creation");
        }
    }

    // Delivering the same satisfiability twice has no further effect.
    #[test]
    fn repeated_delivery_is_idempotent(
        kind in kind_strategy(),
        read in any::<bool>(),
        write in any::<bool>(),
    ) {
        let mut access = remote_access(kind, false);
        let mut op = UpdateOperation::new(access.handle());
        op.make_read = read;
        op.make_write = write;
        op.location = Some(1);
        let _ = access.apply_propagated(&op);
        let flags = access.flags();
        let again = access.apply_propagated(&op);
        prop_assert!(again.newly_set.is_empty());
        prop_assert!(!again.schedule);
        prop_assert!(!again.complete);
        prop_assert_eq!(access.flags(), flags);
    }
}
