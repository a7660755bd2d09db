use std::sync::Arc;

use taskweave::dependencies::{AccessSpec, AccessType, DependencySystem, ReductionOperatorId};
use taskweave::memory::NodeMemory;
use taskweave::region::Region;
use taskweave::tasks::{Task, TaskKind};
use taskweave_test_utils::{ListenerEvent, RecordingListener};

const X: Region = Region::new(0x100, 8);
const Y: Region = Region::new(0x200, 8);

fn system() -> (Arc<DependencySystem>, Arc<RecordingListener>) {
    let listener = RecordingListener::new();
    let memory = Arc::new(NodeMemory::new(0, 1));
    (DependencySystem::new(0, memory, 4, listener.clone()), listener)
}

fn spawn(
    system: &DependencySystem,
    parent: Option<&Arc<Task>>,
    label: &str,
    accesses: Vec<AccessSpec>,
) -> Arc<Task> {
    let kind = if parent.is_some() {
        TaskKind::User
    } else {
        TaskKind::Root
    };
    let task = Arc::new(Task::bare(
        system.new_task_id(),
        label,
        accesses,
        parent.cloned(),
        kind,
    ));
    system.register_task(&task);
    system.register_task_accesses(&task);
    system.finish_registration(&task);
    task
}

fn finish(system: &DependencySystem, task: &Arc<Task>) {
    system.unregister_task_accesses(task);
    system.finish_task(task);
}

fn access(kind: AccessType, region: Region) -> AccessSpec {
    AccessSpec::new(kind, region)
}

#[test]
fn readers_wait_for_the_writer_and_the_next_writer_waits_for_both() {
    let (system, listener) = system();
    let root = spawn(&system, None, "root", vec![]);
    let writer = spawn(&system, Some(&root), "w1", vec![access(AccessType::Write, X)]);
    let r1 = spawn(&system, Some(&root), "r1", vec![access(AccessType::Read, X)]);
    let r2 = spawn(&system, Some(&root), "r2", vec![access(AccessType::Read, X)]);
    let w2 = spawn(&system, Some(&root), "w2", vec![access(AccessType::Write, X)]);

    assert!(listener.is_ready(writer.id()));
    assert!(!listener.is_ready(r1.id()));

    finish(&system, &writer);
    assert!(listener.is_ready(r1.id()) && listener.is_ready(r2.id()));
    assert!(!listener.is_ready(w2.id()));

    finish(&system, &r1);
    assert!(!listener.is_ready(w2.id()), "one reader is still running");
    finish(&system, &r2);
    assert!(listener.is_ready(w2.id()));

    finish(&system, &w2);
    for task in [&writer, &r1, &r2, &w2] {
        assert!(listener.is_removable(task.id()), "{} not removed", task.id());
    }
}

#[test]
fn independent_regions_do_not_order_tasks() {
    let (system, listener) = system();
    let root = spawn(&system, None, "root", vec![]);
    let a = spawn(&system, Some(&root), "a", vec![access(AccessType::ReadWrite, X)]);
    let b = spawn(&system, Some(&root), "b", vec![access(AccessType::ReadWrite, Y)]);
    assert!(listener.is_ready(a.id()));
    assert!(listener.is_ready(b.id()));
}

#[test]
fn concurrent_group_runs_together_and_blocks_the_next_reader() {
    let (system, listener) = system();
    let root = spawn(&system, None, "root", vec![]);
    let c1 = spawn(&system, Some(&root), "c1", vec![access(AccessType::Concurrent, X)]);
    let c2 = spawn(&system, Some(&root), "c2", vec![access(AccessType::Concurrent, X)]);
    let reader = spawn(&system, Some(&root), "r", vec![access(AccessType::Read, X)]);

    assert!(listener.is_ready(c1.id()) && listener.is_ready(c2.id()));
    assert!(!listener.is_ready(reader.id()));
    finish(&system, &c2);
    assert!(!listener.is_ready(reader.id()));
    finish(&system, &c1);
    assert!(listener.is_ready(reader.id()));
}

#[test]
fn reduction_participants_are_ready_at_once() {
    let (system, listener) = system();
    let root = spawn(&system, None, "root", vec![]);
    let sum = ReductionOperatorId::SUM_I64;
    let tasks: Vec<_> = (0..4)
        .map(|i| {
            spawn(
                &system,
                Some(&root),
                &format!("red{i}"),
                vec![AccessSpec::reduction(X, sum)],
            )
        })
        .collect();
    for task in &tasks {
        assert!(listener.is_ready(task.id()), "{} not ready", task.id());
    }
}

#[test]
fn taskwait_completes_only_after_the_last_child() {
    let (system, listener) = system();
    let root = spawn(&system, None, "root", vec![]);
    let first = spawn(&system, Some(&root), "first", vec![access(AccessType::Write, X)]);
    let second = spawn(&system, Some(&root), "second", vec![access(AccessType::Read, X)]);

    system.taskwait(&root);
    assert!(root.in_taskwait());
    finish(&system, &first);
    assert!(root.in_taskwait());
    finish(&system, &second);
    assert!(!root.in_taskwait());
    assert!(
        listener
            .events()
            .contains(&ListenerEvent::TaskwaitCompleted(root.id()))
    );
}

#[test]
fn weak_parent_access_hands_satisfiability_to_its_child() {
    let (system, listener) = system();
    let root = spawn(&system, None, "root", vec![]);
    let writer = spawn(&system, Some(&root), "writer", vec![access(AccessType::Write, X)]);
    let parent = spawn(
        &system,
        Some(&root),
        "parent",
        vec![access(AccessType::ReadWrite, X).weak()],
    );
    assert!(listener.is_ready(parent.id()), "weak accesses never delay the body");

    let child = spawn(&system, Some(&parent), "child", vec![access(AccessType::Read, X)]);
    assert!(!listener.is_ready(child.id()));
    finish(&system, &writer);
    assert!(listener.is_ready(child.id()));

    finish(&system, &parent);
    assert!(!listener.is_removable(parent.id()), "the child is still live");
    finish(&system, &child);
    assert!(listener.is_removable(child.id()));
    assert!(listener.is_removable(parent.id()));
}
