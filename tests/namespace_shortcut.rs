mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use taskweave::cluster::messages::MessageKind;
use taskweave::cluster::messenger::Messenger;
use taskweave::dependencies::AccessType;
use taskweave::engine::LocalCluster;
use taskweave_test_utils::{ConfigBuilder, FilteringMessenger, TaskSpecBuilder, init_tracing, wait_until};

use common::{handles, implementations, run_log};

/// Two tasks offloaded to the same node hand satisfiability to each other
/// there. Node 0 never gets a `SATISFIABILITY` message through, so the
/// second task can only complete through the remote namespace.
#[test]
fn successor_on_the_same_node_is_satisfied_without_the_offloader() {
    init_tracing();
    let blocked = handles();
    let filter: Arc<Mutex<Option<Arc<FilteringMessenger>>>> = Arc::new(Mutex::new(None));
    let config = ConfigBuilder::new().nodes(2).workers(2).build();
    let cluster = {
        let filter = filter.clone();
        LocalCluster::launch_with(
            config,
            implementations(run_log(), blocked.clone()),
            move |node, messenger| {
                if node != 0 {
                    return messenger;
                }
                let wrapped = FilteringMessenger::dropping(messenger, [MessageKind::Satisfiability]);
                *filter.lock() = Some(wrapped.clone());
                wrapped as Arc<dyn Messenger>
            },
        )
        .unwrap()
    };
    let remote = cluster.node(1).clone();

    let value = cluster
        .run_main(|ctx| {
            let x = ctx.lmalloc(8);
            let a = ctx.spawn(
                TaskSpecBuilder::new("spawner")
                    .label("a")
                    .arg_region(x)
                    .arg(42)
                    .weak(AccessType::ReadWrite, x)
                    .on_node(1)
                    .build(),
            )?;
            wait_until("the blocked child", || !blocked.lock().is_empty());
            assert!(remote.namespace().is_live(0, a.0));

            ctx.spawn(
                TaskSpecBuilder::new("noop")
                    .label("b")
                    .weak(AccessType::Read, x)
                    .on_node(1)
                    .build(),
            )?;
            wait_until("b on node 1", || remote.namespace().live_count() == 2);

            let handle = blocked.lock()[0].clone();
            handle.unblock();
            ctx.taskwait();
            Ok(ctx.read_i64(x)?)
        })
        .unwrap();

    let filter = filter.lock().clone().unwrap();
    cluster.shutdown().unwrap();

    assert_eq!(value, 42);
    assert!(filter.count(MessageKind::TaskNew) >= 2);
    // Node 1 never reported a's release of x; node 0 released it on
    // TASK_FINISHED and b's data link forwarded x then. Every such message
    // was dropped, so node 1 satisfied b on its own.
    assert!(
        filter.count(MessageKind::Satisfiability) >= 1,
        "sent: {:?}",
        filter.sent()
    );
}
