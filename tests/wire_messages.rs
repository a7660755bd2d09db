mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use taskweave::cluster::messages::{Message, MessageKind};
use taskweave::cluster::messenger::Messenger;
use taskweave::engine::LocalCluster;
use taskweave::errors::TaskweaveError;
use taskweave_test_utils::{ConfigBuilder, FilteringMessenger, TaskSpecBuilder, init_tracing, wait_until};

use common::{handles, implementations, run_log};

type Recorders = Arc<Mutex<Vec<Arc<FilteringMessenger>>>>;

fn recorded_cluster(nodes: usize) -> (LocalCluster, Recorders) {
    let recorders: Recorders = Arc::new(Mutex::new(Vec::new()));
    let config = ConfigBuilder::new().nodes(nodes).workers(2).build();
    let cluster = {
        let recorders = recorders.clone();
        LocalCluster::launch_with(config, implementations(run_log(), handles()), move |_, messenger| {
            let recorder = FilteringMessenger::new(messenger);
            recorders.lock().push(recorder.clone());
            recorder as Arc<dyn Messenger>
        })
        .unwrap()
    };
    (cluster, recorders)
}

#[test]
fn allocations_reach_every_directory_and_leave_it_again() {
    init_tracing();
    let (cluster, recorders) = recorded_cluster(3);
    let nodes: Vec<_> = cluster.nodes().to_vec();

    cluster
        .run_main(|ctx| {
            let region = ctx.dmalloc(96);
            wait_until("DMALLOC everywhere", || {
                nodes.iter().all(|n| n.memory().directory.lookup(region).is_some())
            });
            let homes: Vec<_> = (0..3)
                .map(|i| {
                    let block = taskweave::Region::new(region.start + i * 32, 32);
                    nodes[1].memory().directory.home(block)
                })
                .collect();
            assert_eq!(homes, vec![Some(0), Some(1), Some(2)]);

            ctx.dfree(region)?;
            wait_until("DFREE everywhere", || {
                nodes.iter().all(|n| n.memory().directory.lookup(region).is_none())
            });
            Ok(())
        })
        .unwrap();
    cluster.shutdown().unwrap();

    let master = recorders.lock()[0].clone();
    assert_eq!(master.count(MessageKind::Dmalloc), 2);
    assert_eq!(master.count(MessageKind::Dfree), 2);
    assert_eq!(master.count(MessageKind::SysFinish), 2);
}

#[test]
fn offloaded_task_produces_the_protocol_messages() {
    init_tracing();
    let (cluster, recorders) = recorded_cluster(2);

    let value = cluster
        .run_main(|ctx| {
            let x = ctx.lmalloc(8);
            ctx.spawn(
                TaskSpecBuilder::new("store")
                    .arg_region(x)
                    .arg(9)
                    .write(x)
                    .on_node(1)
                    .build(),
            )?;
            ctx.taskwait();
            Ok(ctx.read_i64(x)?)
        })
        .unwrap();
    cluster.shutdown().unwrap();
    assert_eq!(value, 9);

    let recorders = recorders.lock();
    let (master, remote) = (&recorders[0], &recorders[1]);
    assert_eq!(master.count(MessageKind::TaskNew), 1);
    assert_eq!(remote.count(MessageKind::TaskFinished), 1);
    assert_eq!(remote.count(MessageKind::ReleaseAccess), 1);
    assert!(remote.sent().iter().all(|(_, target)| *target == 0));
}

#[test]
fn garbage_bytes_are_rejected_without_panicking() {
    let inputs: [&[u8]; 4] = [
        b"",
        b"\x57\x54",
        b"\x57\x54\x09\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00",
        b"\x00\x00\x07\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00",
    ];
    for input in inputs {
        let result = Message::decode(bytes::Bytes::copy_from_slice(input));
        assert!(
            matches!(result, Err(TaskweaveError::Codec(_))),
            "{input:?} decoded to {result:?}"
        );
    }
}
