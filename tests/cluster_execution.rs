mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use taskweave::dependencies::ReductionOperatorId;
use taskweave::engine::LocalCluster;
use taskweave::errors::TaskweaveError;
use taskweave::types::SchedulingPolicy;
use taskweave::workloads::{self, Workload};
use taskweave::TaskSpec;
use taskweave_test_utils::{ConfigBuilder, TaskSpecBuilder, init_tracing, wait_until};

use common::{handles, implementations, run_log};

#[test]
fn single_node_chain_runs_every_increment() {
    init_tracing();
    let log = run_log();
    let cluster =
        LocalCluster::launch(ConfigBuilder::new().workers(2).build(), implementations(log.clone(), handles()))
            .unwrap();

    let value = cluster
        .run_main(|ctx| {
            let counter = ctx.lmalloc(8);
            for i in 0..10 {
                ctx.spawn(
                    TaskSpecBuilder::new("increment")
                        .label(&format!("inc-{i}"))
                        .arg_region(counter)
                        .read_write(counter)
                        .build(),
                )?;
            }
            ctx.taskwait();
            Ok(ctx.read_i64(counter)?)
        })
        .unwrap();
    cluster.shutdown().unwrap();

    assert_eq!(value, 10);
    let labels: Vec<String> = log.lock().iter().map(|(label, _)| label.clone()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("inc-{i}")).collect();
    assert_eq!(labels, expected, "readwrite chain runs in submission order");
}

#[test]
fn pinned_tasks_run_remotely_and_taskwait_brings_the_data_back() {
    init_tracing();
    let log = run_log();
    let config = ConfigBuilder::new().nodes(2).workers(2).build();
    let cluster = LocalCluster::launch(config, implementations(log.clone(), handles())).unwrap();

    let value = cluster
        .run_main(|ctx| {
            let counter = ctx.lmalloc(8);
            ctx.write_i64(counter, 100)?;
            for i in 0..6 {
                ctx.spawn(
                    TaskSpecBuilder::new("increment")
                        .label(&format!("inc-{i}"))
                        .arg_region(counter)
                        .read_write(counter)
                        .on_node(i % 2)
                        .build(),
                )?;
            }
            ctx.taskwait();
            Ok(ctx.read_i64(counter)?)
        })
        .unwrap();
    cluster.shutdown().unwrap();

    assert_eq!(value, 106);
    let log = log.lock();
    assert_eq!(log.len(), 6);
    for (label, node) in log.iter() {
        let index: usize = label.trim_start_matches("inc-").parse().unwrap();
        assert_eq!(*node, index % 2, "{label} ran on the wrong node");
    }
}

#[test]
fn reduction_folds_every_contribution_over_the_original_value() {
    init_tracing();
    let config = ConfigBuilder::new().nodes(2).workers(3).reduction_slots(2).build();
    let cluster = LocalCluster::launch(config, implementations(run_log(), handles())).unwrap();

    let value = cluster
        .run_main(|ctx| {
            let sum = ctx.lmalloc(8);
            ctx.write_i64(sum, 1000)?;
            for i in 1..=20u64 {
                ctx.spawn(
                    TaskSpecBuilder::new("contribute")
                        .arg_region(sum)
                        .arg(i)
                        .reduction(sum, ReductionOperatorId::SUM_I64)
                        .build(),
                )?;
            }
            ctx.taskwait();
            Ok(ctx.read_i64(sum)?)
        })
        .unwrap();
    cluster.shutdown().unwrap();

    assert_eq!(value, 1000 + 210);
}

#[test]
fn every_demo_workload_checks_out_on_three_nodes() {
    init_tracing();
    for policy in [SchedulingPolicy::Locality, SchedulingPolicy::Random] {
        for workload in [
            Workload::Chain,
            Workload::Fanout,
            Workload::Reduction,
            Workload::Offload,
        ] {
            let config = ConfigBuilder::new().nodes(3).workers(2).policy(policy).build();
            let cluster = LocalCluster::launch(config, workloads::implementations()).unwrap();
            let summary = cluster
                .run_main(|ctx| workloads::run(ctx, workload, 12))
                .unwrap_or_else(|err| panic!("{workload} with {policy}: {err:#}"));
            cluster.shutdown().unwrap();
            assert_eq!(summary.workload, workload);
            assert_eq!(summary.checksum.len(), 64);
        }
    }
}

#[test]
fn small_message_size_splits_transfers_without_changing_results() {
    init_tracing();
    let config = ConfigBuilder::new().nodes(2).workers(2).message_max_size(3).build();
    let cluster = LocalCluster::launch(config, workloads::implementations()).unwrap();
    let summary = cluster
        .run_main(|ctx| workloads::run(ctx, Workload::Offload, 8))
        .unwrap();
    cluster.shutdown().unwrap();
    assert_eq!(summary.value, (0..8).map(|i| i % 3 + 1).sum::<i64>());
}

#[test]
fn blocked_task_resumes_when_unblocked() {
    init_tracing();
    let blocked = handles();
    let config = ConfigBuilder::new().workers(2).build();
    let cluster = LocalCluster::launch(config, implementations(run_log(), blocked.clone())).unwrap();

    let value = cluster
        .run_main(|ctx| {
            let slot = ctx.lmalloc(8);
            ctx.spawn(
                TaskSpecBuilder::new("blocker")
                    .arg_region(slot)
                    .arg(7)
                    .write(slot)
                    .build(),
            )?;
            wait_until("the blocker to park", || !blocked.lock().is_empty());
            assert_eq!(ctx.read_i64(slot)?, 0, "the body is parked before its write");
            let handle = blocked.lock()[0].clone();
            handle.unblock();
            ctx.taskwait();
            Ok(ctx.read_i64(slot)?)
        })
        .unwrap();
    cluster.shutdown().unwrap();
    assert_eq!(value, 7);
}

#[test]
fn spawned_function_fires_its_completion() {
    init_tracing();
    let cluster = LocalCluster::launch(
        ConfigBuilder::new().nodes(2).build(),
        implementations(run_log(), handles()),
    )
    .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        let completed = completed.clone();
        cluster.node(1).spawn_function(
            move || ran.store(true, Ordering::SeqCst),
            Some(Box::new(move || completed.store(true, Ordering::SeqCst))),
            "probe",
        );
    }
    wait_until("the completion callback", || completed.load(Ordering::SeqCst));
    assert!(ran.load(Ordering::SeqCst));
    cluster.shutdown().unwrap();
}

#[test]
fn unknown_implementation_is_rejected_at_spawn() {
    init_tracing();
    let cluster =
        LocalCluster::launch(ConfigBuilder::new().build(), implementations(run_log(), handles()))
            .unwrap();
    let result = cluster.run_main(|ctx| {
        let err = ctx.spawn(TaskSpec::new("does-not-exist")).unwrap_err();
        assert!(matches!(err, TaskweaveError::UnknownTask(ref name) if name == "does-not-exist"));
        Ok(())
    });
    cluster.shutdown().unwrap();
    result.unwrap();
}

#[test]
fn duplicate_region_is_rejected_at_spawn() {
    init_tracing();
    let cluster =
        LocalCluster::launch(ConfigBuilder::new().build(), implementations(run_log(), handles()))
            .unwrap();
    let result = cluster.run_main(|ctx| {
        let x = ctx.lmalloc(8);
        let spec = TaskSpec::new("increment").read(x).write(x);
        assert!(ctx.spawn(spec).is_err());
        Ok(())
    });
    cluster.shutdown().unwrap();
    result.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leader_polls_until_the_cluster_shuts_down() {
    init_tracing();
    taskweave_test_utils::with_timeout(async {
        let config = ConfigBuilder::new().nodes(2).workers(1).build();
        let cluster = LocalCluster::launch(config, workloads::implementations()).unwrap();
        let leader = cluster.spawn_leader(std::time::Duration::from_millis(1));
        let summary = tokio::task::spawn_blocking(move || {
            let summary = cluster
                .run_main(|ctx| workloads::run(ctx, Workload::Chain, 5))
                .unwrap();
            cluster.shutdown().unwrap();
            summary
        })
        .await
        .unwrap();
        leader.await.unwrap();
        assert_eq!(summary.value, 5);
    })
    .await;
}
