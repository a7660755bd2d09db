// src/lib.rs

pub mod cli;
pub mod cluster;
pub mod config;
pub mod dependencies;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod memory;
pub mod region;
pub mod scheduler;
pub mod tasks;
pub mod types;
pub mod util;
pub mod workflow;
pub mod workloads;

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::config::RuntimeConfig;
use crate::config::loader::{CONFIG_OVERRIDE_ENV, load_with_overrides};
use crate::engine::LocalCluster;

pub use crate::engine::NodeRuntime;
pub use crate::region::Region;
pub use crate::tasks::{ImplementationTable, TaskContext, TaskSpec};

/// How often the leader task polls every node.
const LEADER_INTERVAL: Duration = Duration::from_millis(1);

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (file, `TASKWEAVE_CONFIG_OVERRIDE`, then CLI flags)
/// - the in-process cluster and its leader poller
/// - the workload, run as node 0's main program
/// - the shutdown handshake
pub async fn run(args: CliArgs) -> Result<()> {
    let config = load_config(&args)?;

    if args.dry_run {
        print_dry_run(&config);
        return Ok(());
    }

    let cluster = LocalCluster::launch(config, workloads::implementations())?;
    let leader = cluster.spawn_leader(LEADER_INTERVAL);

    // The main program blocks on taskwaits; keep it off the async workers.
    let workload = args.workload;
    let tasks = args.tasks;
    let summary = tokio::task::spawn_blocking(move || -> Result<workloads::Summary> {
        let summary = cluster.run_main(|ctx| workloads::run(ctx, workload, tasks));
        cluster.shutdown()?;
        summary
    })
    .await??;

    leader.await?;
    info!(%summary, "workload finished");
    println!("{summary}");
    Ok(())
}

fn load_config(args: &CliArgs) -> Result<RuntimeConfig> {
    let mut overrides: Vec<String> = std::env::var(CONFIG_OVERRIDE_ENV).ok().into_iter().collect();
    overrides.extend(args.config_overrides());
    let overrides = overrides.join(",");
    Ok(load_with_overrides(
        args.config.as_deref(),
        Some(overrides.as_str()),
    )?)
}

/// Print the effective configuration.
fn print_dry_run(config: &RuntimeConfig) {
    println!("taskweave dry-run");
    println!("  cluster.nodes = {}", config.cluster.nodes);
    println!(
        "  cluster.message_max_size = {}",
        config.cluster.message_max_size
    );
    println!("  cluster.disable_remote = {}", config.cluster.disable_remote);
    println!("  cluster.eager_send = {}", config.cluster.eager_send);
    println!(
        "  runtime.workers_per_node = {}",
        config.runtime.workers_per_node
    );
    println!(
        "  runtime.reduction_slots = {}",
        config.runtime.reduction_slots
    );
    println!("  runtime.idle_wait_us = {}", config.runtime.idle_wait_us);
    println!("  scheduler.policy = {}", config.scheduler.policy);

    debug!("dry-run complete (no execution)");
}
