// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::types::SchedulingPolicy;
use crate::workloads::Workload;

/// Command-line arguments for `taskweave`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskweave",
    version,
    about = "Run a demo workload on an in-process task-offloading cluster.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Without one, every setting takes its default.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of nodes; overrides `[cluster].nodes`.
    #[arg(long, value_name = "N")]
    pub nodes: Option<usize>,

    /// Scheduling policy (locality, random, local); overrides
    /// `[scheduler].policy`.
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<SchedulingPolicy>,

    /// Workload to run on node 0.
    #[arg(long, value_enum, default_value_t = Workload::Chain)]
    pub workload: Workload,

    /// Number of tasks the workload spawns.
    #[arg(long, value_name = "N", default_value_t = 16)]
    pub tasks: usize,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKWEAVE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    /// Command-line settings as `section.key=value` overrides.
    pub fn config_overrides(&self) -> Vec<String> {
        let mut overrides = Vec::new();
        if let Some(nodes) = self.nodes {
            overrides.push(format!("cluster.nodes={nodes}"));
        }
        if let Some(policy) = self.policy {
            overrides.push(format!("scheduler.policy=\"{policy}\""));
        }
        overrides
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_the_chain_workload() {
        let args = CliArgs::try_parse_from(["taskweave"]).unwrap();
        assert_eq!(args.workload, Workload::Chain);
        assert_eq!(args.tasks, 16);
        assert!(args.config.is_none());
        assert!(args.config_overrides().is_empty());
    }

    #[test]
    fn nodes_and_policy_become_overrides() {
        let args = CliArgs::try_parse_from([
            "taskweave",
            "--nodes",
            "3",
            "--policy",
            "random",
            "--workload",
            "fanout",
        ])
        .unwrap();
        assert_eq!(args.workload, Workload::Fanout);
        assert_eq!(
            args.config_overrides(),
            vec![
                "cluster.nodes=3".to_string(),
                "scheduler.policy=\"random\"".to_string()
            ]
        );
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(CliArgs::try_parse_from(["taskweave", "--policy", "fastest"]).is_err());
    }
}
