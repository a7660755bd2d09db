// src/workloads.rs

//! Demo workloads run by the binary on node 0.
//!
//! Each workload spawns `tasks` tasks, waits for them and checks the result
//! against the value it must produce. The summary carries a blake3 checksum
//! of the bytes the check read.

use std::fmt;

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::ValueEnum;
use tracing::info;

use crate::dependencies::ReductionOperatorId;
use crate::region::Region;
use crate::tasks::{ImplementationTable, TaskContext, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Every task increments the same counter, in order.
    Chain,
    /// Independent tasks fill a distributed array, one task sums it.
    Fanout,
    /// Every task contributes to one sum reduction.
    Reduction,
    /// Tasks pinned round-robin to every node update their own slot.
    Offload,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Workload::Chain => "chain",
            Workload::Fanout => "fanout",
            Workload::Reduction => "reduction",
            Workload::Offload => "offload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub workload: Workload,
    pub tasks: usize,
    pub value: i64,
    pub checksum: String,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks={} value={} checksum={}",
            self.workload, self.tasks, self.value, self.checksum
        )
    }
}

/// Task implementations every workload relies on.
pub fn implementations() -> ImplementationTable {
    ImplementationTable::new()
        .with("increment", |ctx| {
            let target = region_arg(ctx.args(), 0)?;
            let value = ctx.read_i64(target)?;
            ctx.write_i64(target, value + 1)?;
            Ok(())
        })
        .with("square", |ctx| {
            let target = region_arg(ctx.args(), 0)?;
            let index = u64_arg(ctx.args(), 2)? as i64;
            ctx.write_i64(target, index * index)?;
            Ok(())
        })
        .with("gather", |ctx| {
            let result = region_arg(ctx.args(), 0)?;
            let base = u64_arg(ctx.args(), 2)?;
            let count = u64_arg(ctx.args(), 3)?;
            let mut sum = 0i64;
            for index in 0..count {
                sum += ctx.read_i64(Region::new(base + index * 8, 8))?;
            }
            ctx.write_i64(result, sum)?;
            Ok(())
        })
        .with("contribute", |ctx| {
            let target = region_arg(ctx.args(), 0)?;
            let value = u64_arg(ctx.args(), 2)? as i64;
            ctx.contribute_i64(target, value)?;
            Ok(())
        })
}

/// Run `workload` from the body of node 0's main program.
pub fn run(ctx: &mut TaskContext<'_>, workload: Workload, tasks: usize) -> anyhow::Result<Summary> {
    info!(%workload, tasks, nodes = ctx.cluster_size(), "running workload");
    let n = tasks as i64;
    let (value, expected, bytes) = match workload {
        Workload::Chain => {
            let counter = ctx.lmalloc(8);
            for _ in 0..tasks {
                ctx.spawn(
                    TaskSpec::new("increment")
                        .args(encode(&[counter.start, counter.len]))
                        .read_write(counter),
                )?;
            }
            ctx.taskwait();
            let bytes = ctx.read(counter)?;
            (ctx.read_i64(counter)?, n, bytes)
        }
        Workload::Fanout => {
            let array = ctx.dmalloc(8 * tasks.max(1) as u64);
            let result = ctx.lmalloc(8);
            let mut gather = TaskSpec::new("gather")
                .args(encode(&[result.start, result.len, array.start, tasks as u64]))
                .write(result);
            for index in 0..tasks as u64 {
                let slot = Region::new(array.start + index * 8, 8);
                ctx.spawn(
                    TaskSpec::new("square")
                        .label(format!("square-{index}"))
                        .args(encode(&[slot.start, slot.len, index]))
                        .write(slot),
                )?;
                gather = gather.read(slot);
            }
            ctx.spawn(gather.on_node(0))?;
            ctx.taskwait();
            let bytes = ctx.read(result)?;
            let expected = (0..n).map(|i| i * i).sum();
            (ctx.read_i64(result)?, expected, bytes)
        }
        Workload::Reduction => {
            let sum = ctx.lmalloc(8);
            for index in 1..=tasks as u64 {
                ctx.spawn(
                    TaskSpec::new("contribute")
                        .args(encode(&[sum.start, sum.len, index]))
                        .reduction(sum, ReductionOperatorId::SUM_I64),
                )?;
            }
            ctx.taskwait();
            let bytes = ctx.read(sum)?;
            (ctx.read_i64(sum)?, n * (n + 1) / 2, bytes)
        }
        Workload::Offload => {
            let slots = ctx.lmalloc(8 * tasks.max(1) as u64);
            let nodes = ctx.cluster_size();
            for index in 0..tasks as u64 {
                let slot = Region::new(slots.start + index * 8, 8);
                for _ in 0..=index % 3 {
                    ctx.spawn(
                        TaskSpec::new("increment")
                            .label(format!("offload-{index}"))
                            .args(encode(&[slot.start, slot.len]))
                            .read_write(slot)
                            .on_node(index as usize % nodes),
                    )?;
                }
            }
            ctx.taskwait();
            let mut total = 0;
            let mut bytes = Vec::with_capacity(tasks * 8);
            for index in 0..tasks as u64 {
                let slot = Region::new(slots.start + index * 8, 8);
                total += ctx.read_i64(slot)?;
                bytes.extend(ctx.read(slot)?);
            }
            let expected = (0..n).map(|i| i % 3 + 1).sum();
            (total, expected, bytes)
        }
    };
    if value != expected {
        bail!("{workload} produced {value}, expected {expected}");
    }
    Ok(Summary {
        workload,
        tasks,
        value,
        checksum: blake3::hash(&bytes).to_hex().to_string(),
    })
}

fn encode(words: &[u64]) -> Bytes {
    words
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect::<Vec<u8>>()
        .into()
}

fn u64_arg(args: &Bytes, index: usize) -> anyhow::Result<u64> {
    let start = index * 8;
    let raw = args
        .get(start..start + 8)
        .with_context(|| format!("task argument {index} missing"))?;
    let mut word = [0u8; 8];
    word.copy_from_slice(raw);
    Ok(u64::from_le_bytes(word))
}

fn region_arg(args: &Bytes, index: usize) -> anyhow::Result<Region> {
    Ok(Region::new(u64_arg(args, index)?, u64_arg(args, index + 1)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_decode_in_order() {
        let args = encode(&[64, 8, 7]);
        assert_eq!(region_arg(&args, 0).unwrap(), Region::new(64, 8));
        assert_eq!(u64_arg(&args, 2).unwrap(), 7);
        assert!(u64_arg(&args, 3).is_err());
    }

    #[test]
    fn every_workload_has_its_implementations() {
        let table = implementations();
        for name in ["increment", "square", "gather", "contribute"] {
            assert!(table.contains(name), "{name} missing");
        }
    }
}
