#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use taskweave::tasks::{BlockingHandle, ImplementationTable};
use taskweave::types::NodeId;
use taskweave_test_utils::builders::{region_word, word};

/// Who ran what, in order.
pub type RunLog = Arc<Mutex<Vec<(String, NodeId)>>>;

pub fn run_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Implementations used across the cluster tests.
///
/// Argument words:
/// - `noop`: nothing
/// - `increment`: target region
/// - `store`: target region, value
/// - `contribute`: target region, value
/// - `blocker`: target region, value (stored after the task is unblocked)
/// - `spawner`: target region, value (spawns a `blocker` child on its own node)
pub fn implementations(log: RunLog, handles: Arc<Mutex<Vec<BlockingHandle>>>) -> ImplementationTable {
    let increment_log = log.clone();
    let store_log = log;
    ImplementationTable::new()
        .with("increment", move |ctx| {
            let target = region_word(ctx.args(), 0);
            let value = ctx.read_i64(target)?;
            ctx.write_i64(target, value + 1)?;
            increment_log.lock().push((ctx.label().to_string(), ctx.node()));
            Ok(())
        })
        .with("store", move |ctx| {
            let target = region_word(ctx.args(), 0);
            ctx.write_i64(target, word(ctx.args(), 2) as i64)?;
            store_log.lock().push((ctx.label().to_string(), ctx.node()));
            Ok(())
        })
        .with("noop", |_| Ok(()))
        .with("contribute", |ctx| {
            let target = region_word(ctx.args(), 0);
            ctx.contribute_i64(target, word(ctx.args(), 2) as i64)?;
            Ok(())
        })
        .with("blocker", move |ctx| {
            handles.lock().push(ctx.blocking_handle());
            ctx.block_current();
            let target = region_word(ctx.args(), 0);
            ctx.write_i64(target, word(ctx.args(), 2) as i64)?;
            Ok(())
        })
        .with("spawner", |ctx| {
            let target = region_word(ctx.args(), 0);
            let spec = taskweave::TaskSpec::new("blocker")
                .label("blocked-child")
                .args(ctx.args().clone())
                .read_write(target)
                .on_node(ctx.node());
            ctx.spawn(spec)?;
            Ok(())
        })
}

pub fn handles() -> Arc<Mutex<Vec<BlockingHandle>>> {
    Arc::new(Mutex::new(Vec::new()))
}
