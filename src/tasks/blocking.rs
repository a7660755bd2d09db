// src/tasks/blocking.rs

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::TaskId;

/// Unblock tokens of one task. An unblock that arrives before the block is
/// kept and consumed by the next block.
#[derive(Debug)]
pub(crate) struct BlockingState {
    task: TaskId,
    tokens: Mutex<usize>,
    wake: Condvar,
}

impl BlockingState {
    pub(crate) fn new(task: TaskId) -> Self {
        Self {
            task,
            tokens: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    /// Park the calling worker until an unblock token is available.
    pub(crate) fn block(&self) {
        let mut tokens = self.tokens.lock();
        debug!(task = %self.task, "task blocked");
        while *tokens == 0 {
            self.wake.wait(&mut tokens);
        }
        *tokens -= 1;
        debug!(task = %self.task, "task resumed");
    }

    fn unblock(&self) {
        let mut tokens = self.tokens.lock();
        *tokens += 1;
        debug!(task = %self.task, "task unblocked");
        self.wake.notify_one();
    }
}

/// Handle that resumes a task parked in
/// [`TaskContext::block_current`](crate::tasks::TaskContext::block_current).
#[derive(Debug, Clone)]
pub struct BlockingHandle {
    pub(crate) state: Arc<BlockingState>,
}

impl BlockingHandle {
    pub fn task(&self) -> TaskId {
        self.state.task
    }

    pub fn unblock(&self) {
        self.state.unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn early_unblock_is_not_lost() {
        let handle = BlockingHandle {
            state: Arc::new(BlockingState::new(TaskId(1))),
        };
        handle.unblock();
        handle.state.block();
    }

    #[test]
    fn block_waits_for_another_thread() {
        let handle = BlockingHandle {
            state: Arc::new(BlockingState::new(TaskId(2))),
        };
        let remote = handle.clone();
        let waker = thread::spawn(move || remote.unblock());
        handle.state.block();
        waker.join().unwrap();
        assert_eq!(handle.task(), TaskId(2));
    }
}
