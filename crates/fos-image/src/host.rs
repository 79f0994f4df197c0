//! Owner Thread Loop
//!
//! Single-threaded executor the image pipeline posts its deferred work to.

use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use smol::LocalExecutor;

/// Task queue of the owner thread
#[derive(Clone)]
pub struct OwnerLoop {
    executor: Rc<LocalExecutor<'static>>,
}

impl OwnerLoop {
    pub fn new() -> Self {
        Self {
            executor: Rc::new(LocalExecutor::new()),
        }
    }

    /// Run `task` on a later turn of the loop
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.executor.spawn(async move { task() }).detach();
    }

    /// Run a long-lived future on the owner thread
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.executor.spawn(future).detach();
    }

    /// Run a single ready task
    pub fn run_once(&self) -> bool {
        self.executor.try_tick()
    }

    /// Run every task that is ready, including tasks they post
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.executor.try_tick() {
            ran += 1;
        }
        ran
    }

    /// Keep running tasks until `done` holds or `timeout` passes
    ///
    /// Used when completion depends on work from another thread.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for OwnerLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OwnerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerLoop")
            .field("idle", &self.executor.is_empty())
            .finish()
    }
}
