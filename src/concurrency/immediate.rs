//! Inline, deterministic concurrency provider.
//!
//! Every job runs on the thread that submits it and shutdown completes
//! immediately. Paired with a [`ManualClock`] this makes timeout behavior
//! reproducible without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::{run_job, Concurrency, Executor, Job, ShutdownCallback};
use crate::util::clock::{Clock, ManualClock, SystemClock};

/// Provider whose executors run jobs inline.
#[derive(Clone)]
pub struct ImmediateConcurrency {
    clock: Arc<dyn Clock>,
}

impl Default for ImmediateConcurrency {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmediateConcurrency {
    /// Inline provider on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    /// Inline provider on a manually advanced clock.
    #[must_use]
    pub fn with_manual_clock(clock: ManualClock) -> Self {
        Self {
            clock: Arc::new(clock),
        }
    }
}

impl Concurrency for ImmediateConcurrency {
    fn new_single_thread_executor(&self, name: &str) -> Arc<dyn Executor> {
        Arc::new(ImmediateExecutor::new(name))
    }

    fn new_parallel_executor(&self, _max_parallel: usize, name: &str) -> Arc<dyn Executor> {
        Arc::new(ImmediateExecutor::new(name))
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

/// Executor that runs each job on the submitting thread.
#[derive(Debug)]
pub struct ImmediateExecutor {
    name: String,
    shut_down: AtomicBool,
}

impl ImmediateExecutor {
    /// Create a named inline executor.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shut_down: AtomicBool::new(false),
        }
    }
}

impl Executor for ImmediateExecutor {
    fn execute(&self, job: Job) -> Result<(), Job> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(job);
        }
        run_job(job, &self.name);
        Ok(())
    }

    fn shutdown(&self, on_done: ShutdownCallback) {
        self.shut_down.store(true, Ordering::Release);
        on_done(Ok(()));
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
