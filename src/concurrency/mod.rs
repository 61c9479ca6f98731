//! Injected execution resources.
//!
//! The scheduler, the access thread and the timeout guard never touch threads
//! directly. They ask a [`Concurrency`] provider for executors and for the
//! current time, so the same code runs on OS threads ([`ThreadConcurrency`]),
//! inline and deterministic ([`ImmediateConcurrency`]) or on a tokio runtime
//! (`TokioConcurrency`, behind the `tokio-runtime` feature).

pub mod immediate;
pub mod threads;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::core::error::{panic_message, SchedulerError};

pub use immediate::ImmediateConcurrency;
pub use threads::ThreadConcurrency;

/// Argument-less unit of work run by an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion notification for an asynchronous shutdown.
pub type ShutdownCallback = Box<dyn FnOnce(Result<(), SchedulerError>) + Send + 'static>;

/// Execution resource that runs jobs and can be shut down asynchronously.
pub trait Executor: Send + Sync {
    /// Submit a job.
    ///
    /// # Errors
    ///
    /// Returns the job back if the executor no longer accepts work, so the
    /// caller can decide to run it inline instead.
    fn execute(&self, job: Job) -> Result<(), Job>;

    /// Stop accepting work, let queued jobs finish and report completion.
    ///
    /// Must not block the calling thread on the executor's own workers; it is
    /// legal to call this from inside a job running on this executor.
    fn shutdown(&self, on_done: ShutdownCallback);

    /// Whether shutdown has been requested.
    fn is_shut_down(&self) -> bool;

    /// Name used in diagnostics.
    fn name(&self) -> &str;
}

/// Factory for executors plus the clock used for timeout accounting.
pub trait Concurrency: Send + Sync {
    /// An executor running jobs one at a time in submission order.
    fn new_single_thread_executor(&self, name: &str) -> Arc<dyn Executor>;

    /// An executor running at most `max_parallel` jobs at once.
    fn new_parallel_executor(&self, max_parallel: usize, name: &str) -> Arc<dyn Executor>;

    /// Current instant according to this provider's clock.
    fn now(&self) -> Instant;
}

/// Run a job, containing any panic it raises.
///
/// Returns `false` if the job panicked.
pub(crate) fn run_job(job: Job, executor: &str) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(
                executor = executor,
                panic = %panic_message(payload.as_ref()),
                "job panicked; continuing"
            );
            false
        }
    }
}

/// Submit a job, running it inline if the executor rejects it.
pub(crate) fn execute_or_inline(executor: &dyn Executor, job: Job) {
    if let Err(job) = executor.execute(job) {
        tracing::debug!(executor = executor.name(), "executor rejected job; running inline");
        run_job(job, executor.name());
    }
}
