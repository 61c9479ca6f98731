//! Native provider using dedicated OS threads.
//!
//! Each executor owns a crossbeam channel and a lazily grown set of worker
//! threads, capped at the executor's parallelism.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on channel recv
//! - **Clean shutdown**: dropping the sender unblocks workers once the queue is drained
//! - **No self-join**: joining happens on a helper thread, so shutdown may be
//!   requested from inside one of the executor's own jobs

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{run_job, Concurrency, Executor, Job, ShutdownCallback};
use crate::core::error::SchedulerError;
use crate::util::clock::{Clock, SystemClock};

/// Default stack size for executor threads.
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Provider backed by OS threads.
#[derive(Clone)]
pub struct ThreadConcurrency {
    clock: Arc<dyn Clock>,
    stack_size: usize,
}

impl Default for ThreadConcurrency {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadConcurrency {
    /// Thread provider on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Use another clock for timeout accounting.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stack size for threads spawned by this provider's executors.
    #[must_use]
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

impl Concurrency for ThreadConcurrency {
    fn new_single_thread_executor(&self, name: &str) -> Arc<dyn Executor> {
        Arc::new(ThreadExecutor::new(name, 1, self.stack_size))
    }

    fn new_parallel_executor(&self, max_parallel: usize, name: &str) -> Arc<dyn Executor> {
        Arc::new(ThreadExecutor::new(name, max_parallel.max(1), self.stack_size))
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

/// Executor backed by up to `max_threads` OS threads sharing one channel.
pub struct ThreadExecutor {
    name: String,
    max_threads: usize,
    stack_size: usize,
    /// Job sender. `None` once shutdown has been requested.
    job_tx: Mutex<Option<Sender<Job>>>,
    job_rx: Receiver<Job>,
    /// Worker handles; the lock also serializes thread spawning.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Workers currently blocked waiting for a job.
    idle: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl ThreadExecutor {
    /// Create an executor; threads are spawned on demand.
    #[must_use]
    pub fn new(name: &str, max_threads: usize, stack_size: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<Job>();
        Self {
            name: name.to_string(),
            max_threads: max_threads.max(1),
            stack_size,
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            workers: Mutex::new(Vec::new()),
            idle: Arc::new(AtomicUsize::new(0)),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Number of worker threads currently owned (zero after shutdown).
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn spawn_worker(&self, workers: &mut Vec<JoinHandle<()>>) {
        let worker_id = workers.len();
        let job_rx = self.job_rx.clone();
        let idle = Arc::clone(&self.idle);
        let name = self.name.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-{worker_id}", self.name))
            .stack_size(self.stack_size)
            .spawn(move || {
                debug!(executor = %name, worker_id = worker_id, "executor thread started");
                loop {
                    idle.fetch_add(1, Ordering::AcqRel);
                    let received = job_rx.recv();
                    idle.fetch_sub(1, Ordering::AcqRel);
                    // Sender dropped and queue drained: clean exit.
                    let Ok(job) = received else { break };
                    run_job(job, &name);
                }
                debug!(executor = %name, worker_id = worker_id, "executor thread exiting");
            });

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => error!(executor = %self.name, error = %e, "failed to spawn executor thread"),
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) -> Result<(), Job> {
        let mut workers = self.workers.lock();
        let job_tx = self.job_tx.lock();
        let Some(tx) = job_tx.as_ref() else {
            return Err(job);
        };
        if let Err(returned) = tx.send(job) {
            return Err(returned.into_inner());
        }
        drop(job_tx);

        // Grow while queued jobs outnumber workers that will pick them up.
        if self.job_rx.len() > self.idle.load(Ordering::Acquire) && workers.len() < self.max_threads {
            self.spawn_worker(&mut workers);
        }
        if workers.is_empty() {
            // No thread could be started; reclaim the job so it is not stranded.
            if let Ok(job) = self.job_rx.try_recv() {
                return Err(job);
            }
        }
        Ok(())
    }

    fn shutdown(&self, on_done: ShutdownCallback) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(executor = %self.name, "executor already shut down");
            on_done(Ok(()));
            return;
        }

        // Drop the sender so idle workers wake up once the queue is empty.
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            self.job_tx.lock().take();
            workers.drain(..).collect()
        };

        let name = self.name.clone();
        let joiner_name = name.clone();
        let callback = Arc::new(Mutex::new(Some(on_done)));
        let joiner_callback = Arc::clone(&callback);
        let spawned = thread::Builder::new()
            .name(format!("{name}-shutdown"))
            .spawn(move || {
                let result = join_workers(&joiner_name, handles);
                if let Some(on_done) = joiner_callback.lock().take() {
                    on_done(result);
                }
            });

        if let Err(e) = spawned {
            warn!(executor = %name, error = %e, "could not spawn shutdown joiner; workers detached");
            if let Some(on_done) = callback.lock().take() {
                on_done(Err(SchedulerError::ExecutorShutdown(format!("{name}: {e}"))));
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        // Signal shutdown but don't join: explicit shutdown() is required for
        // graceful cleanup.
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.job_tx.lock().take();
            debug!(executor = %self.name, "executor dropped without explicit shutdown - workers detached");
        }
    }
}

/// Join worker threads, skipping the calling thread.
fn join_workers(name: &str, handles: Vec<JoinHandle<()>>) -> Result<(), SchedulerError> {
    let current = thread::current().id();
    let count = handles.len();
    let mut failure = None;

    for (idx, handle) in handles.into_iter().enumerate() {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() && failure.is_none() {
            warn!(executor = %name, worker_id = idx, "executor thread panicked");
            failure = Some(SchedulerError::ExecutorShutdown(format!(
                "{name}: worker {idx} panicked"
            )));
        }
    }

    info!(executor = %name, worker_count = count, "executor shut down complete");
    failure.map_or(Ok(()), Err)
}
