//! Tokio-backed concurrency provider.
//!
//! Jobs are plain blocking closures, so each one runs through
//! `spawn_blocking`. A dispatcher task feeds them from an unbounded channel
//! and a semaphore caps how many run at once; with one permit the executor is
//! strictly sequential in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::concurrency::{run_job, Concurrency, Executor, Job, ShutdownCallback};
use crate::core::error::SchedulerError;
use crate::util::clock::{Clock, SystemClock};

/// Provider whose executors run on a tokio runtime.
#[derive(Clone)]
pub struct TokioConcurrency {
    handle: Handle,
    clock: Arc<dyn Clock>,
}

impl TokioConcurrency {
    /// Provider on an existing runtime handle.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            clock: Arc::new(SystemClock),
        }
    }

    /// Provider on the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] outside a tokio runtime.
    pub fn current() -> Result<Self, SchedulerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SchedulerError::InvalidConfig(format!("no tokio runtime: {e}")))
    }

    /// Use another clock for timeout accounting.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Concurrency for TokioConcurrency {
    fn new_single_thread_executor(&self, name: &str) -> Arc<dyn Executor> {
        Arc::new(TokioExecutor::new(name, 1, &self.handle))
    }

    fn new_parallel_executor(&self, max_parallel: usize, name: &str) -> Arc<dyn Executor> {
        Arc::new(TokioExecutor::new(name, max_parallel, &self.handle))
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

/// Executor running jobs on tokio's blocking pool with bounded parallelism.
pub struct TokioExecutor {
    name: String,
    handle: Handle,
    job_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    permits: Arc<Semaphore>,
    max_parallel: u32,
    shut_down: AtomicBool,
}

impl TokioExecutor {
    /// Create an executor and start its dispatcher on `handle`.
    #[must_use]
    pub fn new(name: &str, max_parallel: usize, handle: &Handle) -> Self {
        let max_parallel = u32::try_from(max_parallel.max(1)).unwrap_or(u32::MAX);
        let permits = Arc::new(Semaphore::new(max_parallel as usize));
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();

        let dispatch_name = name.to_string();
        let dispatch_permits = Arc::clone(&permits);
        let dispatcher = handle.spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let Ok(permit) = Arc::clone(&dispatch_permits).acquire_owned().await else {
                    break;
                };
                let name = dispatch_name.clone();
                tokio::task::spawn_blocking(move || {
                    run_job(job, &name);
                    drop(permit);
                });
            }
            debug!(executor = %dispatch_name, "dispatcher exiting");
        });

        Self {
            name: name.to_string(),
            handle: handle.clone(),
            job_tx: Mutex::new(Some(job_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            permits,
            max_parallel,
            shut_down: AtomicBool::new(false),
        }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) -> Result<(), Job> {
        let job_tx = self.job_tx.lock();
        let Some(tx) = job_tx.as_ref() else {
            return Err(job);
        };
        tx.send(job).map_err(|rejected| rejected.0)
    }

    fn shutdown(&self, on_done: ShutdownCallback) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            on_done(Ok(()));
            return;
        }
        self.job_tx.lock().take();
        let dispatcher = self.dispatcher.lock().take();
        let permits = Arc::clone(&self.permits);
        let max_parallel = self.max_parallel;
        let name = self.name.clone();

        self.handle.spawn(async move {
            let mut result = Ok(());
            if let Some(dispatcher) = dispatcher {
                if let Err(e) = dispatcher.await {
                    warn!(executor = %name, error = %e, "dispatcher failed");
                    result = Err(SchedulerError::ExecutorShutdown(format!("{name}: {e}")));
                }
            }
            // All permits back means every dispatched job has returned.
            if let Err(e) = permits.acquire_many(max_parallel).await {
                result = result.and(Err(SchedulerError::ExecutorShutdown(format!("{name}: {e}"))));
            }
            info!(executor = %name, "executor shut down complete");
            on_done(result);
        });
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
