//! Single-flight drain loop over a queue of steps.
//!
//! A [`WorkerAccessThread`] collects [`Step`]s through [`offer`](WorkerAccessThread::offer)
//! and processes them in batches on its own single-thread executor once
//! [`start_if_required`](WorkerAccessThread::start_if_required) is called.
//! Steps of one worker never overlap: each batch runs under the worker's
//! drain lock.
//!
//! ```
//! use std::sync::Arc;
//! use op_sequencer::concurrency::ImmediateConcurrency;
//! use op_sequencer::core::WorkerAccessThread;
//!
//! let worker = WorkerAccessThread::new("io", Arc::new(ImmediateConcurrency::new()));
//! worker.offer(|| println!("step one"));
//! worker.offer(|| println!("step two"));
//! worker.start_if_required();
//! assert!(!worker.is_running());
//! ```

pub mod views;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, error, info, warn};

use super::callback::Step;
use super::error::{panic_message, SchedulerError};
use crate::concurrency::{run_job, Concurrency, Executor, Job, ShutdownCallback};

pub use views::{QueueWorker, QueueWorkerView, SingleInstanceThread, SingleInstanceView, ThreadSpace, ThreadSpaceView};

/// Notification fired when the worker next becomes idle.
type Listener = Box<dyn FnOnce() + Send + 'static>;

/// Batch-draining worker with a reentrant drain lock.
///
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct WorkerAccessThread {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    name: String,
    concurrency: Arc<dyn Concurrency>,
    executor: Arc<dyn Executor>,
    queue_tx: Sender<Box<dyn Step>>,
    queue_rx: Receiver<Box<dyn Step>>,
    running: AtomicBool,
    drain_lock: ReentrantMutex<()>,
    listeners: Mutex<Vec<Listener>>,
    shutdown_requested: AtomicBool,
    shut_down: AtomicBool,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,
}

impl WorkerAccessThread {
    /// Create a worker with its own single-thread executor.
    pub fn new(name: impl Into<String>, concurrency: Arc<dyn Concurrency>) -> Self {
        let name = name.into();
        let executor = concurrency.new_single_thread_executor(&name);
        let (queue_tx, queue_rx) = unbounded();
        debug!(worker = %name, "access thread created");
        Self {
            inner: Arc::new(WorkerInner {
                name,
                concurrency,
                executor,
                queue_tx,
                queue_rx,
                running: AtomicBool::new(false),
                drain_lock: ReentrantMutex::new(()),
                listeners: Mutex::new(Vec::new()),
                shutdown_requested: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                shutdown_callback: Mutex::new(None),
            }),
        }
    }

    /// Queue a step. Nothing runs until [`start_if_required`](Self::start_if_required).
    ///
    /// Once the worker has shut down the step runs inline on the caller.
    pub fn offer<S>(&self, step: S)
    where
        S: Step + 'static,
    {
        self.offer_boxed(Box::new(step));
    }

    /// [`offer`](Self::offer) for an already boxed step.
    pub fn offer_boxed(&self, step: Box<dyn Step>) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            warn!(worker = %self.inner.name, "step offered to shut down worker; running inline");
            self.inner.process_inline(step);
            return;
        }
        if let Err(rejected) = self.inner.queue_tx.send(step) {
            self.inner.process_inline(rejected.into_inner());
        }
    }

    /// Start draining unless a drain loop is already active.
    pub fn start_if_required(&self) {
        self.inner.start_if_required();
    }

    /// Run `listener` the next time the worker is idle with an empty queue.
    ///
    /// Fires immediately if that is already the case.
    pub fn add_all_operations_done_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() && self.inner.queue_rx.is_empty() {
            listener();
            self.inner.flush_listeners();
            return;
        }
        self.inner.listeners.lock().push(Box::new(listener));
        self.inner.start_if_required();
    }

    /// Request shutdown once the queue has drained.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShutdownAlreadyRequested`] on a second request.
    pub fn request_shutdown<F>(&self, on_done: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(Result<(), SchedulerError>) + Send + 'static,
    {
        {
            let mut slot = self.inner.shutdown_callback.lock();
            if self.inner.shutdown_requested.swap(true, Ordering::AcqRel) {
                warn!(worker = %self.inner.name, "shutdown already requested");
                return Err(SchedulerError::ShutdownAlreadyRequested(self.inner.name.clone()));
            }
            *slot = Some(Box::new(on_done));
        }
        info!(worker = %self.inner.name, queued = self.queued_count(), "shutdown requested");
        self.inner.start_if_required();
        Ok(())
    }

    /// Alias for [`request_shutdown`](Self::request_shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShutdownAlreadyRequested`] on a second request.
    pub fn shutdown<F>(&self, on_done: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(Result<(), SchedulerError>) + Send + 'static,
    {
        self.request_shutdown(on_done)
    }

    /// Whether the calling thread holds the drain lock.
    #[must_use]
    pub fn has_mutex(&self) -> bool {
        self.inner.drain_lock.is_owned_by_current_thread()
    }

    /// Acquire the drain lock; released when the guard drops.
    ///
    /// The lock is reentrant, so a step may call this while its batch runs.
    pub fn lock_mutex(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.drain_lock.lock()
    }

    /// Whether a drain loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether shutdown has been finalized.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Steps waiting for the next batch.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner.queue_rx.len()
    }

    /// Worker name used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The provider this worker draws its executor from.
    #[must_use]
    pub fn concurrency(&self) -> &Arc<dyn Concurrency> {
        &self.inner.concurrency
    }

    /// View exposing start, stop and running state.
    #[must_use]
    pub fn as_single_instance_thread(&self) -> SingleInstanceView {
        SingleInstanceView::new(self.clone())
    }

    /// View exposing offer and start.
    #[must_use]
    pub fn as_queue_worker(&self) -> QueueWorkerView {
        QueueWorkerView::new(self.clone())
    }

    /// View exposing add and process.
    #[must_use]
    pub fn as_thread_space(&self) -> ThreadSpaceView {
        ThreadSpaceView::new(self.clone())
    }
}

impl fmt::Debug for WorkerAccessThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerAccessThread")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .field("queued", &self.queued_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl WorkerInner {
    fn start_if_required(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.run_protected();
    }

    /// Hand a drain loop to the executor, or go idle if there is nothing to do.
    /// Caller holds `running`.
    fn run_protected(self: &Arc<Self>) {
        if self.queue_rx.is_empty() {
            self.go_idle();
            return;
        }
        let worker = Arc::clone(self);
        let job: Job = Box::new(move || worker.drain());
        if let Err(job) = self.executor.execute(job) {
            warn!(worker = %self.name, "executor rejected drain loop; draining inline");
            run_job(job, &self.name);
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let pending = self.queue_rx.len();
            let batch: Vec<Box<dyn Step>> = self.queue_rx.try_iter().take(pending).collect();
            {
                let _guard = self.drain_lock.lock();
                for step in batch {
                    self.process(step);
                }
            }
            if self.queue_rx.is_empty() {
                break;
            }
        }
        self.go_idle();
    }

    fn process(&self, step: Box<dyn Step>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || step.process())) {
            error!(
                worker = %self.name,
                panic = %panic_message(payload.as_ref()),
                "step panicked; continuing with batch"
            );
        }
    }

    fn process_inline(&self, step: Box<dyn Step>) {
        let _guard = self.drain_lock.lock();
        self.process(step);
    }

    fn go_idle(self: &Arc<Self>) {
        self.running.store(false, Ordering::Release);
        self.flush_listeners();

        // Offers that raced the idle transition restart the loop.
        if !self.queue_rx.is_empty() {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.run_protected();
            }
            return;
        }
        if self.shutdown_requested.load(Ordering::Acquire) {
            self.finalize();
        }
    }

    fn flush_listeners(&self) {
        loop {
            let listeners = std::mem::take(&mut *self.listeners.lock());
            if listeners.is_empty() {
                return;
            }
            for listener in listeners {
                run_job(listener, &self.name);
            }
        }
    }

    fn finalize(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(worker = %self.name, "stopping access thread executor");
        let worker = Arc::clone(self);
        self.executor
            .shutdown(Box::new(move |result: Result<(), SchedulerError>| {
                // Steps queued before the shut-down flag became visible.
                let leftovers: Vec<Box<dyn Step>> = worker.queue_rx.try_iter().collect();
                if !leftovers.is_empty() {
                    debug!(worker = %worker.name, count = leftovers.len(), "running leftover steps inline");
                }
                for step in leftovers {
                    worker.process_inline(step);
                }
                match &result {
                    Ok(()) => info!(worker = %worker.name, "access thread shut down"),
                    Err(e) => error!(worker = %worker.name, error = %e, "access thread shut down with errors"),
                }
                let on_done = worker.shutdown_callback.lock().take();
                if let Some(on_done) = on_done {
                    on_done(result);
                }
            }));
    }
}
