//! Capability-narrowed views over a [`WorkerAccessThread`].
//!
//! Each view wraps a handle to the same worker; none carries state of its own.

use super::WorkerAccessThread;
use crate::concurrency::ShutdownCallback;
use crate::core::callback::Step;
use crate::core::error::SchedulerError;

/// A thread that can be started on demand and stopped once.
pub trait SingleInstanceThread: Send + Sync {
    /// Start processing unless already running.
    fn start_if_required(&self);

    /// Stop after pending work; `on_stopped` fires once.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShutdownAlreadyRequested`] if already stopping.
    fn stop(&self, on_stopped: ShutdownCallback) -> Result<(), SchedulerError>;

    /// Whether processing is active.
    fn is_running(&self) -> bool;
}

/// A queue whose items are drained by a single worker.
pub trait QueueWorker: Send + Sync {
    /// Enqueue a step.
    fn offer(&self, step: Box<dyn Step>);

    /// Start draining unless already running.
    fn start_if_required(&self);

    /// Whether draining is active.
    fn is_running(&self) -> bool;
}

/// A space in which steps are collected and then processed.
pub trait ThreadSpace: Send + Sync {
    /// Add a step.
    fn add(&self, step: Box<dyn Step>);

    /// Process everything added so far.
    fn process_steps(&self);
}

/// [`SingleInstanceThread`] over a worker.
#[derive(Debug, Clone)]
pub struct SingleInstanceView(WorkerAccessThread);

impl SingleInstanceView {
    pub(super) const fn new(worker: WorkerAccessThread) -> Self {
        Self(worker)
    }
}

impl SingleInstanceThread for SingleInstanceView {
    fn start_if_required(&self) {
        self.0.start_if_required();
    }

    fn stop(&self, on_stopped: ShutdownCallback) -> Result<(), SchedulerError> {
        self.0.shutdown(on_stopped)
    }

    fn is_running(&self) -> bool {
        self.0.is_running()
    }
}

/// [`QueueWorker`] over a worker.
#[derive(Debug, Clone)]
pub struct QueueWorkerView(WorkerAccessThread);

impl QueueWorkerView {
    pub(super) const fn new(worker: WorkerAccessThread) -> Self {
        Self(worker)
    }
}

impl QueueWorker for QueueWorkerView {
    fn offer(&self, step: Box<dyn Step>) {
        self.0.offer_boxed(step);
    }

    fn start_if_required(&self) {
        self.0.start_if_required();
    }

    fn is_running(&self) -> bool {
        self.0.is_running()
    }
}

/// [`ThreadSpace`] over a worker.
#[derive(Debug, Clone)]
pub struct ThreadSpaceView(WorkerAccessThread);

impl ThreadSpaceView {
    pub(super) const fn new(worker: WorkerAccessThread) -> Self {
        Self(worker)
    }
}

impl ThreadSpace for ThreadSpaceView {
    fn add(&self, step: Box<dyn Step>) {
        self.0.offer_boxed(step);
    }

    fn process_steps(&self) {
        self.0.start_if_required();
    }
}
