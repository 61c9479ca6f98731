//! Operation, callback and step capabilities.
//!
//! The scheduler, the timeout guard and the access thread never own the work
//! they coordinate; they consume it through these traits. Plain closures
//! implement all three:
//!
//! ```
//! use op_sequencer::core::{BoxCallback, Callback, OperationError};
//!
//! let operation = |done: BoxCallback<u32>| done.on_success(42);
//! let callback = |result: Result<u32, OperationError>| assert_eq!(result.unwrap(), 42);
//! # let _ = (operation, callback);
//! ```

use std::fmt;

use parking_lot::Mutex;

use super::error::OperationError;

/// Receiver of exactly one operation outcome.
///
/// Both methods consume the callback, so a single handle cannot report twice.
pub trait Callback<T>: Send {
    /// Report a successful result.
    fn on_success(self: Box<Self>, value: T);
    /// Report a failure.
    fn on_failure(self: Box<Self>, error: OperationError);
}

/// Boxed callback handed to operations.
pub type BoxCallback<T> = Box<dyn Callback<T>>;

impl<T, F> Callback<T> for F
where
    F: FnOnce(Result<T, OperationError>) + Send,
{
    fn on_success(self: Box<Self>, value: T) {
        (*self)(Ok(value));
    }

    fn on_failure(self: Box<Self>, error: OperationError) {
        (*self)(Err(error));
    }
}

/// Asynchronous unit of work that reports through its callback.
///
/// An operation must eventually call exactly one of the callback's methods;
/// the scheduler's timeout masks a stall but cannot stop it.
pub trait Operation<T>: Send {
    /// Start the work.
    fn apply(self: Box<Self>, callback: BoxCallback<T>);
}

impl<T, F> Operation<T> for F
where
    F: FnOnce(BoxCallback<T>) + Send,
{
    fn apply(self: Box<Self>, callback: BoxCallback<T>) {
        (*self)(callback);
    }
}

/// Fire-and-forget unit of work processed by an access thread.
pub trait Step: Send {
    /// Run the step.
    fn process(self: Box<Self>);
}

impl<F> Step for F
where
    F: FnOnce() + Send,
{
    fn process(self: Box<Self>) {
        (*self)();
    }
}

/// Type-erased handle that can force-fail a pending callback.
pub(crate) trait Resolve: Send + Sync {
    /// Deliver a failure; returns `false` if the callback already fired.
    fn fail(&self, error: OperationError) -> bool;
}

/// At-most-once wrapper around a registered callback.
///
/// The callback sits in a slot that is taken exactly once; every later
/// delivery attempt observes the empty slot and reports `false`.
pub(crate) struct OnceCallback<T> {
    label: String,
    slot: Mutex<Option<BoxCallback<T>>>,
}

impl<T> OnceCallback<T> {
    pub(crate) fn new(label: String, callback: BoxCallback<T>) -> Self {
        Self {
            label,
            slot: Mutex::new(Some(callback)),
        }
    }

    /// Deliver an outcome. The slot lock is released before user code runs.
    pub(crate) fn deliver(&self, outcome: Result<T, OperationError>) -> bool {
        let Some(callback) = self.slot.lock().take() else {
            return false;
        };
        match outcome {
            Ok(value) => callback.on_success(value),
            Err(error) => callback.on_failure(error),
        }
        true
    }

    pub(crate) fn is_delivered(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl<T> Resolve for OnceCallback<T> {
    fn fail(&self, error: OperationError) -> bool {
        let delivered = self.deliver(Err(error));
        if !delivered {
            tracing::warn!(operation = %self.label, "callback already triggered; timeout not reported");
        }
        delivered
    }
}

impl<T> fmt::Debug for OnceCallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceCallback")
            .field("label", &self.label)
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

/// Short description of an operation type for diagnostics.
pub(crate) fn describe<O: ?Sized>() -> String {
    std::any::type_name::<O>().to_string()
}
