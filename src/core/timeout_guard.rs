//! Shared timeout budget for unordered, concurrent operations.
//!
//! Unlike the scheduler, a [`ConcurrentTimeoutGuard`] does not sequence
//! anything: every [`perform`](ConcurrentTimeoutGuard::perform) starts its
//! operation immediately on the calling thread. The guard only tracks what is
//! in flight and, whenever a new operation arrives, force-fails every tracked
//! operation that has outlived the timeout.
//!
//! Reaping is opportunistic. A stalled operation is resolved by the next
//! `perform` (or an explicit [`reap_expired`](ConcurrentTimeoutGuard::reap_expired)),
//! never by a timer.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::callback::{describe, BoxCallback, Callback, OnceCallback, Operation, Resolve};
use super::entry::{EntryId, InFlight};
use super::error::{OperationError, SchedulerError};
use crate::concurrency::Concurrency;
use crate::config::GuardConfig;

/// Applies one timeout to any number of concurrently running operations.
#[derive(Clone)]
pub struct ConcurrentTimeoutGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    timeout: Duration,
    concurrency: Arc<dyn Concurrency>,
    in_flight: Mutex<Vec<InFlight>>,
}

impl ConcurrentTimeoutGuard {
    /// Guard with the given timeout, reading time from `concurrency`.
    pub fn new(timeout: Duration, concurrency: Arc<dyn Concurrency>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                timeout,
                concurrency,
                in_flight: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Guard from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] if the configuration is rejected.
    pub fn with_config(config: &GuardConfig, concurrency: Arc<dyn Concurrency>) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        Ok(Self::new(config.timeout(), concurrency))
    }

    /// Reap expired entries, register this one, then start the operation.
    ///
    /// `callback` receives the operation's outcome, or a timeout failure if a
    /// later sweep reaps the entry first. Never both.
    pub fn perform<T, O, C>(&self, operation: O, callback: C)
    where
        T: Send + 'static,
        O: Operation<T> + 'static,
        C: Callback<T> + 'static,
    {
        let id = EntryId::next();
        let label = describe::<O>();
        let callback: BoxCallback<T> = Box::new(callback);
        let delivery = Arc::new(OnceCallback::new(label.clone(), callback));
        let resolver: Arc<dyn Resolve> = delivery.clone();

        let now = self.inner.concurrency.now();
        let expired = {
            let mut in_flight = self.inner.in_flight.lock();
            let expired = self.inner.take_expired(&mut in_flight, now);
            in_flight.push(InFlight {
                id,
                label,
                started_at: now,
                resolver,
            });
            expired
        };
        self.inner.fail_expired(expired, now);

        let reporter = GuardReporter {
            guard: Arc::downgrade(&self.inner),
            id,
            delivery,
        };
        let fallback = reporter.clone();
        let operation: Box<dyn Operation<T>> = Box::new(operation);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || operation.apply(Box::new(reporter)))) {
            let err = OperationError::from_panic(payload.as_ref());
            error!(entry = %id, error = %err, "guarded operation panicked in apply");
            Box::new(fallback).on_failure(err);
        }
    }

    /// Run the timeout sweep without registering a new operation.
    ///
    /// Returns the number of entries that were force-failed.
    pub fn reap_expired(&self) -> usize {
        let now = self.inner.concurrency.now();
        let expired = self.inner.take_expired(&mut self.inner.in_flight.lock(), now);
        let count = expired.len();
        self.inner.fail_expired(expired, now);
        count
    }

    /// Operations started but not yet resolved.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Configured timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Completes immediately; in-flight operations are left to finish on their own.
    pub fn shutdown<F>(&self, on_done: F)
    where
        F: FnOnce(Result<(), SchedulerError>),
    {
        debug!(in_flight = self.in_flight_count(), "timeout guard shut down");
        on_done(Ok(()));
    }
}

impl fmt::Debug for ConcurrentTimeoutGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentTimeoutGuard")
            .field("timeout", &self.inner.timeout)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

impl GuardInner {
    fn take_expired(&self, in_flight: &mut Vec<InFlight>, now: Instant) -> Vec<InFlight> {
        let (expired, live): (Vec<InFlight>, Vec<InFlight>) = std::mem::take(in_flight)
            .into_iter()
            .partition(|entry| entry.elapsed(now) > self.timeout);
        *in_flight = live;
        expired
    }

    /// Fail reaped entries; called without the list lock held.
    fn fail_expired(&self, expired: Vec<InFlight>, now: Instant) {
        for entry in expired {
            warn!(
                entry = %entry.id,
                operation = %entry.label,
                elapsed_ms = entry.elapsed(now).as_millis(),
                timeout_ms = self.timeout.as_millis(),
                "guarded operation timed out"
            );
            entry.expire(now, self.timeout);
        }
    }

    fn remove(&self, id: EntryId) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.iter().position(|entry| entry.id == id) {
            Some(idx) => {
                in_flight.swap_remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Callback handed to a guarded operation.
struct GuardReporter<T> {
    guard: Weak<GuardInner>,
    id: EntryId,
    delivery: Arc<OnceCallback<T>>,
}

impl<T> Clone for GuardReporter<T> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            id: self.id,
            delivery: Arc::clone(&self.delivery),
        }
    }
}

impl<T> GuardReporter<T> {
    fn complete(self, outcome: Result<T, OperationError>) {
        let tracked = self.guard.upgrade().is_none_or(|guard| guard.remove(self.id));
        if !tracked {
            warn!(
                entry = %self.id,
                succeeded = outcome.is_ok(),
                "operation already terminated; late completion dropped"
            );
            return;
        }
        self.delivery.deliver(outcome);
    }
}

impl<T: Send> Callback<T> for GuardReporter<T> {
    fn on_success(self: Box<Self>, value: T) {
        (*self).complete(Ok(value));
    }

    fn on_failure(self: Box<Self>, error: OperationError) {
        (*self).complete(Err(error));
    }
}
