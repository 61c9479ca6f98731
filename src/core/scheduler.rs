//! Strictly sequential execution of asynchronous operations.
//!
//! A [`SequentialOperationScheduler`] accepts operations that report through a
//! callback, runs them one at a time in submission order, and forwards each
//! outcome to the user callback on a separate callback pool. An operation that
//! stays in flight longer than the configured timeout is force-failed the next
//! time the scheduler is asked to start work, so one stalled operation cannot
//! block the queue forever.
//!
//! # Design Principles
//!
//! - **Single flight**: the `in_progress` flag is only ever won by CAS
//! - **Identity-checked completion**: a report for an entry that is no longer
//!   current is logged and dropped
//! - **Lazy timeouts**: stalls are detected on schedule, resume and completion;
//!   there is no watchdog thread
//! - **Callbacks off the operation thread**: user callbacks run on the
//!   callback pool, submitted before the next operation is started

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::callback::{describe, BoxCallback, Callback, OnceCallback, Operation, Resolve};
use super::entry::{EntryId, InFlight, Launch, OperationEntry};
use super::error::{OperationError, SchedulerError};
use crate::concurrency::{execute_or_inline, run_job, Concurrency, Executor, Job, ShutdownCallback};
use crate::config::SchedulerConfig;

thread_local! {
    /// Schedulers launching an operation on this thread, innermost last, each
    /// with a flag set when a start attempt was deferred to its loop.
    static DISPATCHING: RefCell<Vec<(usize, bool)>> = const { RefCell::new(Vec::new()) };
}

/// Marks this thread as inside `launch` for one scheduler.
///
/// Start attempts made on the same thread while the scope is open (a
/// synchronous completion, a nested `schedule`) only set the rerun flag; the
/// enclosing `run_if_required` loop picks them up after `launch` returns.
struct DispatchScope {
    key: usize,
}

impl DispatchScope {
    fn key(inner: &SchedulerInner) -> usize {
        std::ptr::from_ref(inner) as usize
    }

    fn enter(inner: &SchedulerInner) -> Self {
        let key = Self::key(inner);
        DISPATCHING.with(|d| d.borrow_mut().push((key, false)));
        Self { key }
    }

    /// Record a start attempt if `inner` is dispatching on this thread.
    fn defer(inner: &SchedulerInner) -> bool {
        let key = Self::key(inner);
        DISPATCHING.with(|d| {
            let mut d = d.borrow_mut();
            match d.iter_mut().rev().find(|(k, _)| *k == key) {
                Some(entry) => {
                    entry.1 = true;
                    true
                }
                None => false,
            }
        })
    }

    fn rerun_requested(&self) -> bool {
        DISPATCHING.with(|d| d.borrow().last().is_some_and(|&(k, rerun)| k == self.key && rerun))
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|&(k, _)| k == self.key) {
                d.remove(pos);
            }
        });
    }
}

/// Observable lifecycle state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    /// Nothing in flight and not suspended.
    Idle,
    /// An operation is in flight.
    Running,
    /// Starting new operations is paused.
    Suspended,
    /// Shutdown requested; waiting for in-flight and queued work.
    ShuttingDown,
    /// Both executors have stopped.
    ShutDown,
}

/// Runs asynchronous operations one at a time, in submission order.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct SequentialOperationScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    owner: String,
    concurrency: Arc<dyn Concurrency>,
    operation_executor: Arc<dyn Executor>,
    callback_executor: Arc<dyn Executor>,
    /// Pending entries. The lock also orders `schedule` against `shutdown`.
    scheduled: Mutex<VecDeque<OperationEntry>>,
    current: Mutex<Option<InFlight>>,
    in_progress: AtomicBool,
    suspend_count: AtomicUsize,
    shutting_down: AtomicBool,
    shutdown_started: AtomicBool,
    shut_down: AtomicBool,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,
    timeout_ms: AtomicU64,
    enforce_own_thread: AtomicBool,
    trace: AtomicBool,
    metrics: bool,
    total_runtime_ms: AtomicU64,
}

impl SequentialOperationScheduler {
    /// Scheduler with default settings (3 s timeout, 5 callback threads).
    pub fn new(owner: impl Into<String>, concurrency: Arc<dyn Concurrency>) -> Self {
        Self::build(owner.into(), &SchedulerConfig::default(), concurrency)
    }

    /// Scheduler from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] if the configuration is rejected.
    pub fn with_config(
        owner: impl Into<String>,
        config: &SchedulerConfig,
        concurrency: Arc<dyn Concurrency>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        Ok(Self::build(owner.into(), config, concurrency))
    }

    fn build(owner: String, config: &SchedulerConfig, concurrency: Arc<dyn Concurrency>) -> Self {
        let operation_executor = concurrency.new_single_thread_executor(&format!("{owner}-operations"));
        let callback_executor =
            concurrency.new_parallel_executor(config.callback_threads, &format!("{owner}-callbacks"));

        info!(
            scheduler = %owner,
            timeout_ms = config.timeout_ms,
            callback_threads = config.callback_threads,
            enforce_own_thread = config.enforce_own_thread,
            "scheduler created"
        );

        Self {
            inner: Arc::new(SchedulerInner {
                owner,
                concurrency,
                operation_executor,
                callback_executor,
                scheduled: Mutex::new(VecDeque::new()),
                current: Mutex::new(None),
                in_progress: AtomicBool::new(false),
                suspend_count: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                shutdown_started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                shutdown_callback: Mutex::new(None),
                timeout_ms: AtomicU64::new(config.timeout_ms),
                enforce_own_thread: AtomicBool::new(config.enforce_own_thread),
                trace: AtomicBool::new(config.trace),
                metrics: config.metrics,
                total_runtime_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an operation and its callback, starting it if nothing is in flight.
    ///
    /// The callback is invoked exactly once, on the callback pool, with either
    /// the operation's own outcome or a timeout failure.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShuttingDown`] once shutdown has been requested;
    /// the callback is dropped without being invoked.
    pub fn schedule<T, O, C>(&self, operation: O, callback: C) -> Result<EntryId, SchedulerError>
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
        let launch = launcher(Arc::downgrade(&self.inner), id, operation, delivery);

        {
            let mut scheduled = self.inner.scheduled.lock();
            if self.inner.shutting_down.load(Ordering::Acquire) {
                warn!(scheduler = %self.inner.owner, operation = %label, "schedule rejected; shutting down");
                return Err(SchedulerError::ShuttingDown(self.inner.owner.clone()));
            }
            scheduled.push_back(OperationEntry {
                id,
                label,
                enqueued_at: self.inner.concurrency.now(),
                launch,
                resolver,
            });
        }

        if self.inner.trace_enabled() {
            debug!(scheduler = %self.inner.owner, entry = %id, "operation scheduled");
        }
        self.inner.run_if_required();
        Ok(id)
    }

    /// Stop starting new operations. Calls nest; each needs a matching [`resume`](Self::resume).
    pub fn suspend(&self) {
        let depth = self.inner.suspend_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(scheduler = %self.inner.owner, depth = depth, "scheduler suspended");
    }

    /// Undo one [`suspend`](Self::suspend) and start pending work if now unsuspended.
    pub fn resume(&self) {
        let previous = self
            .inner
            .suspend_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        match previous {
            Ok(depth) => debug!(scheduler = %self.inner.owner, depth = depth - 1, "scheduler resumed"),
            Err(_) => warn!(scheduler = %self.inner.owner, "resume without matching suspend"),
        }
        self.inner.run_if_required();
    }

    /// Suspend only if no operation is in flight. Returns whether it suspended.
    pub fn suspend_if_possible(&self) -> bool {
        if self.inner.in_progress.load(Ordering::Acquire) {
            return false;
        }
        self.suspend();
        true
    }

    /// Request shutdown.
    ///
    /// Returns immediately. `on_done` runs once no operation is in flight, the
    /// queue is empty and both executors have stopped; it receives the first
    /// executor error, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShutdownAlreadyRequested`] on a second call;
    /// `on_done` is dropped in that case.
    pub fn shutdown<F>(&self, on_done: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(Result<(), SchedulerError>) + Send + 'static,
    {
        {
            let _scheduled = self.inner.scheduled.lock();
            if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
                warn!(scheduler = %self.inner.owner, "shutdown already requested");
                return Err(SchedulerError::ShutdownAlreadyRequested(self.inner.owner.clone()));
            }
            *self.inner.shutdown_callback.lock() = Some(Box::new(on_done));
        }
        info!(scheduler = %self.inner.owner, pending = self.scheduled_count(), "shutdown requested");
        self.inner.try_shutdown();
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            SchedulerState::ShutDown
        } else if inner.shutting_down.load(Ordering::Acquire) {
            SchedulerState::ShuttingDown
        } else if inner.is_suspended() {
            SchedulerState::Suspended
        } else if inner.in_progress.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// Whether an operation is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// Whether shutdown has completed.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Operations waiting to start.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.inner.scheduled.lock().len()
    }

    /// Owner name used in diagnostics and executor names.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Current timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    /// Change the timeout; applies to the next timeout check.
    pub fn set_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.inner.timeout_ms.store(ms, Ordering::Release);
    }

    /// Run subsequent operations on the scheduler-owned thread.
    pub fn set_enforce_own_thread(&self, value: bool) {
        self.inner.enforce_own_thread.store(value, Ordering::Release);
    }

    /// Toggle per-operation debug events.
    pub fn set_trace(&self, value: bool) {
        self.inner.trace.store(value, Ordering::Release);
    }

    /// Accumulated operation runtime; zero unless metrics are enabled.
    #[must_use]
    pub fn total_runtime(&self) -> Duration {
        Duration::from_millis(self.inner.total_runtime_ms.load(Ordering::Acquire))
    }

    /// The provider this scheduler draws executors and time from.
    #[must_use]
    pub fn concurrency(&self) -> &Arc<dyn Concurrency> {
        &self.inner.concurrency
    }
}

impl fmt::Debug for SequentialOperationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialOperationScheduler")
            .field("owner", &self.inner.owner)
            .field("state", &self.state())
            .field("scheduled", &self.scheduled_count())
            .field("timeout", &self.timeout())
            .finish()
    }
}

impl SchedulerInner {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    fn is_suspended(&self) -> bool {
        self.suspend_count.load(Ordering::Acquire) > 0
    }

    fn trace_enabled(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    /// Start the next operation unless suspended or one is already in flight.
    ///
    /// Operations that complete synchronously are chained by this loop rather
    /// than by recursion, so the stack stays flat however long the backlog.
    fn run_if_required(self: &Arc<Self>) {
        if DispatchScope::defer(self) {
            return;
        }
        loop {
            if self.is_suspended() {
                if self.trace_enabled() {
                    debug!(scheduler = %self.owner, "suspended; not starting");
                }
                // A drained, suspended scheduler can still finish shutting down.
                self.try_shutdown();
                return;
            }
            if self
                .in_progress
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if self.perform_run() {
                    continue;
                }
                return;
            }
            if !self.expire_stalled() {
                return;
            }
        }
    }

    /// Pop and launch the next entry. Caller holds `in_progress`.
    ///
    /// Returns `true` if a start attempt was made while launching.
    fn perform_run(self: &Arc<Self>) -> bool {
        loop {
            let next = self.scheduled.lock().pop_front();
            let Some(entry) = next else {
                self.in_progress.store(false, Ordering::Release);
                // An entry may have been pushed after the pop but before the release.
                let refill = !self.scheduled.lock().is_empty()
                    && !self.is_suspended()
                    && self
                        .in_progress
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                if refill {
                    continue;
                }
                self.try_shutdown();
                return false;
            };

            let OperationEntry {
                id,
                label,
                enqueued_at,
                launch,
                resolver,
            } = entry;
            let started_at = self.concurrency.now();
            *self.current.lock() = Some(InFlight {
                id,
                label,
                started_at,
                resolver,
            });
            if self.trace_enabled() {
                debug!(
                    scheduler = %self.owner,
                    entry = %id,
                    queued_ms = started_at.saturating_duration_since(enqueued_at).as_millis(),
                    "executing operation"
                );
            }
            let scope = DispatchScope::enter(self);
            self.launch(launch);
            return scope.rerun_requested();
        }
    }

    fn launch(&self, launch: Launch) {
        if !self.enforce_own_thread.load(Ordering::Acquire) {
            launch();
            return;
        }
        if let Err(launch) = self.operation_executor.execute(launch) {
            warn!(scheduler = %self.owner, "operation executor rejected launch; running inline");
            launch();
        }
    }

    /// Force-fail the current entry if it has outlived the timeout.
    ///
    /// Returns `true` if an entry was expired and `in_progress` released.
    fn expire_stalled(&self) -> bool {
        let now = self.concurrency.now();
        let timeout = self.timeout();
        let stalled = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(in_flight) if in_flight.elapsed(now) > timeout => current.take(),
                _ => None,
            }
        };
        let Some(stalled) = stalled else {
            return false;
        };

        warn!(
            scheduler = %self.owner,
            entry = %stalled.id,
            operation = %stalled.label,
            elapsed_ms = stalled.elapsed(now).as_millis(),
            timeout_ms = timeout.as_millis(),
            "operation timed out"
        );
        self.record_runtime(&stalled, now);
        self.in_progress.store(false, Ordering::Release);
        execute_or_inline(
            self.callback_executor.as_ref(),
            Box::new(move || {
                stalled.expire(now, timeout);
            }),
        );
        true
    }

    /// Completion report from an operation.
    fn on_completed(self: &Arc<Self>, id: EntryId, succeeded: bool, deliver: Job) {
        let finished = {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| c.id == id) {
                current.take()
            } else {
                None
            }
        };
        let Some(finished) = finished else {
            warn!(
                scheduler = %self.owner,
                entry = %id,
                succeeded = succeeded,
                "completion for an operation that is no longer current; dropped"
            );
            return;
        };

        let now = self.concurrency.now();
        self.record_runtime(&finished, now);
        if self.trace_enabled() {
            debug!(
                scheduler = %self.owner,
                entry = %id,
                succeeded = succeeded,
                elapsed_ms = finished.elapsed(now).as_millis(),
                "operation completed"
            );
        }
        self.in_progress.store(false, Ordering::Release);
        execute_or_inline(self.callback_executor.as_ref(), deliver);
        self.run_if_required();
    }

    fn record_runtime(&self, in_flight: &InFlight, now: std::time::Instant) {
        if self.metrics {
            let ms = u64::try_from(in_flight.elapsed(now).as_millis()).unwrap_or(u64::MAX);
            self.total_runtime_ms.fetch_add(ms, Ordering::AcqRel);
        }
    }

    /// Begin executor shutdown once requested and fully drained.
    fn try_shutdown(self: &Arc<Self>) {
        if !self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if self.in_progress.load(Ordering::Acquire) && !self.expire_stalled() {
            if self.trace_enabled() {
                debug!(scheduler = %self.owner, "shutdown waiting for in-flight operation");
            }
            return;
        }
        if !self.scheduled.lock().is_empty() {
            if !self.is_suspended() {
                self.run_if_required();
            }
            return;
        }
        if self.in_progress.load(Ordering::Acquire) || self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.perform_shutdown();
    }

    fn perform_shutdown(self: &Arc<Self>) {
        info!(scheduler = %self.owner, "stopping scheduler executors");
        if self.metrics {
            info!(
                scheduler = %self.owner,
                total_runtime_ms = self.total_runtime_ms.load(Ordering::Acquire),
                "scheduler runtime"
            );
        }
        let inner = Arc::clone(self);
        self.operation_executor
            .shutdown(Box::new(move |operations: Result<(), SchedulerError>| {
                let callbacks = Arc::clone(&inner.callback_executor);
                callbacks.shutdown(Box::new(move |delivered: Result<(), SchedulerError>| {
                    inner.finish_shutdown(operations.and(delivered));
                }));
            }));
    }

    fn finish_shutdown(&self, result: Result<(), SchedulerError>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        match &result {
            Ok(()) => info!(scheduler = %self.owner, "scheduler shut down"),
            Err(e) => error!(scheduler = %self.owner, error = %e, "scheduler shut down with errors"),
        }
        let on_done = self.shutdown_callback.lock().take();
        if let Some(on_done) = on_done {
            on_done(result);
        }
    }
}

/// Erase an operation into a launch closure that reports back by entry id.
fn launcher<T, O>(scheduler: Weak<SchedulerInner>, id: EntryId, operation: O, delivery: Arc<OnceCallback<T>>) -> Launch
where
    T: Send + 'static,
    O: Operation<T> + 'static,
{
    Box::new(move || {
        let reporter = CompletionReporter {
            scheduler,
            id,
            delivery,
        };
        let fallback = reporter.clone();
        let operation: Box<dyn Operation<T>> = Box::new(operation);
        let applied = panic::catch_unwind(AssertUnwindSafe(move || operation.apply(Box::new(reporter))));
        if let Err(payload) = applied {
            let err = OperationError::from_panic(payload.as_ref());
            error!(entry = %id, error = %err, "operation panicked in apply");
            Box::new(fallback).on_failure(err);
        }
    })
}

/// Callback handed to the operation; routes its outcome through the scheduler.
struct CompletionReporter<T> {
    scheduler: Weak<SchedulerInner>,
    id: EntryId,
    delivery: Arc<OnceCallback<T>>,
}

impl<T> Clone for CompletionReporter<T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            id: self.id,
            delivery: Arc::clone(&self.delivery),
        }
    }
}

impl<T: Send + 'static> CompletionReporter<T> {
    fn complete(self, outcome: Result<T, OperationError>) {
        let succeeded = outcome.is_ok();
        let delivery = self.delivery;
        let deliver: Job = Box::new(move || {
            delivery.deliver(outcome);
        });
        match self.scheduler.upgrade() {
            Some(inner) => inner.on_completed(self.id, succeeded, deliver),
            None => {
                debug!(entry = %self.id, "scheduler dropped; delivering inline");
                run_job(deliver, "detached");
            }
        }
    }
}

impl<T: Send + 'static> Callback<T> for CompletionReporter<T> {
    fn on_success(self: Box<Self>, value: T) {
        (*self).complete(Ok(value));
    }

    fn on_failure(self: Box<Self>, error: OperationError) {
        (*self).complete(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ImmediateConcurrency;
    use crate::util::clock::ManualClock;

    type Pending = Arc<Mutex<Vec<BoxCallback<u32>>>>;
    type Seen = Arc<Mutex<Vec<Result<u32, String>>>>;

    fn immediate(clock: &ManualClock) -> SequentialOperationScheduler {
        let config = SchedulerConfig::new().with_timeout(Duration::from_millis(10));
        SequentialOperationScheduler::with_config(
            "test",
            &config,
            Arc::new(ImmediateConcurrency::with_manual_clock(clock.clone())),
        )
        .unwrap()
    }

    /// Operation that parks its callback for the test to complete later.
    fn parked(pending: &Pending) -> impl Operation<u32> + 'static {
        let pending = Arc::clone(pending);
        move |cb: BoxCallback<u32>| pending.lock().push(cb)
    }

    fn recorder(seen: &Seen) -> impl Callback<u32> + 'static {
        let seen = Arc::clone(seen);
        move |r: Result<u32, OperationError>| seen.lock().push(r.map_err(|e| e.to_string()))
    }

    #[test]
    fn test_immediate_operations_complete_in_order() {
        let scheduler = immediate(&ManualClock::new());
        let seen: Seen = Arc::default();
        for i in 0..3 {
            scheduler
                .schedule(move |cb: BoxCallback<u32>| cb.on_success(i), recorder(&seen))
                .unwrap();
        }
        assert_eq!(*seen.lock(), vec![Ok(0), Ok(1), Ok(2)]);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_only_one_operation_in_flight() {
        let scheduler = immediate(&ManualClock::new());
        let pending: Pending = Arc::default();
        let seen: Seen = Arc::default();

        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        assert_eq!(pending.lock().len(), 1);
        assert_eq!(scheduler.scheduled_count(), 1);
        assert!(scheduler.is_running());

        let first = pending.lock().remove(0);
        first.on_success(1);
        assert_eq!(*seen.lock(), vec![Ok(1)]);
        assert_eq!(pending.lock().len(), 1);

        let second = pending.lock().remove(0);
        second.on_failure(OperationError::msg("nope"));
        assert_eq!(seen.lock().len(), 2);
        assert!(seen.lock()[1].is_err());
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_stalled_operation_times_out_on_next_schedule() {
        let clock = ManualClock::new();
        let scheduler = immediate(&clock);
        let pending: Pending = Arc::default();
        let seen: Seen = Arc::default();

        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        clock.advance(Duration::from_millis(20));
        scheduler
            .schedule(|cb: BoxCallback<u32>| cb.on_success(2), recorder(&seen))
            .unwrap();

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert!(seen[0].as_ref().unwrap_err().contains("timed out"));
            assert_eq!(seen[1], Ok(2));
        }

        // Late completion of the expired operation is dropped.
        let late = pending.lock().remove(0);
        late.on_success(1);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_no_timeout_at_exact_budget() {
        let clock = ManualClock::new();
        let scheduler = immediate(&clock);
        let pending: Pending = Arc::default();
        let seen: Seen = Arc::default();

        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        clock.advance(Duration::from_millis(10));
        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(pending.lock().len(), 1);
    }

    #[test]
    fn test_suspend_and_resume() {
        let scheduler = immediate(&ManualClock::new());
        let seen: Seen = Arc::default();

        assert!(scheduler.suspend_if_possible());
        scheduler.suspend();
        assert_eq!(scheduler.state(), SchedulerState::Suspended);
        scheduler
            .schedule(|cb: BoxCallback<u32>| cb.on_success(5), recorder(&seen))
            .unwrap();
        assert!(seen.lock().is_empty());

        scheduler.resume();
        assert!(seen.lock().is_empty());
        scheduler.resume();
        assert_eq!(*seen.lock(), vec![Ok(5)]);

        // Unbalanced resume is tolerated.
        scheduler.resume();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_suspend_if_possible_refuses_while_running() {
        let scheduler = immediate(&ManualClock::new());
        let pending: Pending = Arc::default();
        let seen: Seen = Arc::default();
        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        assert!(!scheduler.suspend_if_possible());
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn test_shutdown_lifecycle() {
        let scheduler = immediate(&ManualClock::new());
        let pending: Pending = Arc::default();
        let seen: Seen = Arc::default();
        let done = Arc::new(Mutex::new(None));

        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        let sink = Arc::clone(&done);
        scheduler
            .shutdown(move |r: Result<(), SchedulerError>| *sink.lock() = Some(r))
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::ShuttingDown);
        assert!(done.lock().is_none());

        let err = scheduler
            .schedule(|cb: BoxCallback<u32>| cb.on_success(0), recorder(&seen))
            .unwrap_err();
        assert_eq!(err, SchedulerError::ShuttingDown("test".into()));
        assert!(matches!(
            scheduler.shutdown(|_r: Result<(), SchedulerError>| {}),
            Err(SchedulerError::ShutdownAlreadyRequested(_))
        ));

        let cb = pending.lock().remove(0);
        cb.on_success(9);
        assert_eq!(*seen.lock(), vec![Ok(9)]);
        assert_eq!(*done.lock(), Some(Ok(())));
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);
    }

    #[test]
    fn test_shutdown_completes_while_suspended_and_drained() {
        let scheduler = immediate(&ManualClock::new());
        let done = Arc::new(Mutex::new(None));
        scheduler.suspend();
        let sink = Arc::clone(&done);
        scheduler
            .shutdown(move |r: Result<(), SchedulerError>| *sink.lock() = Some(r))
            .unwrap();
        assert_eq!(*done.lock(), Some(Ok(())));
        assert!(scheduler.is_shut_down());
    }

    #[test]
    fn test_panic_in_apply_is_reported() {
        let scheduler = immediate(&ManualClock::new());
        let seen: Seen = Arc::default();
        scheduler
            .schedule(|_cb: BoxCallback<u32>| panic!("exploded"), recorder(&seen))
            .unwrap();
        scheduler
            .schedule(|cb: BoxCallback<u32>| cb.on_success(3), recorder(&seen))
            .unwrap();

        let seen = seen.lock();
        assert!(seen[0].as_ref().unwrap_err().contains("exploded"));
        assert_eq!(seen[1], Ok(3));
    }

    #[test]
    fn test_metrics_accumulate_runtime() {
        let clock = ManualClock::new();
        let config = SchedulerConfig::new().with_metrics(true);
        let scheduler = SequentialOperationScheduler::with_config(
            "metered",
            &config,
            Arc::new(ImmediateConcurrency::with_manual_clock(clock.clone())),
        )
        .unwrap();
        let pending: Pending = Arc::default();
        let seen: Seen = Arc::default();

        scheduler.schedule(parked(&pending), recorder(&seen)).unwrap();
        clock.advance(Duration::from_millis(25));
        let cb = pending.lock().remove(0);
        cb.on_success(1);
        assert_eq!(scheduler.total_runtime(), Duration::from_millis(25));
    }

    #[test]
    fn test_synchronous_backlog_drains_without_deep_stack() {
        let scheduler = immediate(&ManualClock::new());
        let started = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        scheduler.suspend();
        for i in 0..100_000_u32 {
            let started = Arc::clone(&started);
            let delivered = Arc::clone(&delivered);
            scheduler
                .schedule(
                    move |cb: BoxCallback<u32>| {
                        // Strict FIFO: the i-th start sees exactly i earlier starts.
                        assert_eq!(started.fetch_add(1, Ordering::SeqCst), i as usize);
                        cb.on_success(i);
                    },
                    move |_r: Result<u32, OperationError>| {
                        delivered.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }
        scheduler.resume();

        assert_eq!(delivered.load(Ordering::SeqCst), 100_000);
        assert_eq!(scheduler.scheduled_count(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_schedule_from_inside_apply_runs_after_current() {
        let scheduler = immediate(&ManualClock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler.clone();
        let outer_order = Arc::clone(&order);
        scheduler
            .schedule(
                move |cb: BoxCallback<u32>| {
                    let inner_order = Arc::clone(&outer_order);
                    handle
                        .schedule(
                            move |cb: BoxCallback<u32>| {
                                inner_order.lock().push("inner");
                                cb.on_success(2);
                            },
                            |_r: Result<u32, OperationError>| {},
                        )
                        .unwrap();
                    outer_order.lock().push("outer");
                    cb.on_success(1);
                },
                |_r: Result<u32, OperationError>| {},
            )
            .unwrap();

        assert_eq!(*order.lock(), vec!["outer", "inner"]);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    /// Inline executor whose shutdown is logged and reports a fixed outcome.
    struct ScriptedExecutor {
        name: String,
        outcome: Result<(), SchedulerError>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Executor for ScriptedExecutor {
        fn execute(&self, job: Job) -> Result<(), Job> {
            run_job(job, &self.name);
            Ok(())
        }

        fn shutdown(&self, on_done: ShutdownCallback) {
            self.log.lock().push(self.name.clone());
            on_done(self.outcome.clone());
        }

        fn is_shut_down(&self) -> bool {
            false
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct ScriptedConcurrency {
        operations: Result<(), SchedulerError>,
        callbacks: Result<(), SchedulerError>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Concurrency for ScriptedConcurrency {
        fn new_single_thread_executor(&self, name: &str) -> Arc<dyn Executor> {
            Arc::new(ScriptedExecutor {
                name: name.to_string(),
                outcome: self.operations.clone(),
                log: Arc::clone(&self.log),
            })
        }

        fn new_parallel_executor(&self, _max_parallel: usize, name: &str) -> Arc<dyn Executor> {
            Arc::new(ScriptedExecutor {
                name: name.to_string(),
                outcome: self.callbacks.clone(),
                log: Arc::clone(&self.log),
            })
        }

        fn now(&self) -> std::time::Instant {
            std::time::Instant::now()
        }
    }

    fn shutdown_with(
        operations: Result<(), SchedulerError>,
        callbacks: Result<(), SchedulerError>,
    ) -> (Vec<String>, Option<Result<(), SchedulerError>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let concurrency = ScriptedConcurrency {
            operations,
            callbacks,
            log: Arc::clone(&log),
        };
        let scheduler = SequentialOperationScheduler::new("scripted", Arc::new(concurrency));
        let done = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&done);
        scheduler
            .shutdown(move |r: Result<(), SchedulerError>| *sink.lock() = Some(r))
            .unwrap();
        assert!(scheduler.is_shut_down());
        let order = log.lock().clone();
        let result = done.lock().take();
        (order, result)
    }

    #[test]
    fn test_shutdown_stops_operation_executor_first() {
        let (order, result) = shutdown_with(Ok(()), Ok(()));
        assert_eq!(order, vec!["scripted-operations", "scripted-callbacks"]);
        assert_eq!(result, Some(Ok(())));
    }

    #[test]
    fn test_shutdown_reports_first_executor_error() {
        let ops_err = SchedulerError::ExecutorShutdown("operations stuck".into());
        let cb_err = SchedulerError::ExecutorShutdown("callbacks stuck".into());

        let (order, result) = shutdown_with(Err(ops_err.clone()), Err(cb_err.clone()));
        assert_eq!(order, vec!["scripted-operations", "scripted-callbacks"]);
        assert_eq!(result, Some(Err(ops_err)));

        let (_, result) = shutdown_with(Ok(()), Err(cb_err.clone()));
        assert_eq!(result, Some(Err(cb_err)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SchedulerConfig::new().with_callback_threads(0);
        let result = SequentialOperationScheduler::with_config("bad", &config, Arc::new(ImmediateConcurrency::new()));
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }
}
