//! Integration tests for WorkerAccessThread on real threads

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use op_sequencer::concurrency::ThreadConcurrency;
use op_sequencer::core::{QueueWorker, SchedulerError, SingleInstanceThread, ThreadSpace, WorkerAccessThread};
use op_sequencer::util::init_test_tracing;
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

fn threaded(name: &str) -> WorkerAccessThread {
    init_test_tracing();
    WorkerAccessThread::new(name, Arc::new(ThreadConcurrency::new()))
}

/// Block until the worker reports idle with an empty queue.
fn wait_idle(worker: &WorkerAccessThread) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    worker.add_all_operations_done_listener(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(WAIT).expect("worker went idle");
}

fn shutdown_and_wait(worker: &WorkerAccessThread) -> Result<(), SchedulerError> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    worker
        .shutdown(move |r: Result<(), SchedulerError>| {
            let _ = tx.send(r);
        })
        .unwrap();
    rx.recv_timeout(WAIT).expect("shutdown callback")
}

#[test]
fn test_five_offers_drain_in_order_without_overlap() {
    let worker = threaded("scenario-b");
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    for i in 0..5 {
        let order = Arc::clone(&order);
        let active = Arc::clone(&active);
        let overlapped = Arc::clone(&overlapped);
        worker.offer(move || {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            order.lock().push(i);
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }
    assert!(order.lock().is_empty());

    worker.start_if_required();
    wait_idle(&worker);

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    assert!(!overlapped.load(Ordering::SeqCst));
    assert!(shutdown_and_wait(&worker).is_ok());
}

#[test]
fn test_concurrent_offers_processed_exactly_once() {
    let worker = threaded("producers");
    let processed = Arc::new(AtomicUsize::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let worker = worker.clone();
            let processed = Arc::clone(&processed);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..50 {
                    let processed = Arc::clone(&processed);
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    worker.offer(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        processed.fetch_add(1, Ordering::SeqCst);
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                    worker.start_if_required();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(shutdown_and_wait(&worker).is_ok());
    assert_eq!(processed.load(Ordering::SeqCst), 200);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn test_steps_run_holding_drain_lock() {
    let worker = threaded("locked");
    let inside = Arc::new(Mutex::new(None));
    let probe = worker.clone();
    let sink = Arc::clone(&inside);
    worker.offer(move || {
        *sink.lock() = Some((probe.has_mutex(), thread::current().name().map(str::to_string)));
    });
    worker.start_if_required();
    wait_idle(&worker);

    let (held, thread_name) = inside.lock().take().unwrap();
    assert!(held);
    assert_eq!(thread_name.as_deref(), Some("locked-0"));
    assert!(!worker.has_mutex());
}

#[test]
fn test_offer_after_shutdown_runs_inline() {
    let worker = threaded("closed");
    assert!(shutdown_and_wait(&worker).is_ok());
    assert!(worker.is_shut_down());

    let caller = thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&ran_on);
    worker.offer(move || *sink.lock() = Some(thread::current().id()));
    assert_eq!(*ran_on.lock(), Some(caller));
    assert_eq!(worker.queued_count(), 0);
}

#[test]
fn test_shutdown_drains_pending_steps() {
    let worker = threaded("draining");
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let count = Arc::clone(&count);
        worker.offer(move || {
            thread::sleep(Duration::from_millis(1));
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(shutdown_and_wait(&worker).is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert!(matches!(
        worker.shutdown(|_r: Result<(), SchedulerError>| {}),
        Err(SchedulerError::ShutdownAlreadyRequested(_))
    ));
}

#[test]
fn test_views_forward_to_one_worker() {
    let worker = threaded("views");
    let count = Arc::new(AtomicUsize::new(0));

    let space = worker.as_thread_space();
    let queue = worker.as_queue_worker();
    for _ in 0..3 {
        let c = Arc::clone(&count);
        space.add(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = Arc::clone(&count);
        queue.offer(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
    }
    space.process_steps();
    wait_idle(&worker);
    assert_eq!(count.load(Ordering::SeqCst), 6);

    let thread_view = worker.as_single_instance_thread();
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread_view
        .stop(Box::new(move |r: Result<(), SchedulerError>| {
            let _ = tx.send(r);
        }))
        .unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert!(!thread_view.is_running());
}
