//! # Op Sequencer
//!
//! Callback-driven concurrency primitives for code that talks to resources
//! which must not be used concurrently, or which may stall.
//!
//! ## Components
//!
//! - **[`SequentialOperationScheduler`](core::SequentialOperationScheduler)**:
//!   runs asynchronous operations strictly one at a time in FIFO order. An
//!   operation that outlives the timeout is force-failed so the queue keeps
//!   moving; its late result is never delivered twice.
//! - **[`WorkerAccessThread`](core::WorkerAccessThread)**: a single-flight
//!   drain loop that processes queued steps in batches under one lock.
//! - **[`ConcurrentTimeoutGuard`](core::ConcurrentTimeoutGuard)**: applies a
//!   shared timeout to unordered, concurrently running operations.
//!
//! All three take their threads and clock from an injected
//! [`Concurrency`](concurrency::Concurrency) provider: OS threads, an inline
//! deterministic provider for tests, or tokio (feature `tokio-runtime`).
//!
//! ```
//! use std::sync::Arc;
//! use op_sequencer::concurrency::ThreadConcurrency;
//! use op_sequencer::core::{BoxCallback, OperationError, SequentialOperationScheduler};
//!
//! let scheduler = SequentialOperationScheduler::new("db", Arc::new(ThreadConcurrency::new()));
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! scheduler
//!     .schedule(
//!         |done: BoxCallback<u32>| done.on_success(1),
//!         move |result: Result<u32, OperationError>| {
//!             let _ = tx.send(result.is_ok());
//!         },
//!     )
//!     .unwrap();
//! assert!(rx.recv().unwrap());
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Sequencing, single-flight draining and timeout enforcement.
pub mod core;
/// Injected executors and clock.
pub mod concurrency;
/// Configuration models for schedulers and guards.
pub mod config;
/// Builders to construct components from configuration.
pub mod builders;
/// Runtime adapters for async hosts.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
