//! Runtime adapters for async hosts.

pub mod tokio_executor;

pub use tokio_executor::{TokioConcurrency, TokioExecutor};
