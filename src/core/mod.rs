//! Sequencing, single-flight draining and timeout enforcement.

pub mod access_thread;
pub mod callback;
pub mod entry;
pub mod error;
pub mod scheduler;
pub mod timeout_guard;

pub use access_thread::{
    QueueWorker, QueueWorkerView, SingleInstanceThread, SingleInstanceView, ThreadSpace, ThreadSpaceView,
    WorkerAccessThread,
};
pub use callback::{BoxCallback, Callback, Operation, Step};
pub use entry::EntryId;
pub use error::{OperationError, SchedulerError};
pub use scheduler::{SchedulerState, SequentialOperationScheduler};
pub use timeout_guard::ConcurrentTimeoutGuard;
