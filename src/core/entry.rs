//! Bookkeeping record pairing an operation with its callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::callback::Resolve;
use super::error::OperationError;

/// Process-unique identity of an operation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Allocate the next identity.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Starts the typed operation once the entry is dispatched.
pub(crate) type Launch = Box<dyn FnOnce() + Send + 'static>;

/// An operation waiting in a queue or in flight.
///
/// The typed operation and callback are erased behind `launch` and
/// `resolver`; identity is carried by `id`.
pub(crate) struct OperationEntry {
    pub(crate) id: EntryId,
    pub(crate) label: String,
    pub(crate) enqueued_at: Instant,
    pub(crate) launch: Launch,
    pub(crate) resolver: Arc<dyn Resolve>,
}

impl fmt::Debug for OperationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationEntry")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

/// The part of an entry that stays behind once it has been launched.
#[derive(Clone)]
pub(crate) struct InFlight {
    pub(crate) id: EntryId,
    pub(crate) label: String,
    pub(crate) started_at: Instant,
    pub(crate) resolver: Arc<dyn Resolve>,
}

impl InFlight {
    /// Time in flight as of `now`.
    pub(crate) fn elapsed(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Force-fail the callback with a timeout.
    pub(crate) fn expire(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.resolver.fail(OperationError::Timeout {
            label: self.label.clone(),
            elapsed: self.elapsed(now),
            timeout,
        })
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
