//! Builder assembling components that share one concurrency provider.

use std::sync::Arc;
use std::time::Duration;

use crate::concurrency::{Concurrency, ThreadConcurrency};
use crate::config::{GuardConfig, SchedulerConfig};
use crate::core::{ConcurrentTimeoutGuard, SchedulerError, SequentialOperationScheduler, WorkerAccessThread};

/// Build a scheduler (and companions) from configuration.
///
/// Without an explicit provider, components run on [`ThreadConcurrency`].
///
/// ```
/// use std::time::Duration;
/// use op_sequencer::builders::SchedulerBuilder;
///
/// let scheduler = SchedulerBuilder::new("db")
///     .with_timeout(Duration::from_millis(500))
///     .with_callback_threads(2)
///     .build()
///     .unwrap();
/// assert_eq!(scheduler.timeout(), Duration::from_millis(500));
/// ```
#[derive(Clone)]
pub struct SchedulerBuilder {
    owner: String,
    config: SchedulerConfig,
    concurrency: Option<Arc<dyn Concurrency>>,
}

impl Default for SchedulerBuilder {
    /// Builder for an anonymous scheduler named `scheduler-<uuid prefix>`.
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("scheduler-{}", &id[..8]))
    }
}

impl SchedulerBuilder {
    /// Builder with default configuration. `owner` names the scheduler's executors.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            config: SchedulerConfig::default(),
            concurrency: None,
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this provider for executors and time.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: Arc<dyn Concurrency>) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    /// Callback pool parallelism.
    #[must_use]
    pub fn with_callback_threads(mut self, threads: usize) -> Self {
        self.config = self.config.with_callback_threads(threads);
        self
    }

    /// Run operations on the scheduler-owned thread.
    #[must_use]
    pub fn with_enforce_own_thread(mut self, value: bool) -> Self {
        self.config = self.config.with_enforce_own_thread(value);
        self
    }

    /// Per-operation debug events.
    #[must_use]
    pub fn with_trace(mut self, value: bool) -> Self {
        self.config = self.config.with_trace(value);
        self
    }

    /// Runtime accounting.
    #[must_use]
    pub fn with_metrics(mut self, value: bool) -> Self {
        self.config = self.config.with_metrics(value);
        self
    }

    /// Configuration the scheduler will be built with.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Build the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] if validation fails.
    pub fn build(&self) -> Result<SequentialOperationScheduler, SchedulerError> {
        SequentialOperationScheduler::with_config(self.owner.clone(), &self.config, self.provider())
    }

    /// Build a timeout guard on the same provider.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] if validation fails.
    pub fn build_guard(&self, config: &GuardConfig) -> Result<ConcurrentTimeoutGuard, SchedulerError> {
        ConcurrentTimeoutGuard::with_config(config, self.provider())
    }

    /// Build an access thread on the same provider, named `{owner}-{suffix}`.
    #[must_use]
    pub fn build_access_thread(&self, suffix: &str) -> WorkerAccessThread {
        WorkerAccessThread::new(format!("{}-{suffix}", self.owner), self.provider())
    }

    fn provider(&self) -> Arc<dyn Concurrency> {
        self.concurrency
            .clone()
            .unwrap_or_else(|| Arc::new(ThreadConcurrency::new()))
    }
}
