//! Scheduler and timeout-guard configuration structures.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix of the environment variables read by `from_env`.
pub const ENV_PREFIX: &str = "OP_SEQUENCER_";

/// Default per-operation budget, in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default parallelism of the callback-execution pool.
const DEFAULT_CALLBACK_THREADS: usize = 5;

/// Settings for a [`SequentialOperationScheduler`](crate::core::SequentialOperationScheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time an operation may stay in flight before it is force-failed.
    pub timeout_ms: u64,
    /// Run operations on the scheduler's own thread instead of the caller's.
    pub enforce_own_thread: bool,
    /// Maximum parallelism for delivering user callbacks.
    pub callback_threads: usize,
    /// Emit per-operation debug events.
    pub trace: bool,
    /// Accumulate operation runtime, reported at shutdown.
    pub metrics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            enforce_own_thread: false,
            callback_threads: DEFAULT_CALLBACK_THREADS,
            trace: false,
            metrics: false,
        }
    }
}

impl SchedulerConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Run operations on the scheduler-owned thread.
    #[must_use]
    pub const fn with_enforce_own_thread(mut self, value: bool) -> Self {
        self.enforce_own_thread = value;
        self
    }

    /// Set the callback pool parallelism.
    #[must_use]
    pub const fn with_callback_threads(mut self, threads: usize) -> Self {
        self.callback_threads = threads;
        self
    }

    /// Enable per-operation tracing.
    #[must_use]
    pub const fn with_trace(mut self, value: bool) -> Self {
        self.trace = value;
        self
    }

    /// Enable runtime accounting.
    #[must_use]
    pub const fn with_metrics(mut self, value: bool) -> Self {
        self.metrics = value;
        self
    }

    /// Timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".into());
        }
        if self.callback_threads == 0 {
            return Err("callback_threads must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read `OP_SEQUENCER_*` variables (loading `.env` if present) over the defaults.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; keys carry the `OP_SEQUENCER_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, "TIMEOUT_MS")? {
            cfg.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "ENFORCE_OWN_THREAD")? {
            cfg.enforce_own_thread = v;
        }
        if let Some(v) = parse_var(&lookup, "CALLBACK_THREADS")? {
            cfg.callback_threads = v;
        }
        if let Some(v) = parse_var(&lookup, "TRACE")? {
            cfg.trace = v;
        }
        if let Some(v) = parse_var(&lookup, "METRICS")? {
            cfg.metrics = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Settings for a [`ConcurrentTimeoutGuard`](crate::core::ConcurrentTimeoutGuard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Time an operation may stay in flight before it is reaped.
    pub timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl GuardConfig {
    /// Guard configuration with the given timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout_ms: duration_to_ms(timeout),
        }
    }

    /// Timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_var<T, F>(lookup: &F, suffix: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    lookup(&key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| format!("{key}: invalid value `{raw}`: {e}"))
        })
        .transpose()
}
