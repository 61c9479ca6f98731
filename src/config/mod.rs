//! Configuration models for schedulers, guards and timeouts.

pub mod scheduler;

pub use scheduler::{GuardConfig, SchedulerConfig, ENV_PREFIX};
