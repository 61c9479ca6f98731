//! Builders to construct schedulers, guards and access threads from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::SchedulerBuilder;
