//! Configuration models for the scheduler and its work manager.

pub mod pool;

pub use pool::{SchedulerConfig, TaskDefaults, WorkManagerConfig};
