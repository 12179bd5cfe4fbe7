//! # Metric Scheduler
//!
//! Task scheduling for metric collection: subscribe metrics, fire them on a
//! schedule, and run the collected values through a processing and
//! publishing workflow on a bounded worker pool.
//!
//! The [`Scheduler`](core::Scheduler) is a transactional front door. A task is
//! only created when every requested metric subscribes; otherwise every
//! subscription made along the way is withdrawn and all errors are reported
//! together.
//!
//! ## Key Features
//!
//! - **All-or-nothing task creation**: subscriptions are compensated in reverse on failure
//! - **Pluggable schedules**: fixed interval, windowed interval, and cron
//! - **Bounded work manager**: dedicated OS threads, bounded queue, explicit `QueueFull`
//! - **Per-job timeouts and panic isolation**: a bad job never takes a worker down
//! - **Runtime resizing**: pool and queue sizes can change while running
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use metric_scheduler::core::{
//!     ConfigDataTree, MetricType, Scheduler, SimpleSchedule, TaskOption, WorkflowMap,
//! };
//!
//! let scheduler = Scheduler::new(4, 100)?;
//! scheduler.set_metric_manager(Arc::new(my_metric_manager));
//! scheduler.start()?;
//!
//! let task = scheduler.create_task(
//!     &[MetricType::new("cpu/usage")],
//!     Box::new(SimpleSchedule::new(Duration::from_secs(10))),
//!     &ConfigDataTree::new(),
//!     &WorkflowMap::default(),
//!     vec![TaskOption::Name("cpu".into())],
//! )?;
//! println!("task {} is {:?}", task.id(), task.state());
//! ```
//!
//! For complete examples, see `tests/scheduler_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: tasks, schedules, workflows and the work manager.
pub mod core;
/// Configuration models for the scheduler, work manager and task defaults.
pub mod config;
/// Runtime adapters used to drive armed tasks.
pub mod runtime;
/// Shared utilities.
pub mod util;
