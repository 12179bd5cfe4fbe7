//! Error types for scheduler operations.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::task::TaskId;

/// Errors produced by the scheduler façade and the task registry.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// `start` was called before a metric manager was bound.
    #[error("metric manager is not set")]
    MetricManagerNotSet,
    /// A task was requested while the scheduler is stopped.
    #[error("scheduler is not started")]
    NotStarted,
    /// `start` was called outside of a Tokio runtime.
    #[error("no tokio runtime available to drive tasks")]
    RuntimeUnavailable,
    /// The schedule failed its own validation.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
    /// Subscribing a metric failed.
    #[error("subscription to {metric} failed: {source}")]
    Subscription {
        /// Namespace of the metric.
        metric: String,
        /// Error reported by the metric manager.
        source: MetricError,
    },
    /// A compensating unsubscribe failed; the subscription may have leaked.
    #[error("unsubscribe of {metric} failed: {source}")]
    Unsubscription {
        /// Namespace of the metric.
        metric: String,
        /// Error reported by the metric manager.
        source: MetricError,
    },
    /// The registry already holds a task with this identifier.
    #[error("task with id '{0}' already exists")]
    DuplicateTask(TaskId),
    /// No task is registered under this identifier.
    #[error("no task with id '{0}'")]
    TaskNotFound(TaskId),
    /// Configuration values failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Validation failures reported by a [`Schedule`](super::schedule::Schedule).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Interval must be greater than zero.
    #[error("interval must be greater than zero")]
    ZeroInterval,
    /// The window closes before now.
    #[error("stop time is in the past")]
    StopInPast,
    /// The window closes before it opens.
    #[error("stop time is not after start time")]
    StopBeforeStart,
    /// The cron expression could not be parsed.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron {
        /// Expression as supplied.
        expression: String,
        /// Parser message.
        reason: String,
    },
}

/// Errors reported by a [`MetricManager`](super::metric::MetricManager).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricError {
    /// A config key the metric depends on is absent.
    #[error("missing config key: {0}")]
    MissingConfigKey(String),
    /// No provider advertises the metric.
    #[error("metric not found: {0}")]
    NotFound(String),
    /// Collection from the provider failed.
    #[error("collection failed: {0}")]
    Collection(String),
    /// A processing or publishing plugin failed.
    #[error("plugin failed: {0}")]
    Plugin(String),
    /// Any other provider failure.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by [`WorkManager::work`](super::work_manager::WorkManager::work).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    /// Every queue slot is taken; the job was not accepted.
    #[error("work queue is full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity at the time of rejection.
        capacity: usize,
    },
    /// The work manager has been stopped.
    #[error("work manager has been stopped")]
    Stopped,
    /// The worker holding the job went away before returning it.
    #[error("job was dropped before completion")]
    Dropped,
    /// Pool or queue sizing was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures recorded while a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Collecting the subscribed metrics failed.
    #[error("collect: {0}")]
    Collection(MetricError),
    /// A process node failed.
    #[error("process node {plugin}: {source}")]
    Process {
        /// Plugin name of the failing node.
        plugin: String,
        /// Error reported by the plugin.
        source: MetricError,
    },
    /// A publish node failed.
    #[error("publish node {plugin}: {source}")]
    Publish {
        /// Plugin name of the failing node.
        plugin: String,
        /// Error reported by the plugin.
        source: MetricError,
    },
    /// The job exceeded its execution timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    /// The job payload panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Aggregate of every error encountered while creating a task.
///
/// Returned in place of a task; never empty when returned.
#[derive(Debug, Clone, Default)]
pub struct TaskErrors {
    errors: Vec<SchedulerError>,
}

impl TaskErrors {
    /// Create an empty aggregate.
    #[must_use]
    pub const fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Errors in the order they were encountered.
    #[must_use]
    pub fn errors(&self) -> &[SchedulerError] {
        &self.errors
    }

    /// Append an error.
    pub fn push(&mut self, err: SchedulerError) {
        self.errors.push(err);
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Consume the aggregate and return the errors.
    #[must_use]
    pub fn into_errors(self) -> Vec<SchedulerError> {
        self.errors
    }
}

impl From<SchedulerError> for TaskErrors {
    fn from(err: SchedulerError) -> Self {
        Self { errors: vec![err] }
    }
}

impl Extend<SchedulerError> for TaskErrors {
    fn extend<I: IntoIterator<Item = SchedulerError>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

impl fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task creation failed with {} error(s)", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskErrors {}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
