//! Work manager and scheduler configuration structures.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Environment key for the worker count.
pub const ENV_POOL_SIZE: &str = "METRIC_SCHEDULER_POOL_SIZE";
/// Environment key for the queue capacity.
pub const ENV_QUEUE_SIZE: &str = "METRIC_SCHEDULER_QUEUE_SIZE";
/// Environment key for the default job timeout in seconds.
pub const ENV_JOB_TIMEOUT_SECS: &str = "METRIC_SCHEDULER_JOB_TIMEOUT_SECS";
/// Environment key for the default consecutive-failure threshold.
pub const ENV_FAILURE_THRESHOLD: &str = "METRIC_SCHEDULER_FAILURE_THRESHOLD";

const DEFAULT_QUEUE_DEPTH: usize = 100;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

const fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

const fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

const fn default_job_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkManagerConfig {
    /// Number of worker threads; bounds parallelism.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Jobs allowed to wait for a worker; bounds buffering.
    #[serde(default = "default_queue_depth")]
    pub max_queue_depth: usize,
    /// Stack size of each worker thread in bytes.
    #[serde(default = "default_stack_size")]
    pub thread_stack_size: usize,
}

impl Default for WorkManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkManagerConfig {
    /// One worker per CPU and a queue of 100.
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_queue_depth: DEFAULT_QUEUE_DEPTH,
            thread_stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, thread_stack_size: usize) -> Self {
        self.thread_stack_size = thread_stack_size;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Defaults applied to every task unless overridden by a task option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefaults {
    /// Execution timeout for each job, in seconds.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Disable a task after this many consecutive failed runs. `None` never disables.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            failure_threshold: None,
        }
    }
}

impl TaskDefaults {
    /// Job timeout as a [`Duration`].
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.job_timeout_secs == 0 {
            return Err("job_timeout_secs must be greater than 0".into());
        }
        if self.failure_threshold == Some(0) {
            return Err("failure_threshold must be greater than 0 when set".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool sizing.
    #[serde(default)]
    pub work: WorkManagerConfig,
    /// Per-task defaults.
    #[serde(default)]
    pub tasks: TaskDefaults,
}

impl SchedulerConfig {
    /// Default configuration with the given pool and queue sizes.
    #[must_use]
    pub fn with_sizes(pool_size: usize, queue_size: usize) -> Self {
        Self {
            work: WorkManagerConfig::new()
                .with_worker_count(pool_size)
                .with_max_queue_depth(queue_size),
            tasks: TaskDefaults::default(),
        }
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// A message naming the section and field.
    pub fn validate(&self) -> Result<(), String> {
        self.work.validate().map_err(|e| format!("work: {e}"))?;
        self.tasks.validate().map_err(|e| format!("tasks: {e}"))?;
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from the process environment, loading `.env` first
    /// when present. Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// A key that does not parse, or a resulting configuration that fails validation.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// A key that does not parse, or a resulting configuration that fails validation.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_POOL_SIZE) {
            cfg.work.worker_count = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_POOL_SIZE}={v}"))?;
        }
        if let Some(v) = lookup(ENV_QUEUE_SIZE) {
            cfg.work.max_queue_depth = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_QUEUE_SIZE}={v}"))?;
        }
        if let Some(v) = lookup(ENV_JOB_TIMEOUT_SECS) {
            cfg.tasks.job_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_JOB_TIMEOUT_SECS}={v}"))?;
        }
        if let Some(v) = lookup(ENV_FAILURE_THRESHOLD) {
            cfg.tasks.failure_threshold = Some(
                v.trim()
                    .parse()
                    .with_context(|| format!("{ENV_FAILURE_THRESHOLD}={v}"))?,
            );
        }
        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("scheduler configuration from environment")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.work.worker_count >= 1);
        assert_eq!(cfg.tasks.job_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_lookup_reads_every_key() {
        let env: HashMap<&str, &str> = [
            (ENV_POOL_SIZE, "3"),
            (ENV_QUEUE_SIZE, " 7 "),
            (ENV_JOB_TIMEOUT_SECS, "5"),
            (ENV_FAILURE_THRESHOLD, "2"),
        ]
        .into_iter()
        .collect();
        let cfg = SchedulerConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(cfg.work.worker_count, 3);
        assert_eq!(cfg.work.max_queue_depth, 7);
        assert_eq!(cfg.tasks.job_timeout_secs, 5);
        assert_eq!(cfg.tasks.failure_threshold, Some(2));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = SchedulerConfig::from_lookup(|k| {
            (k == ENV_POOL_SIZE).then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains(ENV_POOL_SIZE));
    }

    #[test]
    fn test_from_lookup_rejects_zero_pool() {
        assert!(SchedulerConfig::from_lookup(|k| {
            (k == ENV_POOL_SIZE).then(|| "0".to_string())
        })
        .is_err());
    }
}
