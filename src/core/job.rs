//! Units of work executed by the [`WorkManager`](super::work_manager::WorkManager).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::JobError;
use super::metric::{MetricManager, MetricType};
use super::task::TaskId;
use super::workflow::TaskWorkflow;

/// Work carried by a [`Job`].
///
/// Workers call [`run`](Self::run) exactly once, from a worker thread with its
/// own single-threaded runtime.
#[async_trait]
pub trait JobPayload: Send + 'static {
    /// Do the work.
    ///
    /// # Errors
    ///
    /// Every failure encountered; an empty run is a success.
    async fn run(&mut self) -> Result<(), Vec<JobError>>;
}

/// What happened when a job ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// When a worker picked the job up.
    pub started_at: DateTime<Utc>,
    /// When the worker finished it.
    pub finished_at: DateTime<Utc>,
    /// Failures, in order. Empty on success.
    pub errors: Vec<JobError>,
}

impl JobOutcome {
    /// True when the run produced no errors.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One execution of a task's workflow.
pub struct Job {
    id: Uuid,
    task_id: TaskId,
    created_at: DateTime<Utc>,
    timeout: Duration,
    payload: Box<dyn JobPayload>,
    outcome: Option<JobOutcome>,
}

impl Job {
    /// Wrap `payload` for submission on behalf of `task_id`.
    #[must_use]
    pub fn new(task_id: TaskId, timeout: Duration, payload: Box<dyn JobPayload>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            created_at: Utc::now(),
            timeout,
            payload,
            outcome: None,
        }
    }

    /// Unique job identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Task that submitted this job.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// When the job was built.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Execution timeout enforced by the worker.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Outcome, once a worker has run the job.
    #[must_use]
    pub const fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Take the outcome out of the job.
    pub fn take_outcome(&mut self) -> Option<JobOutcome> {
        self.outcome.take()
    }

    pub(crate) fn payload_mut(&mut self) -> &mut dyn JobPayload {
        self.payload.as_mut()
    }

    pub(crate) fn set_outcome(&mut self, outcome: JobOutcome) {
        self.outcome = Some(outcome);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// Collects a task's subscribed metrics and runs them through its workflow.
pub struct CollectJob {
    manager: Arc<dyn MetricManager>,
    metrics: Arc<[MetricType]>,
    workflow: Arc<TaskWorkflow>,
    timeout: Duration,
}

impl CollectJob {
    /// Build the payload for one firing.
    #[must_use]
    pub fn new(
        manager: Arc<dyn MetricManager>,
        metrics: Arc<[MetricType]>,
        workflow: Arc<TaskWorkflow>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            metrics,
            workflow,
            timeout,
        }
    }
}

#[async_trait]
impl JobPayload for CollectJob {
    async fn run(&mut self) -> Result<(), Vec<JobError>> {
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let collected = self
            .manager
            .collect_metrics(&self.metrics, deadline)
            .await
            .map_err(|errs| errs.into_iter().map(JobError::Collection).collect::<Vec<_>>())?;
        self.workflow.run(self.manager.as_ref(), collected).await
    }
}
