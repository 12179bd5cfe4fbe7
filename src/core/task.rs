//! Scheduled tasks and the driver loop that fires them.
//!
//! A [`Task`] is a confirmed set of metric subscriptions bound to a
//! [`Schedule`] and a workflow snapshot. Once armed, a driver future sleeps
//! until the schedule's next firing, submits one [`Job`] to the shared
//! [`WorkManager`], waits for it to come back, and records what happened.
//! Firings of one task never overlap.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::TaskDefaults;
use crate::runtime::Spawn;

use super::error::{JobError, WorkError};
use super::job::{CollectJob, Job};
use super::metric::{MetricManager, MetricType};
use super::schedule::{Schedule, ScheduleState};
use super::work_manager::WorkManager;
use super::workflow::TaskWorkflow;

/// Task identifier. Assigned at registration, starting at 1.
pub type TaskId = u64;

/// Run state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed but not armed.
    Stopped,
    /// Armed and waiting for the next firing.
    Running,
    /// A job is queued or executing.
    Firing,
    /// Terminal; the driver has exited or will exit.
    Disabled,
}

/// Per-task overrides passed to `create_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOption {
    /// Human-readable name.
    Name(String),
    /// Execution timeout for each job of this task.
    Deadline(Duration),
    /// Disable the task after this many consecutive failed runs.
    StopOnFailure(u32),
}

/// How a single firing ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job ran without errors.
    Success,
    /// The job ran and reported errors.
    Failed(Vec<JobError>),
    /// The work manager refused the job.
    Rejected(WorkError),
}

/// Record of the most recent firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRun {
    /// When the driver fired.
    pub fired_at: DateTime<Utc>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
    /// What happened.
    pub outcome: RunOutcome,
}

/// Snapshot of a task's run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Firings, including rejected ones.
    pub hits: u64,
    /// Intervals skipped because a firing overran.
    pub misses: u64,
    /// Runs that reported errors.
    pub failures: u64,
    /// Failed runs since the last success.
    pub consecutive_failures: u32,
    /// Firings the work manager refused.
    pub rejections: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    rejections: AtomicU64,
}

/// A registered, schedulable unit of metric collection.
pub struct Task {
    id: OnceLock<TaskId>,
    name: Option<String>,
    created_at: DateTime<Utc>,
    schedule: Box<dyn Schedule>,
    subscriptions: Arc<[MetricType]>,
    workflow: Arc<TaskWorkflow>,
    deadline: Duration,
    failure_threshold: Option<u32>,
    manager: Arc<dyn MetricManager>,
    work: Arc<WorkManager>,
    state: Mutex<TaskState>,
    last_run: Mutex<Option<LastRun>>,
    stats: StatCounters,
    stop: Notify,
}

impl Task {
    /// Build a stopped, unregistered task from confirmed subscriptions.
    pub(crate) fn new(
        schedule: Box<dyn Schedule>,
        subscriptions: Vec<MetricType>,
        workflow: TaskWorkflow,
        manager: Arc<dyn MetricManager>,
        work: Arc<WorkManager>,
        defaults: &TaskDefaults,
        options: Vec<TaskOption>,
    ) -> Self {
        let mut name = None;
        let mut deadline = defaults.job_timeout();
        let mut failure_threshold = defaults.failure_threshold;
        for option in options {
            match option {
                TaskOption::Name(n) => name = Some(n),
                TaskOption::Deadline(d) => deadline = d,
                TaskOption::StopOnFailure(n) => failure_threshold = Some(n),
            }
        }

        Self {
            id: OnceLock::new(),
            name,
            created_at: Utc::now(),
            schedule,
            subscriptions: subscriptions.into(),
            workflow: Arc::new(workflow),
            deadline,
            failure_threshold: failure_threshold.filter(|n| *n > 0),
            manager,
            work,
            state: Mutex::new(TaskState::Stopped),
            last_run: Mutex::new(None),
            stats: StatCounters::default(),
            stop: Notify::new(),
        }
    }

    /// Identifier, or 0 before the task is registered.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id.get().copied().unwrap_or_default()
    }

    pub(crate) fn assigned_id(&self) -> Option<TaskId> {
        self.id.get().copied()
    }

    /// Set the identifier if none is set yet; returns the identifier in effect.
    pub(crate) fn assign_id(&self, id: TaskId) -> TaskId {
        *self.id.get_or_init(|| id)
    }

    /// Optional name from [`TaskOption::Name`].
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Trigger policy.
    #[must_use]
    pub fn schedule(&self) -> &dyn Schedule {
        self.schedule.as_ref()
    }

    /// Confirmed subscriptions, in request order.
    #[must_use]
    pub fn subscriptions(&self) -> &[MetricType] {
        &self.subscriptions
    }

    /// Workflow snapshot taken at creation.
    #[must_use]
    pub fn workflow(&self) -> &TaskWorkflow {
        &self.workflow
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Execution timeout applied to each job.
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Consecutive failures that disable the task, if any.
    #[must_use]
    pub const fn failure_threshold(&self) -> Option<u32> {
        self.failure_threshold
    }

    /// The most recent firing, if any.
    #[must_use]
    pub fn last_run(&self) -> Option<LastRun> {
        self.last_run.lock().clone()
    }

    /// Current run counters.
    #[must_use]
    pub fn stats(&self) -> TaskStats {
        TaskStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            consecutive_failures: self.stats.consecutive_failures.load(Ordering::Relaxed),
            rejections: self.stats.rejections.load(Ordering::Relaxed),
        }
    }

    /// Move to `Disabled` and stop the driver.
    ///
    /// A job already submitted runs to completion and its outcome is recorded.
    pub fn disable(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), TaskState::Disabled);
        if previous != TaskState::Disabled {
            self.stop.notify_one();
            info!(task_id = self.id(), "task disabled");
        }
    }

    /// Start driving the task on `spawner`.
    ///
    /// Only a `Stopped` task is armed; anything else is left alone.
    pub fn arm<S: Spawn>(self: &Arc<Self>, spawner: &S) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Stopped {
                return;
            }
            *state = TaskState::Running;
        }
        info!(task_id = self.id(), name = ?self.name, "task armed");
        let task = Arc::clone(self);
        spawner.spawn(async move { task.drive().await });
    }

    async fn drive(self: Arc<Self>) {
        let task_id = self.id();
        let mut last_fire: Option<DateTime<Utc>> = None;
        loop {
            if self.state() == TaskState::Disabled {
                break;
            }
            let response = self.schedule.wait(last_fire, Utc::now());
            if response.state == ScheduleState::Ended {
                info!(task_id, "schedule ended");
                self.disable();
                break;
            }
            if response.missed > 0 {
                self.stats.misses.fetch_add(response.missed, Ordering::Relaxed);
                debug!(task_id, missed = response.missed, "missed intervals");
            }

            tokio::select! {
                () = tokio::time::sleep(response.wait) => {}
                () = self.stop.notified() => break,
            }

            if !self.begin_firing() {
                break;
            }
            let fired_at = Utc::now();
            last_fire = Some(fired_at);
            self.fire(fired_at).await;
        }
        debug!(task_id, "task driver exited");
    }

    fn begin_firing(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TaskState::Running {
            *state = TaskState::Firing;
            true
        } else {
            false
        }
    }

    async fn fire(&self, fired_at: DateTime<Utc>) {
        let task_id = self.id();
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        let payload = CollectJob::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.workflow),
            self.deadline,
        );
        let job = Job::new(task_id, self.deadline, Box::new(payload));
        debug!(task_id, job_id = %job.id(), "firing");

        let outcome = match self.work.work(job).await {
            Ok(mut job) => match job.take_outcome() {
                Some(outcome) if !outcome.succeeded() => RunOutcome::Failed(outcome.errors),
                _ => RunOutcome::Success,
            },
            Err(err) => RunOutcome::Rejected(err),
        };
        self.record(fired_at, outcome);
    }

    fn record(&self, fired_at: DateTime<Utc>, outcome: RunOutcome) {
        let task_id = self.id();
        let mut disable = false;
        match &outcome {
            RunOutcome::Success => {
                self.stats.consecutive_failures.store(0, Ordering::Relaxed);
            }
            RunOutcome::Failed(errors) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let consecutive = self.stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(task_id, errors = errors.len(), consecutive, "run failed");
                if self.failure_threshold.is_some_and(|limit| consecutive >= limit) {
                    warn!(task_id, consecutive, "failure threshold reached");
                    disable = true;
                }
            }
            RunOutcome::Rejected(err) => {
                self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(task_id, error = %err, "run rejected");
                if *err == WorkError::Stopped {
                    disable = true;
                }
            }
        }

        *self.last_run.lock() = Some(LastRun {
            fired_at,
            finished_at: Utc::now(),
            outcome,
        });

        if disable {
            self.disable();
        } else {
            let mut state = self.state.lock();
            if *state == TaskState::Firing {
                *state = TaskState::Running;
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("state", &self.state())
            .field("schedule", &self.schedule)
            .field("subscriptions", &self.subscriptions)
            .field("deadline", &self.deadline)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
