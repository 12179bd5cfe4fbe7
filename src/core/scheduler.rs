//! The scheduler façade.
//!
//! A [`Scheduler`] owns the work manager and the task registry. It turns a
//! `create_task` request into a registered, armed [`Task`] or into the full
//! list of reasons it could not, with no subscription left behind.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{SchedulerConfig, TaskDefaults};
use crate::runtime::TokioSpawner;

use super::error::{SchedulerError, TaskErrors};
use super::metric::{ConfigDataTree, MetricManager, MetricType};
use super::schedule::Schedule;
use super::subscription::{unsubscribe_all, SubscriptionSaga};
use super::task::{Task, TaskId, TaskOption};
use super::task_collection::TaskCollection;
use super::work_manager::WorkManager;
use super::workflow::{TaskWorkflow, Workflow};

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Tasks cannot be created.
    Stopped,
    /// Tasks can be created.
    Started,
}

struct Lifecycle {
    state: SchedulerState,
    metric_manager: Option<Arc<dyn MetricManager>>,
    spawner: Option<TokioSpawner>,
}

/// Creates, registers and drives metric collection tasks.
pub struct Scheduler {
    lifecycle: RwLock<Lifecycle>,
    tasks: TaskCollection,
    work_manager: Arc<WorkManager>,
    task_defaults: TaskDefaults,
}

impl Scheduler {
    /// Create a stopped scheduler with `pool_size` workers and room for
    /// `queue_size` waiting jobs. The work manager is started immediately.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidConfig` for a zero pool or queue size.
    pub fn new(pool_size: usize, queue_size: usize) -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig::with_sizes(pool_size, queue_size))
    }

    /// Create a stopped scheduler from a full configuration.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidConfig` if the configuration fails validation.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let work_manager = WorkManager::new(&config.work)
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
        work_manager.start();
        info!(
            pool_size = config.work.worker_count,
            queue_size = config.work.max_queue_depth,
            "scheduler created"
        );
        Ok(Self {
            lifecycle: RwLock::new(Lifecycle {
                state: SchedulerState::Stopped,
                metric_manager: None,
                spawner: None,
            }),
            tasks: TaskCollection::new(),
            work_manager: Arc::new(work_manager),
            task_defaults: config.tasks,
        })
    }

    /// Bind the metric manager. Rebinding replaces the previous one for tasks
    /// created afterwards.
    pub fn set_metric_manager(&self, manager: Arc<dyn MetricManager>) {
        self.lifecycle.write().metric_manager = Some(manager);
        debug!("metric manager bound");
    }

    /// Allow task creation.
    ///
    /// Must be called from inside a Tokio runtime; task drivers run on it.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::MetricManagerNotSet` if no metric manager is bound
    /// - `SchedulerError::RuntimeUnavailable` outside a Tokio runtime
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.write();
        if lifecycle.metric_manager.is_none() {
            return Err(SchedulerError::MetricManagerNotSet);
        }
        lifecycle.spawner = Some(TokioSpawner::current()?);
        lifecycle.state = SchedulerState::Started;
        info!("scheduler started");
        Ok(())
    }

    /// Refuse new tasks. Running tasks and the work manager are left alone.
    pub fn stop(&self) {
        self.lifecycle.write().state = SchedulerState::Stopped;
        info!("scheduler stopped");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.lifecycle.read().state
    }

    /// Subscribe `metrics`, snapshot `workflow`, and register and arm a task.
    ///
    /// Either every metric is subscribed and the armed task is returned, or
    /// every subscription made along the way is withdrawn and all errors are
    /// returned together.
    ///
    /// # Errors
    ///
    /// - `NotStarted` when the scheduler is stopped
    /// - `InvalidSchedule` when the schedule fails validation
    /// - one `Subscription` per failure reported by the metric manager
    /// - `Unsubscription` for each compensating unsubscribe that failed
    /// - `DuplicateTask` if registration collides
    pub fn create_task(
        &self,
        metrics: &[MetricType],
        schedule: Box<dyn Schedule>,
        config_tree: &ConfigDataTree,
        workflow: &dyn Workflow,
        options: Vec<TaskOption>,
    ) -> Result<Arc<Task>, TaskErrors> {
        let lifecycle = self.lifecycle.read();
        let (manager, spawner) = match (
            lifecycle.state,
            &lifecycle.metric_manager,
            &lifecycle.spawner,
        ) {
            (SchedulerState::Started, Some(manager), Some(spawner)) => (manager, spawner),
            _ => return Err(SchedulerError::NotStarted.into()),
        };

        schedule.validate().map_err(SchedulerError::from)?;

        let mut saga = SubscriptionSaga::new(manager.as_ref());
        let errors = saga.subscribe_all(metrics, config_tree);
        if !errors.is_empty() {
            let mut errs = TaskErrors::new();
            errs.extend(errors);
            errs.extend(saga.compensate());
            warn!(errors = errs.len(), "task creation failed, subscriptions withdrawn");
            return Err(errs);
        }
        let subscriptions = saga.into_confirmed();

        let task = Arc::new(Task::new(
            schedule,
            subscriptions,
            TaskWorkflow::from_map(workflow.map()),
            Arc::clone(manager),
            Arc::clone(&self.work_manager),
            &self.task_defaults,
            options,
        ));

        if let Err(err) = self.tasks.add(Arc::clone(&task)) {
            let mut errs = TaskErrors::from(err);
            errs.extend(unsubscribe_all(manager.as_ref(), task.subscriptions()));
            warn!(errors = errs.len(), "task registration failed, subscriptions withdrawn");
            return Err(errs);
        }

        task.arm(spawner);
        info!(
            task_id = task.id(),
            metrics = task.subscriptions().len(),
            "task created"
        );
        Ok(task)
    }

    /// Snapshot of every registered task.
    #[must_use]
    pub fn tasks(&self) -> HashMap<TaskId, Arc<Task>> {
        self.tasks.table()
    }

    /// Look up a task.
    ///
    /// # Errors
    ///
    /// `SchedulerError::TaskNotFound` if no task has this identifier.
    pub fn task(&self, id: TaskId) -> Result<Arc<Task>, SchedulerError> {
        self.tasks.get(id).ok_or(SchedulerError::TaskNotFound(id))
    }

    /// Unregister and disable a task, then withdraw its subscriptions.
    ///
    /// Unsubscribe failures are logged.
    ///
    /// # Errors
    ///
    /// `SchedulerError::TaskNotFound` if no task has this identifier.
    pub fn remove_task(&self, id: TaskId) -> Result<Arc<Task>, SchedulerError> {
        let task = self.tasks.remove(id).ok_or(SchedulerError::TaskNotFound(id))?;
        task.disable();
        let manager = self.lifecycle.read().metric_manager.clone();
        if let Some(manager) = manager {
            let failures = unsubscribe_all(manager.as_ref(), task.subscriptions());
            if !failures.is_empty() {
                warn!(task_id = id, failures = failures.len(), "task removed with leaked subscriptions");
            }
        }
        info!(task_id = id, "task removed");
        Ok(task)
    }

    /// Stop, disable every task, and stop the work manager.
    ///
    /// Jobs already queued or running are allowed to finish.
    pub fn shutdown(&self) {
        self.stop();
        for task in self.tasks.table().values() {
            task.disable();
        }
        self.work_manager.stop();
        info!("scheduler shut down");
    }

    /// The shared work manager, for stats and resizing.
    #[must_use]
    pub const fn work_manager(&self) -> &Arc<WorkManager> {
        &self.work_manager
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Task drivers hold their own handles; without this they keep firing.
        let tasks = self.tasks.table();
        for task in tasks.values() {
            task.disable();
        }
        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "scheduler dropped, tasks disabled");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("tasks", &self.tasks.len())
            .field("work", &self.work_manager.stats())
            .finish_non_exhaustive()
    }
}
