//! Core scheduling abstractions: tasks, schedules, workflows and the work manager.

pub mod error;
pub mod job;
pub mod metric;
pub mod schedule;
pub mod scheduler;
mod subscription;
pub mod task;
pub mod task_collection;
pub mod work_manager;
pub mod workflow;

pub use error::{
    AppResult, JobError, MetricError, ScheduleError, SchedulerError, TaskErrors, WorkError,
};
pub use job::{CollectJob, Job, JobOutcome, JobPayload};
pub use metric::{
    ConfigDataNode, ConfigDataTree, ConfigValue, Metric, MetricManager, MetricType,
};
pub use schedule::{
    CronSchedule, Schedule, ScheduleResponse, ScheduleState, SimpleSchedule, WindowedSchedule,
};
pub use scheduler::{Scheduler, SchedulerState};
pub use task::{LastRun, RunOutcome, Task, TaskId, TaskOption, TaskState, TaskStats};
pub use task_collection::TaskCollection;
pub use work_manager::{WorkManager, WorkStats};
pub use workflow::{
    CollectNode, PluginRef, ProcessNode, PublishNode, TaskWorkflow, Workflow, WorkflowMap,
};
