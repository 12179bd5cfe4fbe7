//! Registry of live tasks and owner of the task identifier space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::error::SchedulerError;
use super::task::{Task, TaskId};

/// Thread-safe table of registered tasks.
///
/// Identifiers start at 1 and are never reused, even after removal.
#[derive(Debug)]
pub struct TaskCollection {
    table: RwLock<HashMap<TaskId, Arc<Task>>>,
    next_id: AtomicU64,
}

impl Default for TaskCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `task`, assigning it a fresh identifier unless it already has one.
    ///
    /// # Errors
    ///
    /// `SchedulerError::DuplicateTask` if the identifier is already registered.
    pub fn add(&self, task: Arc<Task>) -> Result<TaskId, SchedulerError> {
        let id = match task.assigned_id() {
            Some(id) => id,
            None => task.assign_id(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        let mut table = self.table.write();
        if table.contains_key(&id) {
            return Err(SchedulerError::DuplicateTask(id));
        }
        table.insert(id, task);
        drop(table);

        debug!(task_id = id, "task registered");
        Ok(id)
    }

    /// Look up a task by identifier.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.table.read().get(&id).cloned()
    }

    /// Remove a task, returning it if it was registered.
    pub fn remove(&self, id: TaskId) -> Option<Arc<Task>> {
        let removed = self.table.write().remove(&id);
        if removed.is_some() {
            debug!(task_id = id, "task removed");
        }
        removed
    }

    /// Snapshot of every registered task. Changes to the map do not affect the collection.
    #[must_use]
    pub fn table(&self) -> HashMap<TaskId, Arc<Task>> {
        self.table.read().clone()
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// True when no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TaskDefaults, WorkManagerConfig};
    use crate::core::error::MetricError;
    use crate::core::metric::{ConfigDataNode, MetricManager, MetricType};
    use crate::core::schedule::SimpleSchedule;
    use crate::core::work_manager::WorkManager;
    use crate::core::workflow::{TaskWorkflow, WorkflowMap};
    use std::time::Duration;

    struct Noop;

    #[async_trait::async_trait]
    impl MetricManager for Noop {
        fn subscribe_metric_type(
            &self,
            metric: &MetricType,
            _config: Option<&ConfigDataNode>,
        ) -> Result<MetricType, Vec<MetricError>> {
            Ok(metric.clone())
        }

        fn unsubscribe_metric_type(&self, _metric: &MetricType) -> Result<(), MetricError> {
            Ok(())
        }
    }

    fn new_task(work: &Arc<WorkManager>) -> Arc<Task> {
        Arc::new(Task::new(
            Box::new(SimpleSchedule::new(Duration::from_secs(1))),
            Vec::new(),
            TaskWorkflow::from_map(WorkflowMap::default()),
            Arc::new(Noop),
            Arc::clone(work),
            &TaskDefaults::default(),
            Vec::new(),
        ))
    }

    fn work() -> Arc<WorkManager> {
        Arc::new(WorkManager::new(&WorkManagerConfig::new()).unwrap())
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let wm = work();
        let tasks = TaskCollection::new();
        assert!(tasks.is_empty());
        assert_eq!(tasks.add(new_task(&wm)).unwrap(), 1);
        assert_eq!(tasks.add(new_task(&wm)).unwrap(), 2);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.get(2).unwrap().id(), 2);
        assert!(tasks.get(3).is_none());
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let wm = work();
        let tasks = TaskCollection::new();
        let task = new_task(&wm);
        tasks.add(Arc::clone(&task)).unwrap();
        assert!(matches!(
            tasks.add(task),
            Err(SchedulerError::DuplicateTask(1))
        ));
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_ids_are_not_reused_after_remove() {
        let wm = work();
        let tasks = TaskCollection::new();
        let id = tasks.add(new_task(&wm)).unwrap();
        assert!(tasks.remove(id).is_some());
        assert!(tasks.remove(id).is_none());
        assert_eq!(tasks.add(new_task(&wm)).unwrap(), 2);
    }

    #[test]
    fn test_table_is_a_snapshot() {
        let wm = work();
        let tasks = TaskCollection::new();
        tasks.add(new_task(&wm)).unwrap();
        let mut snapshot = tasks.table();
        snapshot.clear();
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_concurrent_adds_get_unique_ids() {
        let wm = work();
        let tasks = Arc::new(TaskCollection::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tasks = Arc::clone(&tasks);
                let wm = Arc::clone(&wm);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| tasks.add(new_task(&wm)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<TaskId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(tasks.len(), 200);
    }
}
