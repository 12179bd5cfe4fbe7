//! Subscribing a task's metrics as one unit.
//!
//! Every confirmed subscription is recorded as a step. When any metric fails,
//! the steps are undone newest first so no subscription outlives a failed
//! `create_task`.

use tracing::{debug, warn};

use super::error::SchedulerError;
use super::metric::{ConfigDataTree, MetricManager, MetricType};

pub(crate) struct SubscriptionSaga<'a> {
    manager: &'a dyn MetricManager,
    steps: Vec<MetricType>,
}

impl<'a> SubscriptionSaga<'a> {
    pub(crate) fn new(manager: &'a dyn MetricManager) -> Self {
        Self {
            manager,
            steps: Vec::new(),
        }
    }

    /// Subscribe every metric in order and return every error seen.
    ///
    /// Successes are recorded even after a failure so they can be undone.
    pub(crate) fn subscribe_all(
        &mut self,
        metrics: &[MetricType],
        config_tree: &ConfigDataTree,
    ) -> Vec<SchedulerError> {
        let mut errors = Vec::new();
        for metric in metrics {
            let config = config_tree.get(metric.namespace());
            match self.manager.subscribe_metric_type(metric, config.as_ref()) {
                Ok(confirmed) => {
                    debug!(metric = %confirmed, "subscribed");
                    self.steps.push(confirmed);
                }
                Err(failures) => {
                    debug!(metric = %metric, errors = failures.len(), "subscription refused");
                    errors.extend(failures.into_iter().map(|source| SchedulerError::Subscription {
                        metric: metric.to_string(),
                        source,
                    }));
                }
            }
        }
        errors
    }

    /// Undo every recorded step, newest first.
    pub(crate) fn compensate(self) -> Vec<SchedulerError> {
        unsubscribe_all(self.manager, &self.steps)
    }

    /// Keep the subscriptions; the saga is finished.
    pub(crate) fn into_confirmed(self) -> Vec<MetricType> {
        self.steps
    }
}

/// Unsubscribe `metrics` in reverse order, collecting failures.
pub(crate) fn unsubscribe_all(
    manager: &dyn MetricManager,
    metrics: &[MetricType],
) -> Vec<SchedulerError> {
    let mut errors = Vec::new();
    for metric in metrics.iter().rev() {
        match manager.unsubscribe_metric_type(metric) {
            Ok(()) => debug!(metric = %metric, "unsubscribed"),
            Err(source) => {
                warn!(metric = %metric, error = %source, "unsubscribe failed, subscription may leak");
                errors.push(SchedulerError::Unsubscription {
                    metric: metric.to_string(),
                    source,
                });
            }
        }
    }
    errors
}
