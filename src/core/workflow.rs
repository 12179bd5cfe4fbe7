//! Workflow definitions and the per-task runtime copy.
//!
//! A workflow is a tree rooted at the collect step. Collected metrics flow into
//! every top-level process and publish node; a process node's output flows into
//! its own children.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::JobError;
use super::metric::{ConfigDataNode, Metric, MetricManager};

/// Names a processing or publishing plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRef {
    /// Plugin name.
    pub name: String,
    /// Plugin version; `None` selects the latest.
    #[serde(default)]
    pub version: Option<u32>,
}

impl PluginRef {
    /// Reference the latest version of `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }
}

/// A publishing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishNode {
    /// Plugin that publishes.
    pub plugin: PluginRef,
    /// Plugin configuration.
    #[serde(default)]
    pub config: ConfigDataNode,
}

/// A processing step with its downstream steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessNode {
    /// Plugin that processes.
    pub plugin: PluginRef,
    /// Plugin configuration.
    #[serde(default)]
    pub config: ConfigDataNode,
    /// Processing steps fed by this node's output.
    #[serde(default)]
    pub process: Vec<ProcessNode>,
    /// Publishing steps fed by this node's output.
    #[serde(default)]
    pub publish: Vec<PublishNode>,
}

/// Root of the workflow: the collect step and what consumes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectNode {
    /// Processing steps fed by the collected metrics.
    #[serde(default)]
    pub process: Vec<ProcessNode>,
    /// Publishing steps fed by the collected metrics.
    #[serde(default)]
    pub publish: Vec<PublishNode>,
}

/// Structural representation of a workflow.
///
/// The default map only collects, which makes it the passthrough workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMap {
    /// Collect step.
    #[serde(default)]
    pub collect: CollectNode,
}

impl WorkflowMap {
    /// Parse a workflow map from JSON.
    ///
    /// # Errors
    ///
    /// The `serde_json` parse error.
    pub fn from_json_str(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}

/// Anything that can describe itself as a [`WorkflowMap`].
pub trait Workflow: Send + Sync {
    /// Structural representation used to build a task's own copy.
    fn map(&self) -> WorkflowMap;
}

impl Workflow for WorkflowMap {
    fn map(&self) -> WorkflowMap {
        self.clone()
    }
}

/// A task's private workflow, independent of the caller's definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskWorkflow {
    map: WorkflowMap,
}

impl TaskWorkflow {
    /// Build the runtime copy from a structural map.
    #[must_use]
    pub const fn from_map(map: WorkflowMap) -> Self {
        Self { map }
    }

    /// The map this workflow was built from.
    #[must_use]
    pub const fn map(&self) -> &WorkflowMap {
        &self.map
    }

    /// Run `metrics` through every node.
    ///
    /// All branches run even when one fails.
    ///
    /// # Errors
    ///
    /// Every node failure, in traversal order.
    pub async fn run(
        &self,
        manager: &dyn MetricManager,
        metrics: Vec<Metric>,
    ) -> Result<(), Vec<JobError>> {
        let mut errors = Vec::new();
        run_branch(
            manager,
            &self.map.collect.process,
            &self.map.collect.publish,
            metrics,
            &mut errors,
        )
        .await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

type BranchFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn run_branch<'a>(
    manager: &'a dyn MetricManager,
    process: &'a [ProcessNode],
    publish: &'a [PublishNode],
    metrics: Vec<Metric>,
    errors: &'a mut Vec<JobError>,
) -> BranchFuture<'a> {
    Box::pin(async move {
        for node in publish {
            if let Err(source) = manager
                .publish_metrics(&node.plugin, &node.config, &metrics)
                .await
            {
                errors.push(JobError::Publish {
                    plugin: node.plugin.name.clone(),
                    source,
                });
            }
        }
        for node in process {
            match manager
                .process_metrics(&node.plugin, &node.config, metrics.clone())
                .await
            {
                Ok(out) => {
                    debug!(plugin = %node.plugin.name, count = out.len(), "process node finished");
                    run_branch(manager, &node.process, &node.publish, out, errors).await;
                }
                Err(source) => errors.push(JobError::Process {
                    plugin: node.plugin.name.clone(),
                    source,
                }),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::core::error::MetricError;
    use crate::core::metric::MetricType;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricManager for Recorder {
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

        async fn process_metrics(
            &self,
            plugin: &PluginRef,
            _config: &ConfigDataNode,
            mut metrics: Vec<Metric>,
        ) -> Result<Vec<Metric>, MetricError> {
            self.calls.lock().push(format!("process:{}", plugin.name));
            if plugin.name == "broken" {
                return Err(MetricError::Plugin("boom".into()));
            }
            metrics.truncate(1);
            Ok(metrics)
        }

        async fn publish_metrics(
            &self,
            plugin: &PluginRef,
            _config: &ConfigDataNode,
            metrics: &[Metric],
        ) -> Result<(), MetricError> {
            self.calls
                .lock()
                .push(format!("publish:{}:{}", plugin.name, metrics.len()));
            if plugin.name == "offline" {
                return Err(MetricError::Plugin("unreachable".into()));
            }
            Ok(())
        }
    }

    fn metric(n: i64) -> Metric {
        Metric {
            namespace: vec!["cpu".into(), "usage".into()],
            data: serde_json::json!(n),
            timestamp: Utc::now(),
        }
    }

    fn publish(name: &str) -> PublishNode {
        PublishNode {
            plugin: PluginRef::new(name),
            config: ConfigDataNode::new(),
        }
    }

    #[tokio::test]
    async fn test_passthrough_workflow_does_nothing() {
        let recorder = Recorder::default();
        let wf = TaskWorkflow::from_map(WorkflowMap::default());
        wf.run(&recorder, vec![metric(1)]).await.unwrap();
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_process_output_feeds_children() {
        let recorder = Recorder::default();
        let map = WorkflowMap {
            collect: CollectNode {
                process: vec![ProcessNode {
                    plugin: PluginRef::new("first-only"),
                    config: ConfigDataNode::new(),
                    process: vec![],
                    publish: vec![publish("file")],
                }],
                publish: vec![publish("influx")],
            },
        };
        TaskWorkflow::from_map(map)
            .run(&recorder, vec![metric(1), metric(2)])
            .await
            .unwrap();
        assert_eq!(
            *recorder.calls.lock(),
            vec!["publish:influx:2", "process:first-only", "publish:file:1"]
        );
    }

    #[tokio::test]
    async fn test_all_node_failures_accumulate() {
        let recorder = Recorder::default();
        let map = WorkflowMap {
            collect: CollectNode {
                process: vec![ProcessNode {
                    plugin: PluginRef::new("broken"),
                    config: ConfigDataNode::new(),
                    process: vec![],
                    publish: vec![publish("never")],
                }],
                publish: vec![publish("offline"), publish("file")],
            },
        };
        let errors = TaskWorkflow::from_map(map)
            .run(&recorder, vec![metric(1)])
            .await
            .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], JobError::Publish { plugin, .. } if plugin == "offline"));
        assert!(matches!(&errors[1], JobError::Process { plugin, .. } if plugin == "broken"));
        // The branch below a failed process node never runs.
        assert!(!recorder.calls.lock().iter().any(|c| c.starts_with("publish:never")));
    }

    #[test]
    fn test_workflow_map_from_json() {
        let map = WorkflowMap::from_json_str(
            r#"{"collect": {"publish": [{"plugin": {"name": "file"}, "config": {"path": "/tmp/out"}}]}}"#,
        )
        .unwrap();
        assert_eq!(map.collect.publish.len(), 1);
        assert_eq!(map.collect.publish[0].plugin.name, "file");
        assert!(map.collect.process.is_empty());
    }
}
