//! Metric identifiers, configuration data, and the metric manager contract.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::MetricError;
use super::workflow::PluginRef;

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Flat key/value configuration attached to a namespace or plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDataNode {
    table: BTreeMap<String, ConfigValue>,
}

impl ConfigDataNode {
    /// Create an empty node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.table.insert(key.into(), value.into());
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.table.get(key)
    }

    /// Copy every key of `other` into this node, overriding existing keys.
    pub fn merge(&mut self, other: &Self) {
        for (k, v) in &other.table {
            self.table.insert(k.clone(), v.clone());
        }
    }

    /// Underlying table.
    #[must_use]
    pub const fn table(&self) -> &BTreeMap<String, ConfigValue> {
        &self.table
    }

    /// True when the node holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Configuration nodes keyed by namespace path.
///
/// Lookups merge every node found along the path from the root, so a node at
/// `intel/cpu` overrides keys set at `intel`. Paths are stored joined with
/// `/` so the tree serializes as a plain JSON object; the root is `""`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDataTree {
    nodes: BTreeMap<String, ConfigDataNode>,
}

impl ConfigDataTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node` at `namespace`, merging into any node already there.
    pub fn add(&mut self, namespace: &[String], node: ConfigDataNode) {
        self.nodes
            .entry(namespace.join("/"))
            .and_modify(|existing| existing.merge(&node))
            .or_insert(node);
    }

    /// Resolve the effective configuration for `namespace`.
    ///
    /// Returns `None` when no node exists on the path.
    #[must_use]
    pub fn get(&self, namespace: &[String]) -> Option<ConfigDataNode> {
        let mut merged: Option<ConfigDataNode> = None;
        for depth in 0..=namespace.len() {
            if let Some(node) = self.nodes.get(&namespace[..depth].join("/")) {
                merged.get_or_insert_with(ConfigDataNode::new).merge(node);
            }
        }
        merged
    }
}

/// Identifies a metric by namespace and optional provider version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricType {
    namespace: Vec<String>,
    version: Option<u32>,
    config: Option<ConfigDataNode>,
}

impl MetricType {
    /// Create a metric type from a `/`-separated namespace such as `cpu/usage`.
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace
                .split('/')
                .filter(|part| !part.is_empty())
                .map(ToString::to_string)
                .collect(),
            version: None,
            config: None,
        }
    }

    /// Pin a provider version.
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Attach resolved configuration; metric managers use this when confirming.
    #[must_use]
    pub fn with_config(mut self, config: ConfigDataNode) -> Self {
        self.config = Some(config);
        self
    }

    /// Namespace segments.
    #[must_use]
    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    /// Requested provider version, if pinned.
    #[must_use]
    pub const fn version(&self) -> Option<u32> {
        self.version
    }

    /// Resolved configuration, if any.
    #[must_use]
    pub const fn config(&self) -> Option<&ConfigDataNode> {
        self.config.as_ref()
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace.join("/"))
    }
}

/// A collected metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Namespace segments of the metric.
    pub namespace: Vec<String>,
    /// Collected value.
    pub data: serde_json::Value,
    /// Collection time.
    pub timestamp: DateTime<Utc>,
}

/// Collaborator that resolves and tracks metric subscriptions.
///
/// Only the two subscription methods are required. Collection, processing,
/// and publishing default to an empty collection and passthrough plugins.
#[async_trait]
pub trait MetricManager: Send + Sync {
    /// Subscribe to `metric` with the configuration resolved for its namespace.
    ///
    /// Returns the confirmed metric, or every error found for it.
    ///
    /// # Errors
    ///
    /// One or more [`MetricError`]s when the subscription cannot be confirmed.
    fn subscribe_metric_type(
        &self,
        metric: &MetricType,
        config: Option<&ConfigDataNode>,
    ) -> Result<MetricType, Vec<MetricError>>;

    /// Withdraw a subscription obtained from [`subscribe_metric_type`](Self::subscribe_metric_type).
    ///
    /// # Errors
    ///
    /// A [`MetricError`] when the provider could not release the subscription.
    fn unsubscribe_metric_type(&self, metric: &MetricType) -> Result<(), MetricError>;

    /// Collect current values for `metrics`, finishing before `deadline`.
    ///
    /// # Errors
    ///
    /// Every collection failure encountered.
    async fn collect_metrics(
        &self,
        _metrics: &[MetricType],
        _deadline: DateTime<Utc>,
    ) -> Result<Vec<Metric>, Vec<MetricError>> {
        Ok(Vec::new())
    }

    /// Run `metrics` through a processing plugin.
    ///
    /// # Errors
    ///
    /// The plugin's failure.
    async fn process_metrics(
        &self,
        _plugin: &PluginRef,
        _config: &ConfigDataNode,
        metrics: Vec<Metric>,
    ) -> Result<Vec<Metric>, MetricError> {
        Ok(metrics)
    }

    /// Hand `metrics` to a publishing plugin.
    ///
    /// # Errors
    ///
    /// The plugin's failure.
    async fn publish_metrics(
        &self,
        _plugin: &PluginRef,
        _config: &ConfigDataNode,
        _metrics: &[Metric],
    ) -> Result<(), MetricError> {
        Ok(())
    }
}
