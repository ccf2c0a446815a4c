use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{ClusterTarget, ComponentVersion, NodeIdentity};

pub const VERSION_NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Success,
    Skipped,
    Fail,
}

impl NodeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Success => "Success",
            NodeStatus::Skipped => "Skipped",
            NodeStatus::Fail => "Fail",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Success" => Ok(NodeStatus::Success),
            "Skipped" => Ok(NodeStatus::Skipped),
            "Fail" => Ok(NodeStatus::Fail),
            other => Err(format!(
                "invalid status: {other} (expected Success|Skipped|Fail)"
            )),
        }
    }
}

/// What the decision engine reports for the host it ran on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub message: String,
    pub component_version: String,
}

impl NodeOutcome {
    pub fn success(message: impl Into<String>, version: Option<ComponentVersion>) -> Self {
        Self::with_status(NodeStatus::Success, message, version)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_status(NodeStatus::Skipped, message, None)
    }

    pub fn fail(message: impl Into<String>, version: Option<ComponentVersion>) -> Self {
        Self::with_status(NodeStatus::Fail, message, version)
    }

    fn with_status(
        status: NodeStatus,
        message: impl Into<String>,
        version: Option<ComponentVersion>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            component_version: version
                .map(|v| v.to_string())
                .unwrap_or_else(|| VERSION_NOT_AVAILABLE.to_string()),
        }
    }
}

/// One report row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeResult {
    pub cluster_name: String,
    pub node_name: String,
    pub status: NodeStatus,
    pub message: String,
    pub component_version: String,
}

impl NodeResult {
    pub fn from_outcome(cluster: &ClusterTarget, node: &NodeIdentity, outcome: NodeOutcome) -> Self {
        Self {
            cluster_name: cluster.to_string(),
            node_name: node.to_string(),
            status: outcome.status,
            message: outcome.message,
            component_version: outcome.component_version,
        }
    }

    pub fn node_failure(
        cluster: &ClusterTarget,
        node: &NodeIdentity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster.to_string(),
            node_name: node.to_string(),
            status: NodeStatus::Fail,
            message: message.into(),
            component_version: VERSION_NOT_AVAILABLE.to_string(),
        }
    }

    pub fn cluster_unavailable(cluster: &ClusterTarget, message: impl Into<String>) -> Self {
        Self::synthetic(cluster, "cluster unavailable", message)
    }

    pub fn nodes_unavailable(cluster: &ClusterTarget, message: impl Into<String>) -> Self {
        Self::synthetic(cluster, "nodes unavailable", message)
    }

    fn synthetic(cluster: &ClusterTarget, label: &str, message: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster.to_string(),
            node_name: format!("{cluster} ({label})"),
            status: NodeStatus::Fail,
            message: message.into(),
            component_version: VERSION_NOT_AVAILABLE.to_string(),
        }
    }
}
