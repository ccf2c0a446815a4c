use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::{ClusterTarget, NodeIdentity};
use crate::platform::run_command;

pub const CLUSTER_PLACEHOLDER: &str = "{cluster}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("Unable to reach cluster: {0}")]
    ClusterUnavailable(String),
    #[error("Unable to retrieve cluster nodes: {0}")]
    NodesUnavailable(String),
}

/// Resolves cluster membership.
pub trait TopologyProvider: Send + Sync {
    fn resolve_nodes(&self, cluster: &ClusterTarget) -> Result<Vec<NodeIdentity>, TopologyError>;
}

/// Membership from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    clusters: BTreeMap<String, Vec<String>>,
}

impl StaticTopology {
    pub fn new(clusters: BTreeMap<String, Vec<String>>) -> Self {
        Self { clusters }
    }
}

impl TopologyProvider for StaticTopology {
    fn resolve_nodes(&self, cluster: &ClusterTarget) -> Result<Vec<NodeIdentity>, TopologyError> {
        let Some(nodes) = self.clusters.get(cluster.as_str()) else {
            return Err(TopologyError::ClusterUnavailable(format!(
                "cluster {cluster} is not defined in [topology.clusters]"
            )));
        };
        let nodes = normalize_node_names(nodes.iter().map(String::as_str));
        if nodes.is_empty() {
            return Err(TopologyError::NodesUnavailable(format!(
                "cluster {cluster} has no nodes"
            )));
        }
        Ok(nodes)
    }
}

/// Runs a command per cluster and reads one node name per stdout line.
#[derive(Debug, Clone)]
pub struct CommandTopology {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTopology {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    pub fn argv_for(&self, cluster: &ClusterTarget) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.replace(CLUSTER_PLACEHOLDER, cluster.as_str()))
            .collect()
    }
}

impl TopologyProvider for CommandTopology {
    fn resolve_nodes(&self, cluster: &ClusterTarget) -> Result<Vec<NodeIdentity>, TopologyError> {
        let argv = self.argv_for(cluster);
        let Some((program, rest)) = argv.split_first() else {
            return Err(TopologyError::ClusterUnavailable(
                "topology command is empty".to_string(),
            ));
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();

        let out = run_command(program, &args, self.timeout)
            .map_err(|e| TopologyError::ClusterUnavailable(e.to_string()))?;
        if out.exit_code != 0 {
            let detail = out
                .first_stderr_line()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{program} exited with code {}", out.exit_code));
            return Err(TopologyError::ClusterUnavailable(detail));
        }

        let nodes = normalize_node_names(out.stdout.lines());
        if nodes.is_empty() {
            return Err(TopologyError::NodesUnavailable(format!(
                "no nodes reported for cluster {cluster}"
            )));
        }
        tracing::debug!(%cluster, nodes = nodes.len(), "cluster resolved");
        Ok(nodes)
    }
}

fn normalize_node_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<NodeIdentity> {
    names
        .map(|n| n.trim().trim_start_matches('\u{feff}'))
        .filter(|n| !n.is_empty())
        .map(NodeIdentity::new)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_topology_distinguishes_unknown_and_empty_clusters() {
        let mut clusters = BTreeMap::new();
        clusters.insert("C2".to_string(), vec!["n1".to_string(), " n2 ".to_string()]);
        clusters.insert("C3".to_string(), vec![" ".to_string()]);
        let topology = StaticTopology::new(clusters);

        let nodes = topology
            .resolve_nodes(&ClusterTarget::new("C2"))
            .expect("resolve");
        assert_eq!(nodes, vec![NodeIdentity::new("n1"), NodeIdentity::new("n2")]);

        assert!(matches!(
            topology.resolve_nodes(&ClusterTarget::new("C1")),
            Err(TopologyError::ClusterUnavailable(_))
        ));
        assert!(matches!(
            topology.resolve_nodes(&ClusterTarget::new("C3")),
            Err(TopologyError::NodesUnavailable(_))
        ));
    }

    #[test]
    fn command_topology_substitutes_cluster_name() {
        let topology = CommandTopology::new(
            vec!["list-nodes".to_string(), "--cluster={cluster}".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(
            topology.argv_for(&ClusterTarget::new("C9")),
            vec!["list-nodes", "--cluster=C9"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_topology_reads_one_node_per_line() {
        let topology = CommandTopology::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf 'n1\\r\\n\\r\\nn2\\n'".to_string(),
            ],
            Duration::from_secs(5),
        );
        let nodes = topology
            .resolve_nodes(&ClusterTarget::new("C"))
            .expect("resolve");
        assert_eq!(nodes, vec![NodeIdentity::new("n1"), NodeIdentity::new("n2")]);
    }

    #[cfg(unix)]
    #[test]
    fn command_topology_maps_failures() {
        let failing = CommandTopology::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'cluster not found' >&2; exit 1".to_string(),
            ],
            Duration::from_secs(5),
        );
        assert_eq!(
            failing.resolve_nodes(&ClusterTarget::new("C")),
            Err(TopologyError::ClusterUnavailable("cluster not found".to_string()))
        );

        let empty = CommandTopology::new(
            vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
            Duration::from_secs(5),
        );
        assert!(matches!(
            empty.resolve_nodes(&ClusterTarget::new("C")),
            Err(TopologyError::NodesUnavailable(_))
        ));
    }
}
