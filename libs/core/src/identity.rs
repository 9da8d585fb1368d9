//! Fixed cluster membership and quorum arithmetic.
//!
//! The node set is immutable once constructed; changing membership means
//! rebuilding the whole engine. Construction enforces `n = 3f + 1` so the
//! advertised fault tolerance is actually meaningful.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum cluster size able to tolerate a single fault (f = 1).
pub const MIN_CLUSTER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cluster needs at least {MIN_CLUSTER_SIZE} nodes, got {0}")]
    TooFewNodes(usize),
    #[error("node '{0}' is not part of the configured cluster")]
    SelfNotInCluster(String),
    #[error("duplicate node id '{0}' in cluster configuration")]
    DuplicateNode(String),
    #[error("{nodes} nodes cannot tolerate {fault_tolerance} faults (requires n = 3f + 1)")]
    InvalidFaultTolerance { nodes: usize, fault_tolerance: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Participant,
}

/// A member of the fixed consensus cluster. The address is opaque here; the
/// transport layer owns its interpretation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub role: NodeRole,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role: NodeRole::Participant,
        }
    }
}

/// Immutable view of cluster membership plus derived quorum parameters.
///
/// Leadership is positional: the leader of view `v` is the node at index
/// `v % n` in the id-sorted membership, so every node derives the same
/// leader for a view regardless of the order nodes were configured in.
#[derive(Debug)]
pub struct ClusterConfig {
    nodes: Vec<Node>,
    self_index: usize,
    fault_tolerance: usize,
}

impl ClusterConfig {
    /// Builds the config, validating the membership invariants. When
    /// `fault_tolerance` is `None` it defaults to `(n - 1) / 3`; an explicit
    /// value must still satisfy `n = 3f + 1` exactly.
    pub fn new(
        mut nodes: Vec<Node>,
        self_id: &str,
        fault_tolerance: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if nodes.len() < MIN_CLUSTER_SIZE {
            return Err(ConfigError::TooFewNodes(nodes.len()));
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for pair in nodes.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(ConfigError::DuplicateNode(pair[0].id.clone()));
            }
        }
        let self_index = nodes
            .iter()
            .position(|n| n.id == self_id)
            .ok_or_else(|| ConfigError::SelfNotInCluster(self_id.to_string()))?;

        let n = nodes.len();
        let f = fault_tolerance.unwrap_or((n - 1) / 3);
        if n != 3 * f + 1 {
            return Err(ConfigError::InvalidFaultTolerance {
                nodes: n,
                fault_tolerance: f,
            });
        }

        Ok(Self {
            nodes,
            self_index,
            fault_tolerance: f,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Maximum number of Byzantine nodes the cluster survives.
    pub fn fault_tolerance(&self) -> usize {
        self.fault_tolerance
    }

    /// Agreement threshold: `2f + 1` matching messages.
    pub fn quorum_size(&self) -> usize {
        2 * self.fault_tolerance + 1
    }

    pub fn self_id(&self) -> &str {
        &self.nodes[self.self_index].id
    }

    pub fn is_leader(&self, view: u64) -> bool {
        (view % self.nodes.len() as u64) as usize == self.self_index
    }

    pub fn leader_of(&self, view: u64) -> &str {
        &self.nodes[(view % self.nodes.len() as u64) as usize].id
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == node_id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All member ids except our own.
    pub fn peer_ids(&self) -> impl Iterator<Item = &str> {
        let self_id = self.self_id();
        self.nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(move |id| *id != self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(n: usize) -> Vec<Node> {
        (0..n)
            .map(|i| Node::new(format!("node-{i}"), format!("127.0.0.1:{}", 9000 + i)))
            .collect()
    }

    #[test]
    fn quorum_arithmetic() {
        for (n, f, q) in [(4usize, 1usize, 3usize), (7, 2, 5), (10, 3, 7)] {
            let cfg = ClusterConfig::new(cluster(n), "node-0", None).unwrap();
            assert_eq!(cfg.fault_tolerance(), f, "n={n}");
            assert_eq!(cfg.quorum_size(), q, "n={n}");
        }
    }

    #[test]
    fn rejects_small_or_unbalanced_clusters() {
        assert!(matches!(
            ClusterConfig::new(cluster(3), "node-0", None),
            Err(ConfigError::TooFewNodes(3))
        ));
        // n = 5 is not of the form 3f + 1 for f = (5-1)/3 = 1
        assert!(matches!(
            ClusterConfig::new(cluster(5), "node-0", None),
            Err(ConfigError::InvalidFaultTolerance { .. })
        ));
        assert!(matches!(
            ClusterConfig::new(cluster(4), "node-0", Some(2)),
            Err(ConfigError::InvalidFaultTolerance { .. })
        ));
    }

    #[test]
    fn rejects_unknown_self_and_duplicates() {
        assert!(matches!(
            ClusterConfig::new(cluster(4), "node-9", None),
            Err(ConfigError::SelfNotInCluster(_))
        ));
        let mut nodes = cluster(4);
        nodes[3].id = "node-0".into();
        assert!(matches!(
            ClusterConfig::new(nodes, "node-0", None),
            Err(ConfigError::DuplicateNode(_))
        ));
    }

    #[test]
    fn leader_rotates_with_view() {
        let cfg = ClusterConfig::new(cluster(4), "node-1", None).unwrap();
        assert_eq!(cfg.leader_of(0), "node-0");
        assert_eq!(cfg.leader_of(1), "node-1");
        assert_eq!(cfg.leader_of(5), "node-1");
        assert!(cfg.is_leader(1));
        assert!(!cfg.is_leader(2));
    }
}
