use crate::cluster::{ClusterGroup, ClusterResolver, NodeId};

/// A cluster of exactly one node, which holds data for every cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleNodeCluster {
  node: NodeId,
}

impl SingleNodeCluster {
  pub fn new() -> Self {
    Self { node: NodeId::random() }
  }

  pub fn with_node(node: NodeId) -> Self {
    Self { node }
  }
}

impl Default for SingleNodeCluster {
  fn default() -> Self {
    Self::new()
  }
}

impl ClusterResolver for SingleNodeCluster {
  fn local_node(&self) -> NodeId {
    self.node
  }

  fn data_nodes(&self, _cache: &str) -> ClusterGroup {
    ClusterGroup::single(self.node)
  }

  fn is_data_node(&self, _cache: &str) -> bool {
    true
  }
}
