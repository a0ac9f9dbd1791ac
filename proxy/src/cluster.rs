use std::fmt;

use rand::seq::IndexedRandom;
use uuid::Uuid;

/// Identity of a grid node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
  pub fn random() -> Self {
    Self(Uuid::new_v4())
  }

  pub fn from_uuid(id: Uuid) -> Self {
    Self(id)
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// A set of nodes a query is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterGroup {
  nodes: Vec<NodeId>,
}

impl ClusterGroup {
  pub fn new(nodes: Vec<NodeId>) -> Self {
    Self { nodes }
  }

  pub fn single(node: NodeId) -> Self {
    Self { nodes: vec![node] }
  }

  pub fn nodes(&self) -> &[NodeId] {
    &self.nodes
  }

  pub fn contains(&self, node: &NodeId) -> bool {
    self.nodes.contains(node)
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// A group of one node picked at random from this one, or an empty group.
  pub fn for_random(&self) -> ClusterGroup {
    match self.nodes.choose(&mut rand::rng()) {
      Some(node) => ClusterGroup::single(*node),
      None => ClusterGroup::new(Vec::new()),
    }
  }
}

/// Resolves the node groups queries are projected onto.
pub trait ClusterResolver: Send + Sync {
  fn local_node(&self) -> NodeId;

  /// The nodes that hold data for the named cache.
  fn data_nodes(&self, cache: &str) -> ClusterGroup;

  /// Whether this node holds data for the named cache.
  fn is_data_node(&self, cache: &str) -> bool;

  fn for_local(&self) -> ClusterGroup {
    ClusterGroup::single(self.local_node())
  }
}
