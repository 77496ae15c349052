use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use fabric_protocol::NodeId;

/// Supplies the next-hop candidates for a node. Computing routes is not
/// the engine's job; it only filters what this returns.
pub trait TopologyProvider: Send + Sync {
    fn next_hop_candidates(&self, current: &NodeId) -> Vec<NodeId>;
}

/// Undirected neighbor table, editable at runtime.
#[derive(Debug, Default)]
pub struct StaticTopology {
    links: RwLock<HashMap<NodeId, BTreeSet<NodeId>>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(a, b)` pairs; each pair is linked both ways.
    pub fn from_links<I, A, B>(links: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<NodeId>,
        B: Into<NodeId>,
    {
        let topology = Self::new();
        for (a, b) in links {
            topology.link(a.into(), b.into());
        }
        topology
    }

    pub fn link(&self, a: NodeId, b: NodeId) {
        let mut links = self.links.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        links.entry(a.clone()).or_default().insert(b.clone());
        links.entry(b).or_default().insert(a);
    }

    pub fn unlink(&self, a: &NodeId, b: &NodeId) {
        let mut links = self.links.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(n) = links.get_mut(a) {
            n.remove(b);
        }
        if let Some(n) = links.get_mut(b) {
            n.remove(a);
        }
    }

    /// Register a node with no neighbors yet.
    pub fn add_node(&self, node: NodeId) {
        let mut links = self.links.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        links.entry(node).or_default();
    }

    pub fn neighbors(&self, node: &NodeId) -> Vec<NodeId> {
        let links = self.links.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        links
            .get(node)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl TopologyProvider for StaticTopology {
    fn next_hop_candidates(&self, current: &NodeId) -> Vec<NodeId> {
        self.neighbors(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_symmetric() {
        let topo = StaticTopology::from_links([("a", "b"), ("b", "c")]);
        assert_eq!(topo.neighbors(&"b".into()), vec![NodeId::new("a"), NodeId::new("c")]);
        assert_eq!(topo.neighbors(&"c".into()), vec![NodeId::new("b")]);
    }

    #[test]
    fn unlink_removes_both_directions() {
        let topo = StaticTopology::from_links([("a", "b")]);
        topo.unlink(&"a".into(), &"b".into());
        assert!(topo.neighbors(&"a".into()).is_empty());
        assert!(topo.neighbors(&"b".into()).is_empty());
    }

    #[test]
    fn unknown_node_has_no_candidates() {
        let topo = StaticTopology::new();
        assert!(topo.next_hop_candidates(&"ghost".into()).is_empty());
    }
}
