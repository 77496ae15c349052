//! Per-query set of neighbors still owing a partial result.
//!
//! Every mutation goes through one mutex, and a query's entry is dropped the
//! moment its set becomes empty. Exactly one caller therefore observes
//! [`Removal::NowEmpty`] for a given query, and that caller owns
//! finalization.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use fabric_protocol::{CorrelationId, NodeId};

/// Outcome of removing a neighbor from a query's pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Neighbor removed; this many are still pending.
    Remaining(usize),
    /// The last pending neighbor was removed by this call.
    NowEmpty,
    /// The query has no pending set, or the neighbor was not in it.
    NotPending,
}

#[derive(Debug, Default)]
pub struct PendingSet {
    inner: Mutex<HashMap<CorrelationId, HashSet<NodeId>>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `neighbors` for a query. Returns the pending count.
    /// An empty neighbor list leaves the query untracked.
    pub fn begin(
        &self,
        correlation_id: &CorrelationId,
        neighbors: impl IntoIterator<Item = NodeId>,
    ) -> usize {
        let set: HashSet<NodeId> = neighbors.into_iter().collect();
        let count = set.len();
        if count > 0 {
            self.lock().insert(correlation_id.clone(), set);
        }
        count
    }

    pub fn remove(&self, correlation_id: &CorrelationId, node: &NodeId) -> Removal {
        let mut map = self.lock();
        let Some(set) = map.get_mut(correlation_id) else {
            return Removal::NotPending;
        };
        if !set.remove(node) {
            return Removal::NotPending;
        }
        if set.is_empty() {
            map.remove(correlation_id);
            Removal::NowEmpty
        } else {
            Removal::Remaining(set.len())
        }
    }

    /// Neighbors still pending for a query, sorted.
    pub fn pending(&self, correlation_id: &CorrelationId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .lock()
            .get(correlation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Drop a query's pending set. Returns whether one existed.
    pub fn purge(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().remove(correlation_id).is_some()
    }

    /// Number of queries with at least one pending neighbor.
    pub fn active_queries(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, HashSet<NodeId>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
