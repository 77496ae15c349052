use fabric_protocol::{NodeId, ProtocolMessage, QueryMessage};

use crate::TransportError;

/// Outbound side of a node's connection to the mesh.
///
/// Implementations must be cheap to call from many concurrent message
/// handlers; sends never block on the receiver.
pub trait Transport: Send + Sync {
    /// Identity of the node this transport belongs to.
    fn local_node(&self) -> &NodeId;

    /// Point-to-point send to `neighbor`'s command topic.
    fn send(&self, neighbor: &NodeId, message: &ProtocolMessage) -> Result<(), TransportError>;

    /// Publish on this node's own result topic, where the local query
    /// coordinator waits for final results.
    fn publish_result(&self, message: &ProtocolMessage) -> Result<(), TransportError>;

    /// Whether this query has already been delivered to this node along
    /// another path. Records the delivery as a side effect.
    fn is_duplicate_delivery(&self, query: &QueryMessage) -> bool;
}
