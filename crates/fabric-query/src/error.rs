use fabric_network::TransportError;
use fabric_protocol::{CorrelationId, NodeId, ProtocolError};

use crate::store::LocalQueryError;

/// Errors returned to the caller of a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query {correlation_id} timed out after {timeout_ms} ms")]
    QueryTimeout {
        correlation_id: CorrelationId,
        timeout_ms: i64,
    },

    #[error("Query failed on node {node}: {message}")]
    RemoteQueryFailure { node: NodeId, message: String },

    #[error("Local query failed: {0}")]
    Local(#[from] LocalQueryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
