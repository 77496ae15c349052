use fabric_protocol::{NodeId, ProtocolError};
use thiserror::Error;

/// Failure to hand a frame to a neighbor.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown neighbor: {0}")]
    UnknownNeighbor(NodeId),

    #[error("neighbor {0} is unreachable")]
    Unreachable(NodeId),

    #[error("channel to {0} is closed")]
    ChannelClosed(NodeId),

    #[error("node {0} has already joined the mesh")]
    AlreadyJoined(NodeId),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),
}
