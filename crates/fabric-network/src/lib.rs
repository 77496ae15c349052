//! Fabric Network - transport and topology seams
//!
//! The flood-query engine only talks to the network through the
//! [`Transport`] and [`TopologyProvider`] traits. [`LocalMesh`] provides an
//! in-process implementation that carries JSON frames between nodes over
//! per-node command and result topics.

pub mod error;
pub mod mesh;
pub mod topology;
pub mod transport;

pub use error::TransportError;
pub use mesh::{Frame, LocalMesh, MeshEndpoint, MeshInbox, MeshOptions, MessageTrace};
pub use topology::{StaticTopology, TopologyProvider};
pub use transport::Transport;
