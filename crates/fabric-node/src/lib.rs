//! Fabric Node - runtime wiring for the distributed registry query
//!
//! Loads node and mesh configuration, starts a [`FabricNode`] per mesh
//! member on an in-process [`fabric_network::LocalMesh`], and exposes the
//! query entry points the CLI drives.

pub mod config;
pub mod logging;
pub mod node;
pub mod sim;

pub use config::{ConfigError, MeshConfig, MeshNodeConfig, NodeConfig, QuerySettings};
pub use node::FabricNode;
pub use sim::{QueryRequest, Simulation, SimulationError};
