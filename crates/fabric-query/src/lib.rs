//! Fabric Query - flood-query engine and per-node query coordinator
//!
//! A query issued at one node is flooded to every reachable node over the
//! neighbor graph. Each node runs the query against its local store, waits
//! for its onward neighbors (bounded by a shrinking time budget) and sends
//! the merged result back toward the originator, which publishes the final
//! answer to the waiting caller.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod pending;
pub mod store;
pub mod timer;

pub use coordinator::{CoordinatorConfig, QueryCoordinator, RemoteFailurePolicy};
pub use engine::{Disposition, EngineConfig, EngineStats, EngineStatsSnapshot, FloodQueryEngine, Role};
pub use error::QueryError;
pub use pending::{PendingSet, Removal};
pub use store::{LocalQueryError, LocalStore, MemoryStore};
pub use timer::CompletionTimer;
