//! Fabric Protocol - Core types and message definitions
//!
//! Implements the message model of the fabric distributed registry query:
//! a query is flooded across the node mesh as a `QUERY` message, each node
//! answers its parent with a `PARTIAL_RESULT`, and the originating node
//! publishes a `FINAL_RESULT` on its own result topic.

pub mod aggregate;
pub mod constants;
pub mod delivery;
pub mod error;
pub mod messages;
pub mod types;

pub use aggregate::*;
pub use constants::*;
pub use delivery::DeliveryLog;
pub use error::*;
pub use messages::*;
pub use types::*;
