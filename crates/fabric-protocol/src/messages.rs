use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregate::ResultAggregate;
use crate::constants::*;
use crate::types::{CorrelationId, NodeId};
use crate::ProtocolError;

/// A query travelling through the mesh.
///
/// Immutable once sent: every hop builds a new message with the budget
/// reduced by `budget_decrement` and itself as `previous_node`. The
/// `visited_marker` stays the same across hops so a node can recognise the
/// same flood arriving along a second path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub correlation_id: CorrelationId,
    pub query_text: String,
    /// Remaining time budget in milliseconds.
    pub remaining_budget: i64,
    pub budget_decrement: i64,
    /// Hop that sent this message; the originator for the first delivery.
    #[serde(default)]
    pub previous_node: NodeId,
    pub visited_marker: String,
}

impl QueryMessage {
    /// Build the first message of a new query at `origin`.
    pub fn originate(
        origin: &NodeId,
        correlation_id: CorrelationId,
        query_text: impl Into<String>,
        remaining_budget: i64,
        budget_decrement: i64,
    ) -> Self {
        let visited_marker = Self::marker_for(&correlation_id, origin);
        Self {
            correlation_id,
            query_text: query_text.into(),
            remaining_budget,
            budget_decrement,
            previous_node: origin.clone(),
            visited_marker,
        }
    }

    /// Visited marker: hex SHA-256 of the correlation ID and origin node.
    pub fn marker_for(correlation_id: &CorrelationId, origin: &NodeId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(correlation_id.as_str().as_bytes());
        hasher.update(b"/");
        hasher.update(origin.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Budget a forwarded copy of this message would carry.
    pub fn onward_budget(&self) -> i64 {
        self.remaining_budget.saturating_sub(self.budget_decrement)
    }

    /// The copy `from` sends to its onward neighbors.
    pub fn forwarded(&self, from: &NodeId) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            query_text: self.query_text.clone(),
            remaining_budget: self.onward_budget(),
            budget_decrement: self.budget_decrement,
            previous_node: from.clone(),
            visited_marker: self.visited_marker.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.correlation_id.is_empty() {
            return Err(ProtocolError::MissingField("correlation_id"));
        }
        if self.query_text.trim().is_empty() {
            return Err(ProtocolError::MissingField("query_text"));
        }
        if self.visited_marker.is_empty() {
            return Err(ProtocolError::MissingField("visited_marker"));
        }
        Ok(())
    }
}

/// A (partial or final) result travelling back toward the originator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub correlation_id: CorrelationId,
    /// Node that sent this result.
    pub from: NodeId,
    pub aggregate: ResultAggregate,
}

impl ResultMessage {
    pub fn new(correlation_id: CorrelationId, from: NodeId, aggregate: ResultAggregate) -> Self {
        Self { correlation_id, from, aggregate }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.correlation_id.is_empty() {
            return Err(ProtocolError::MissingField("correlation_id"));
        }
        if self.from.is_empty() {
            return Err(ProtocolError::MissingField("from"));
        }
        Ok(())
    }
}

/// All registry protocol messages, tagged by their `action` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolMessage {
    Query(QueryMessage),
    PartialResult(ResultMessage),
    FinalResult(ResultMessage),
}

impl ProtocolMessage {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Query(_) => ACTION_QUERY,
            Self::PartialResult(_) => ACTION_PARTIAL_RESULT,
            Self::FinalResult(_) => ACTION_FINAL_RESULT,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::Query(q) => &q.correlation_id,
            Self::PartialResult(r) | Self::FinalResult(r) => &r.correlation_id,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Query(q) => q.validate(),
            Self::PartialResult(r) | Self::FinalResult(r) => r.validate(),
        }
    }

    /// Encode into a JSON wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let frame = WireFrameRef {
            protocol_version: PROTOCOL_VERSION,
            sent_at: chrono::Utc::now(),
            message: self,
        };
        Ok(serde_json::to_vec(&frame)?)
    }

    /// Decode and validate a JSON wire frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let action = raw
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or(ProtocolError::MissingField("action"))?;
        if ![ACTION_QUERY, ACTION_PARTIAL_RESULT, ACTION_FINAL_RESULT].contains(&action) {
            return Err(ProtocolError::UnknownAction(action.to_string()));
        }
        let frame: WireFrame = serde_json::from_value(raw)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        frame.message.validate()?;
        Ok(frame.message)
    }
}

#[derive(Serialize)]
struct WireFrameRef<'a> {
    protocol_version: &'static str,
    sent_at: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    message: &'a ProtocolMessage,
}

#[derive(Deserialize)]
struct WireFrame {
    #[allow(dead_code)]
    #[serde(default)]
    protocol_version: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    sent_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(flatten)]
    message: ProtocolMessage,
}

/// Per-node registry topic names.
///
/// Every node listens for protocol traffic on its command topic and
/// publishes final results for locally originated queries on its result
/// topic.
pub struct RegistryTopics;

impl RegistryTopics {
    pub fn command(node: &NodeId) -> String {
        Self::from_template(REGISTRY_COMMAND_TOPIC_DEFAULT, node)
    }

    pub fn result(node: &NodeId) -> String {
        Self::from_template(REGISTRY_RESULT_TOPIC_DEFAULT, node)
    }

    /// Expand a topic template, replacing `{0}` with the node name.
    pub fn from_template(template: &str, node: &NodeId) -> String {
        template.replace("{0}", node.as_str())
    }
}
