//! Per-query result aggregate.
//!
//! Holds, per contributing node, the rows that node produced. Merging is
//! first-writer-wins per node: once a node has a non-empty row sequence,
//! later contributions for that node are ignored. This tolerates a
//! duplicate partial arriving after the authoritative one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, Row};
use crate::ProtocolError;

/// Failure of the local shard's query at the node that owns this aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalException {
    pub node: NodeId,
    pub message: String,
}

/// Rows gathered for one query, keyed by the node that produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultAggregate {
    #[serde(default)]
    node_results: BTreeMap<NodeId, Vec<Row>>,
    /// Exception messages per contributing node whose shard failed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    node_exceptions: BTreeMap<NodeId, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_exception: Option<LocalException>,
}

impl ResultAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate holding one node's rows.
    pub fn from_rows(node: NodeId, rows: Vec<Row>) -> Self {
        let mut agg = Self::default();
        agg.node_results.insert(node, rows);
        agg
    }

    /// Aggregate recording an empty contribution for `node`.
    pub fn empty_for(node: NodeId) -> Self {
        Self::from_rows(node, Vec::new())
    }

    /// Aggregate for a node whose own query failed. The node still appears
    /// as a contributor, with no rows.
    pub fn failed(node: NodeId, message: impl Into<String>) -> Self {
        let mut agg = Self::empty_for(node.clone());
        agg.set_local_exception(node, message);
        agg
    }

    pub fn set_local_exception(&mut self, node: NodeId, message: impl Into<String>) {
        let message = message.into();
        self.node_results.entry(node.clone()).or_default();
        self.node_exceptions
            .entry(node.clone())
            .or_default()
            .push(message.clone());
        self.local_exception = Some(LocalException { node, message });
    }

    /// Merge a child's contribution into this aggregate.
    ///
    /// Rows for a node already holding a non-empty sequence are dropped.
    /// The other aggregate's local exception is kept only as a per-node
    /// record; it never replaces this aggregate's own local exception.
    pub fn merge(&mut self, other: ResultAggregate) {
        for (node, rows) in other.node_results {
            match self.node_results.get(&node) {
                Some(existing) if !existing.is_empty() => {
                    tracing::debug!(node = %node, "Ignoring rows, results already established for node");
                }
                _ => {
                    self.node_results.insert(node, rows);
                }
            }
        }
        for (node, messages) in other.node_exceptions {
            self.node_exceptions.entry(node).or_insert(messages);
        }
    }

    pub fn local_exception(&self) -> Option<&LocalException> {
        self.local_exception.as_ref()
    }

    pub fn node_exceptions(&self) -> &BTreeMap<NodeId, Vec<String>> {
        &self.node_exceptions
    }

    pub fn has_exceptions(&self) -> bool {
        !self.node_exceptions.is_empty()
    }

    pub fn rows_for(&self, node: &NodeId) -> Option<&[Row]> {
        self.node_results.get(node).map(Vec::as_slice)
    }

    pub fn contributors(&self) -> impl Iterator<Item = &NodeId> {
        self.node_results.keys()
    }

    pub fn contributor_count(&self) -> usize {
        self.node_results.len()
    }

    /// All rows, grouped by node in node order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.node_results.values().flatten()
    }

    pub fn row_count(&self) -> usize {
        self.node_results.values().map(Vec::len).sum()
    }

    /// First non-null value of the first non-empty row found, for
    /// queries that expect a single scalar answer.
    pub fn first_string(&self) -> Option<String> {
        self.node_results
            .values()
            .filter_map(|rows| rows.first())
            .find_map(|row| row.values().find_map(|v| v.as_text()))
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl fmt::Display for ResultAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node_results.is_empty() && self.node_exceptions.is_empty() {
            return writeln!(f, "NO RESULTS AVAILABLE");
        }
        for (node, rows) in &self.node_results {
            for row in rows {
                writeln!(f, "{node}:\t{row}")?;
            }
            if let Some(messages) = self.node_exceptions.get(node) {
                for message in messages {
                    writeln!(f, "{node}:\tEXCEPTION -> {message}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: &str) -> Row {
        Row::new().with("name", v)
    }

    #[test]
    fn merge_stores_rows_for_absent_node() {
        let mut agg = ResultAggregate::from_rows("a".into(), vec![row("a1")]);
        agg.merge(ResultAggregate::from_rows("b".into(), vec![row("b1"), row("b2")]));
        assert_eq!(agg.contributor_count(), 2);
        assert_eq!(agg.row_count(), 3);
    }

    #[test]
    fn merge_is_first_writer_wins() {
        let mut agg = ResultAggregate::from_rows("a".into(), vec![row("first")]);
        agg.merge(ResultAggregate::from_rows("a".into(), vec![row("second")]));
        let rows = agg.rows_for(&"a".into()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_string("name").as_deref(), Some("first"));
    }

    #[test]
    fn merge_fills_empty_entry() {
        let mut agg = ResultAggregate::empty_for("a".into());
        agg.merge(ResultAggregate::from_rows("a".into(), vec![row("late")]));
        assert_eq!(agg.rows_for(&"a".into()).unwrap().len(), 1);
    }

    #[test]
    fn merge_keeps_own_local_exception() {
        let mut agg = ResultAggregate::failed("a".into(), "disk on fire");
        agg.merge(ResultAggregate::failed("b".into(), "table missing"));
        assert_eq!(agg.local_exception().unwrap().node, NodeId::from("a"));
        assert_eq!(agg.node_exceptions().len(), 2);
    }

    #[test]
    fn remote_exception_does_not_become_local() {
        let mut agg = ResultAggregate::from_rows("a".into(), vec![row("ok")]);
        agg.merge(ResultAggregate::failed("b".into(), "boom"));
        assert!(agg.local_exception().is_none());
        assert!(agg.has_exceptions());
        assert_eq!(agg.rows_for(&"b".into()).unwrap().len(), 0);
    }

    #[test]
    fn first_string_skips_empty_nodes() {
        let mut agg = ResultAggregate::empty_for("a".into());
        agg.merge(ResultAggregate::from_rows("b".into(), vec![row("value")]));
        assert_eq!(agg.first_string().as_deref(), Some("value"));
    }

    #[test]
    fn display_reports_no_results() {
        assert_eq!(ResultAggregate::new().to_string(), "NO RESULTS AVAILABLE\n");
    }
}
