//! Per-node query entry point.
//!
//! Issues a query on behalf of a local caller by sending a `QUERY` to this
//! node's own command topic, then waits for the matching `FINAL_RESULT`
//! on the node's result topic, bounded by the caller's timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use fabric_network::Transport;
use fabric_protocol::{
    CorrelationId, NodeId, ProtocolError, ProtocolMessage, QueryMessage, QueryScope,
    ResultAggregate, ResultMessage, DEFAULT_BUDGET_DECREMENT_MS, DEFAULT_TIMEOUT_BUDGET_MS,
};

use crate::error::QueryError;
use crate::store::LocalStore;

/// How per-node failures reported inside a final aggregate reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailurePolicy {
    /// Return whatever rows arrived; remote failures stay recorded in the
    /// aggregate only. The originator's own failure is always an error.
    #[default]
    BestEffort,
    /// Any recorded node failure fails the whole query.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub default_timeout_budget: i64,
    pub default_budget_decrement: i64,
    pub remote_failure_policy: RemoteFailurePolicy,
    /// When false, every query runs with [`QueryScope::Local`].
    pub flood_remote_query: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_budget: DEFAULT_TIMEOUT_BUDGET_MS,
            default_budget_decrement: DEFAULT_BUDGET_DECREMENT_MS,
            remote_failure_policy: RemoteFailurePolicy::default(),
            flood_remote_query: true,
        }
    }
}

pub struct QueryCoordinator {
    node: NodeId,
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn LocalStore>,
    waiters: Mutex<HashMap<CorrelationId, oneshot::Sender<ResultAggregate>>>,
}

impl QueryCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            node: transport.local_node().clone(),
            config,
            transport,
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of callers still waiting for a final result.
    pub fn waiting(&self) -> usize {
        self.waiters_map().len()
    }

    /// Run a query with the configured budget and decrement.
    pub async fn run_query_default(&self, query_text: &str) -> Result<ResultAggregate, QueryError> {
        self.run_scoped(query_text, QueryScope::Distributed).await
    }

    /// Run a query either on this node only or across the mesh.
    pub async fn run_scoped(
        &self,
        query_text: &str,
        scope: QueryScope,
    ) -> Result<ResultAggregate, QueryError> {
        match scope {
            QueryScope::Distributed if self.config.flood_remote_query => {
                self.run_query(
                    query_text,
                    self.config.default_timeout_budget,
                    self.config.default_budget_decrement,
                )
                .await
            }
            _ => self.run_local(query_text),
        }
    }

    /// Answer from this node's store without touching the mesh.
    pub fn run_local(&self, query_text: &str) -> Result<ResultAggregate, QueryError> {
        if query_text.trim().is_empty() {
            return Err(ProtocolError::MissingField("query_text").into());
        }
        let rows = self.store.execute(query_text)?;
        Ok(ResultAggregate::from_rows(self.node.clone(), rows))
    }

    /// Flood a query from this node and wait for the final aggregate.
    ///
    /// `timeout_budget` bounds the caller's wait in milliseconds. The query
    /// itself leaves with one decrement already taken off, so the mesh
    /// finishes before the caller gives up.
    pub async fn run_query(
        &self,
        query_text: &str,
        timeout_budget: i64,
        budget_decrement: i64,
    ) -> Result<ResultAggregate, QueryError> {
        if query_text.trim().is_empty() {
            return Err(ProtocolError::MissingField("query_text").into());
        }
        if timeout_budget <= 0 {
            return Err(ProtocolError::InvalidBudget(format!(
                "timeout budget must be positive, got {timeout_budget}"
            ))
            .into());
        }
        if budget_decrement <= 0 {
            return Err(ProtocolError::InvalidBudget(format!(
                "budget decrement must be positive, got {budget_decrement}"
            ))
            .into());
        }

        let mut sent_budget = timeout_budget - budget_decrement;
        if sent_budget < 1 {
            tracing::warn!(
                node = %self.node,
                timeout_budget,
                budget_decrement,
                "Decrement consumes the whole budget, sending full timeout"
            );
            sent_budget = timeout_budget;
        }

        let correlation_id = CorrelationId::generate();
        let message = QueryMessage::originate(
            &self.node,
            correlation_id.clone(),
            query_text,
            sent_budget,
            budget_decrement,
        );

        let (tx, rx) = oneshot::channel();
        self.waiters_map().insert(correlation_id.clone(), tx);

        tracing::info!(
            node = %self.node,
            correlation_id = %correlation_id,
            timeout_budget,
            budget_decrement,
            "Issuing distributed query"
        );
        if let Err(e) = self.transport.send(&self.node, &ProtocolMessage::Query(message)) {
            self.waiters_map().remove(&correlation_id);
            return Err(e.into());
        }

        let wait = Duration::from_millis(timeout_budget as u64);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(aggregate)) => self.check_failures(aggregate),
            Ok(Err(_)) | Err(_) => {
                self.waiters_map().remove(&correlation_id);
                tracing::warn!(
                    node = %self.node,
                    correlation_id = %correlation_id,
                    timeout_budget,
                    "Distributed query timed out"
                );
                Err(QueryError::QueryTimeout {
                    correlation_id,
                    timeout_ms: timeout_budget,
                })
            }
        }
    }

    /// Hand a final result to its waiting caller. Returns whether one was
    /// still waiting.
    pub fn deliver_final(&self, result: ResultMessage) -> bool {
        let Some(waiter) = self.waiters_map().remove(&result.correlation_id) else {
            tracing::debug!(
                node = %self.node,
                correlation_id = %result.correlation_id,
                "No caller waiting for final result"
            );
            return false;
        };
        waiter.send(result.aggregate).is_ok()
    }

    /// Decode and deliver one frame from the result topic.
    pub fn handle_result_frame(&self, data: &[u8]) -> bool {
        match ProtocolMessage::decode(data) {
            Ok(ProtocolMessage::FinalResult(result)) => self.deliver_final(result),
            Ok(other) => {
                tracing::debug!(
                    node = %self.node,
                    action = other.action(),
                    "Unexpected message on result topic"
                );
                false
            }
            Err(e) => {
                tracing::warn!(node = %self.node, error = %e, "Dropping malformed result frame");
                false
            }
        }
    }

    fn check_failures(&self, aggregate: ResultAggregate) -> Result<ResultAggregate, QueryError> {
        if let Some(local) = aggregate.local_exception() {
            return Err(QueryError::RemoteQueryFailure {
                node: local.node.clone(),
                message: local.message.clone(),
            });
        }
        if self.config.remote_failure_policy == RemoteFailurePolicy::FailFast {
            if let Some((node, messages)) = aggregate.node_exceptions().iter().next() {
                return Err(QueryError::RemoteQueryFailure {
                    node: node.clone(),
                    message: messages.join("; "),
                });
            }
        }
        if aggregate.has_exceptions() {
            tracing::debug!(
                node = %self.node,
                failed_nodes = aggregate.node_exceptions().len(),
                "Returning best-effort result with remote failures"
            );
        }
        Ok(aggregate)
    }

    fn waiters_map(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, oneshot::Sender<ResultAggregate>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
