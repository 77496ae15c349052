//! Flood-query engine: the per-node protocol state machine.
//!
//! A node that receives a `QUERY` runs it against its local store, floods
//! it to every onward neighbor except the sender, and then waits for one
//! `PARTIAL_RESULT` per flooded neighbor, bounded by the remaining time
//! budget. When the last neighbor answers, or the budget runs out, the
//! node finalizes: the originator publishes a `FINAL_RESULT` to its own
//! result topic, every other node sends a `PARTIAL_RESULT` to the neighbor
//! it received the query from.
//!
//! Finalization happens exactly once per query per node. The only ways to
//! reach it are the removal of the last pending neighbor (which
//! [`PendingSet`] hands to exactly one caller) and the direct paths taken
//! before anything is pending, so no flag is needed.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use fabric_network::{TopologyProvider, Transport};
use fabric_protocol::{
    CorrelationId, NodeId, ProtocolError, ProtocolMessage, QueryMessage, ResultAggregate,
    ResultMessage, DEFAULT_BUDGET_DECREMENT_MS,
};

use crate::pending::{PendingSet, Removal};
use crate::store::LocalStore;
use crate::timer::CompletionTimer;

/// Engine settings for one node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Decrement substituted when an inbound query carries a non-positive one.
    pub default_budget_decrement: i64,
    /// Registry UID of this node's store, used for the co-location check.
    pub registry_uid: Option<String>,
    /// When false, queries are answered from the local store only.
    pub flood_remote_query: bool,
    /// Log per-message handling time and size.
    pub perf_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_budget_decrement: DEFAULT_BUDGET_DECREMENT_MS,
            registry_uid: None,
            flood_remote_query: true,
            perf_logging: false,
        }
    }
}

/// Where a finalized aggregate goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Publish a `FINAL_RESULT` on this node's result topic.
    Originator,
    /// Send a `PARTIAL_RESULT` back to the given neighbor.
    Intermediate { return_to: NodeId },
}

/// What handling one inbound message did. Mostly useful to tests and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The message failed to decode or validate and was dropped.
    Rejected(String),
    /// Flood already seen here; answered with an empty partial.
    DuplicateAnswered,
    /// Flood already seen here and there was nobody to answer.
    DuplicateDropped,
    /// Flooded to neighbors; this many were still pending afterwards.
    Flooded { pending: usize },
    /// A partial was merged; this many neighbors are still pending.
    Merged { remaining: usize },
    /// This call finalized the query.
    Finalized,
    /// Nothing to do: unknown query, late partial, or a final result.
    Ignored,
}

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub queries_received: AtomicU64,
    pub duplicates_answered: AtomicU64,
    pub queries_flooded: AtomicU64,
    pub send_failures: AtomicU64,
    pub partials_merged: AtomicU64,
    pub late_partials: AtomicU64,
    pub local_failures: AtomicU64,
    pub local_skips: AtomicU64,
    pub timeouts: AtomicU64,
    pub finalized: AtomicU64,
    pub rejected: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub queries_received: u64,
    pub duplicates_answered: u64,
    pub queries_flooded: u64,
    pub send_failures: u64,
    pub partials_merged: u64,
    pub late_partials: u64,
    pub local_failures: u64,
    pub local_skips: u64,
    pub timeouts: u64,
    pub finalized: u64,
    pub rejected: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            queries_received: get(&self.queries_received),
            duplicates_answered: get(&self.duplicates_answered),
            queries_flooded: get(&self.queries_flooded),
            send_failures: get(&self.send_failures),
            partials_merged: get(&self.partials_merged),
            late_partials: get(&self.late_partials),
            local_failures: get(&self.local_failures),
            local_skips: get(&self.local_skips),
            timeouts: get(&self.timeouts),
            finalized: get(&self.finalized),
            rejected: get(&self.rejected),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct ActiveQuery {
    role: Role,
    aggregate: Mutex<ResultAggregate>,
}

pub struct FloodQueryEngine {
    node: NodeId,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    topology: Arc<dyn TopologyProvider>,
    store: Arc<dyn LocalStore>,
    active: Mutex<HashMap<CorrelationId, Arc<ActiveQuery>>>,
    pending: PendingSet,
    timers: Mutex<HashMap<CorrelationId, CompletionTimer>>,
    stats: EngineStats,
}

impl FloodQueryEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        topology: Arc<dyn TopologyProvider>,
        store: Arc<dyn LocalStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: transport.local_node().clone(),
            config,
            transport,
            topology,
            store,
            active: Mutex::new(HashMap::new()),
            pending: PendingSet::new(),
            timers: Mutex::new(HashMap::new()),
            stats: EngineStats::default(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Whether a query is still aggregating at this node.
    pub fn is_active(&self, correlation_id: &CorrelationId) -> bool {
        self.active_map().contains_key(correlation_id)
    }

    pub fn active_count(&self) -> usize {
        self.active_map().len()
    }

    /// Neighbors this node is still waiting on for a query.
    pub fn pending_neighbors(&self, correlation_id: &CorrelationId) -> Vec<NodeId> {
        self.pending.pending(correlation_id)
    }

    /// Decode and handle one frame from the command topic.
    pub fn handle_frame(self: &Arc<Self>, data: &[u8]) -> Disposition {
        let started = Instant::now();
        match ProtocolMessage::decode(data) {
            Ok(message) => {
                let action = message.action();
                let disposition = self.handle_message(message);
                if self.config.perf_logging {
                    tracing::info!(
                        node = %self.node,
                        action,
                        size_bytes = data.len(),
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "Handled registry command"
                    );
                }
                disposition
            }
            Err(e) => {
                bump(&self.stats.rejected);
                tracing::warn!(node = %self.node, error = %e, "Dropping malformed registry command");
                Disposition::Rejected(e.to_string())
            }
        }
    }

    pub fn handle_message(self: &Arc<Self>, message: ProtocolMessage) -> Disposition {
        match message {
            ProtocolMessage::Query(query) => self.handle_query(query),
            ProtocolMessage::PartialResult(result) => self.handle_partial(result),
            ProtocolMessage::FinalResult(result) => {
                tracing::debug!(
                    node = %self.node,
                    correlation_id = %result.correlation_id,
                    "Final result on command topic ignored"
                );
                Disposition::Ignored
            }
        }
    }

    /// Handle an inbound `QUERY`.
    ///
    /// Flooding arms a [`CompletionTimer`] on the current tokio runtime.
    /// Called outside one, the node cannot wait and returns whatever it
    /// has at once.
    pub fn handle_query(self: &Arc<Self>, mut query: QueryMessage) -> Disposition {
        if let Err(e) = query.validate() {
            bump(&self.stats.rejected);
            tracing::warn!(node = %self.node, error = %e, "Dropping invalid query");
            return Disposition::Rejected(e.to_string());
        }
        let correlation_id = query.correlation_id.clone();
        let from_self = query.previous_node.is_empty() || query.previous_node.same_node(&self.node);

        if self.transport.is_duplicate_delivery(&query) {
            if from_self {
                tracing::debug!(node = %self.node, correlation_id = %correlation_id, "Dropping repeated local query");
                return Disposition::DuplicateDropped;
            }
            bump(&self.stats.duplicates_answered);
            tracing::debug!(
                node = %self.node,
                correlation_id = %correlation_id,
                previous_node = %query.previous_node,
                "Query already seen, answering with empty result"
            );
            let reply = ProtocolMessage::PartialResult(ResultMessage::new(
                correlation_id,
                self.node.clone(),
                ResultAggregate::empty_for(self.node.clone()),
            ));
            if let Err(e) = self.transport.send(&query.previous_node, &reply) {
                tracing::warn!(node = %self.node, to = %query.previous_node, error = %e, "Failed to answer duplicate query");
            }
            return Disposition::DuplicateAnswered;
        }

        let role = if from_self {
            Role::Originator
        } else {
            Role::Intermediate {
                return_to: query.previous_node.clone(),
            }
        };

        // Claim the correlation id before touching the store. Nothing can
        // finalize the entry until it is flooded, so the aggregate is
        // filled in after the lock is released.
        let entry = {
            let mut active = self.active_map();
            if active.contains_key(&correlation_id) {
                bump(&self.stats.rejected);
                let e = ProtocolError::AlreadyActive(correlation_id.to_string());
                tracing::warn!(node = %self.node, error = %e, "Query already active here");
                return Disposition::Rejected(e.to_string());
            }
            let entry = Arc::new(ActiveQuery {
                role,
                aggregate: Mutex::new(ResultAggregate::new()),
            });
            active.insert(correlation_id.clone(), Arc::clone(&entry));
            entry
        };
        bump(&self.stats.queries_received);

        let local = self.run_local(&query, &entry.role);
        *entry.aggregate.lock().unwrap_or_else(PoisonError::into_inner) = local;

        if query.budget_decrement <= 0 {
            tracing::warn!(
                node = %self.node,
                correlation_id = %correlation_id,
                decrement = query.budget_decrement,
                default = self.config.default_budget_decrement,
                "Non-positive budget decrement, using default"
            );
            query.budget_decrement = self.config.default_budget_decrement;
        }

        let onward = self.onward_neighbors(&query.previous_node);
        if onward.is_empty() {
            tracing::debug!(node = %self.node, correlation_id = %correlation_id, "No onward neighbors");
            return self.finalize(&correlation_id);
        }
        let onward_budget = query.onward_budget();
        if onward_budget < 1 {
            tracing::debug!(
                node = %self.node,
                correlation_id = %correlation_id,
                remaining_budget = query.remaining_budget,
                "Budget exhausted, not flooding"
            );
            return self.finalize(&correlation_id);
        }

        self.flood(query, onward, onward_budget)
    }

    /// Handle an inbound `PARTIAL_RESULT`.
    pub fn handle_partial(self: &Arc<Self>, result: ResultMessage) -> Disposition {
        if let Err(e) = result.validate() {
            bump(&self.stats.rejected);
            tracing::warn!(node = %self.node, error = %e, "Dropping invalid partial result");
            return Disposition::Rejected(e.to_string());
        }
        let correlation_id = result.correlation_id.clone();
        let entry = if self.pending.is_pending(&correlation_id) {
            self.active_map().get(&correlation_id).cloned()
        } else {
            None
        };
        let Some(entry) = entry else {
            bump(&self.stats.late_partials);
            tracing::debug!(
                node = %self.node,
                correlation_id = %correlation_id,
                from = %result.from,
                "Discarding partial result for query not pending here"
            );
            return Disposition::Ignored;
        };

        entry
            .aggregate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(result.aggregate);
        bump(&self.stats.partials_merged);

        match self.pending.remove(&correlation_id, &result.from) {
            Removal::Remaining(remaining) => {
                tracing::debug!(
                    node = %self.node,
                    correlation_id = %correlation_id,
                    from = %result.from,
                    remaining,
                    "Merged partial result"
                );
                Disposition::Merged { remaining }
            }
            Removal::NowEmpty => self.finalize(&correlation_id),
            Removal::NotPending => {
                tracing::debug!(
                    node = %self.node,
                    correlation_id = %correlation_id,
                    from = %result.from,
                    "Partial result from neighbor not pending"
                );
                Disposition::Ignored
            }
        }
    }

    /// Give up on every neighbor still pending for a query.
    pub fn query_timed_out(&self, correlation_id: &CorrelationId) -> Disposition {
        let mut owns_finalization = false;
        for neighbor in self.pending.pending(correlation_id) {
            match self.pending.remove(correlation_id, &neighbor) {
                Removal::NowEmpty => owns_finalization = true,
                Removal::Remaining(_) | Removal::NotPending => {}
            }
            tracing::debug!(
                node = %self.node,
                correlation_id = %correlation_id,
                neighbor = %neighbor,
                "Neighbor timed out"
            );
        }
        if !owns_finalization {
            return Disposition::Ignored;
        }
        bump(&self.stats.timeouts);
        tracing::info!(node = %self.node, correlation_id = %correlation_id, "Query timed out, returning partial results");
        self.finalize(correlation_id)
    }

    fn run_local(&self, query: &QueryMessage, role: &Role) -> ResultAggregate {
        if let Role::Intermediate { return_to } = role {
            if self.shares_store_with(return_to) {
                bump(&self.stats.local_skips);
                tracing::debug!(
                    node = %self.node,
                    previous_node = %return_to,
                    "Previous node shares this registry, skipping local query"
                );
                return ResultAggregate::empty_for(self.node.clone());
            }
        }
        match self.store.execute(&query.query_text) {
            Ok(rows) => ResultAggregate::from_rows(self.node.clone(), rows),
            Err(e) => {
                bump(&self.stats.local_failures);
                tracing::warn!(
                    node = %self.node,
                    correlation_id = %query.correlation_id,
                    error = %e,
                    "Local query failed"
                );
                ResultAggregate::failed(self.node.clone(), e.to_string())
            }
        }
    }

    fn shares_store_with(&self, other: &NodeId) -> bool {
        match (&self.config.registry_uid, self.store.registry_uid_of(other)) {
            (Some(mine), Some(theirs)) => *mine == theirs,
            _ => false,
        }
    }

    fn onward_neighbors(&self, previous_node: &NodeId) -> BTreeSet<NodeId> {
        if !self.config.flood_remote_query {
            return BTreeSet::new();
        }
        self.topology
            .next_hop_candidates(&self.node)
            .into_iter()
            .filter(|n| !n.is_empty() && !n.same_node(&self.node) && !n.same_node(previous_node))
            .collect()
    }

    fn flood(
        self: &Arc<Self>,
        query: QueryMessage,
        onward: BTreeSet<NodeId>,
        onward_budget: i64,
    ) -> Disposition {
        let correlation_id = query.correlation_id.clone();
        let forwarded = ProtocolMessage::Query(query.forwarded(&self.node));
        // Populate before sending so a fast reply always finds its neighbor.
        self.pending.begin(&correlation_id, onward.iter().cloned());
        bump(&self.stats.queries_flooded);

        let mut owns_finalization = false;
        for neighbor in &onward {
            if let Err(e) = self.transport.send(neighbor, &forwarded) {
                bump(&self.stats.send_failures);
                tracing::warn!(
                    node = %self.node,
                    correlation_id = %correlation_id,
                    neighbor = %neighbor,
                    error = %e,
                    "Failed to forward query"
                );
                if self.pending.remove(&correlation_id, neighbor) == Removal::NowEmpty {
                    owns_finalization = true;
                }
            }
        }
        if owns_finalization {
            return self.finalize(&correlation_id);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer_id = correlation_id.clone();
        let Some(timer) = CompletionTimer::start(onward_budget, move || {
            if let Some(engine) = weak.upgrade() {
                engine.query_timed_out(&timer_id);
            }
        }) else {
            tracing::warn!(
                node = %self.node,
                correlation_id = %correlation_id,
                "No runtime to arm completion timer, returning results so far"
            );
            return self.query_timed_out(&correlation_id);
        };
        self.timers_map().insert(correlation_id.clone(), timer);
        // Replies may have completed the query before the timer was stored.
        if !self.pending.is_pending(&correlation_id) {
            self.timers_map().remove(&correlation_id);
        }

        let pending = self.pending.pending(&correlation_id).len();
        tracing::debug!(
            node = %self.node,
            correlation_id = %correlation_id,
            flooded = onward.len(),
            pending,
            onward_budget,
            "Query flooded"
        );
        Disposition::Flooded { pending }
    }

    /// Send the aggregate onward and forget the query.
    fn finalize(&self, correlation_id: &CorrelationId) -> Disposition {
        let Some(entry) = self.active_map().remove(correlation_id) else {
            return Disposition::Ignored;
        };
        self.pending.purge(correlation_id);
        self.timers_map().remove(correlation_id);

        let aggregate = std::mem::take(
            &mut *entry.aggregate.lock().unwrap_or_else(PoisonError::into_inner),
        );
        bump(&self.stats.finalized);
        let contributors = aggregate.contributor_count();
        let result = ResultMessage::new(correlation_id.clone(), self.node.clone(), aggregate);

        let sent = match &entry.role {
            Role::Originator => self
                .transport
                .publish_result(&ProtocolMessage::FinalResult(result)),
            Role::Intermediate { return_to } => self
                .transport
                .send(return_to, &ProtocolMessage::PartialResult(result)),
        };
        match sent {
            Ok(()) => tracing::debug!(
                node = %self.node,
                correlation_id = %correlation_id,
                role = ?entry.role,
                contributors,
                "Query finalized"
            ),
            Err(e) => tracing::warn!(
                node = %self.node,
                correlation_id = %correlation_id,
                role = ?entry.role,
                error = %e,
                "Failed to return query result"
            ),
        }
        Disposition::Finalized
    }

    fn active_map(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, Arc<ActiveQuery>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers_map(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, CompletionTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
