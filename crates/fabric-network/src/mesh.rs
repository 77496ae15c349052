//! In-process mesh carrying JSON frames between nodes.
//!
//! Every node that joins gets a command topic and a result topic, each
//! backed by an unbounded channel. Frames are encoded on send and decoded
//! by the receiver, so the wire format is exercised exactly as a real
//! transport would exercise it.
//!
//! Fault injection:
//! - unreachable nodes make `send` fail with [`TransportError::Unreachable`]
//! - lossy nodes accept frames and silently drop them
//! - optional random latency reorders deliveries between nodes

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use fabric_protocol::{
    DeliveryLog, NodeId, ProtocolMessage, QueryMessage, RegistryTopics,
    DEFAULT_DUPLICATE_WINDOW_SECS,
};

use crate::{Transport, TransportError};

const MAX_TRACE_ENTRIES: usize = 5000;

/// One frame as delivered to a node's topic.
#[derive(Debug, Clone)]
pub struct Frame {
    pub topic: String,
    pub from: NodeId,
    pub data: Vec<u8>,
}

/// Receiving side of a node's two topics.
pub struct MeshInbox {
    pub commands: mpsc::UnboundedReceiver<Frame>,
    pub results: mpsc::UnboundedReceiver<Frame>,
}

/// Trace record for every frame handed to the mesh.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageTrace {
    pub timestamp: std::time::SystemTime,
    pub from: NodeId,
    pub to: NodeId,
    pub topic: String,
    pub action: &'static str,
    pub correlation_id: String,
    pub size_bytes: usize,
    pub outcome: &'static str,
}

/// Mesh-wide delivery options.
#[derive(Debug, Clone, Default)]
pub struct MeshOptions {
    /// Random per-frame delay range in milliseconds (inclusive).
    pub latency_ms: Option<(u64, u64)>,
}

struct NodeChannels {
    command_topic: String,
    result_topic: String,
    command_tx: mpsc::UnboundedSender<Frame>,
    result_tx: mpsc::UnboundedSender<Frame>,
}

struct MeshInner {
    nodes: RwLock<HashMap<NodeId, NodeChannels>>,
    unreachable: RwLock<HashSet<NodeId>>,
    lossy: RwLock<HashSet<NodeId>>,
    trace: Mutex<Vec<MessageTrace>>,
    options: MeshOptions,
}

/// Shared in-process mesh. Cloning yields another handle to the same mesh.
#[derive(Clone)]
pub struct LocalMesh {
    inner: Arc<MeshInner>,
}

enum TopicKind {
    Command,
    Result,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::with_options(MeshOptions::default())
    }

    pub fn with_options(options: MeshOptions) -> Self {
        Self {
            inner: Arc::new(MeshInner {
                nodes: RwLock::new(HashMap::new()),
                unreachable: RwLock::new(HashSet::new()),
                lossy: RwLock::new(HashSet::new()),
                trace: Mutex::new(Vec::new()),
                options,
            }),
        }
    }

    /// Attach `node` to the mesh, returning its outbound endpoint and inbox.
    pub fn join(&self, node: NodeId) -> Result<(MeshEndpoint, MeshInbox), TransportError> {
        self.join_with_window(node, DEFAULT_DUPLICATE_WINDOW_SECS)
    }

    pub fn join_with_window(
        &self,
        node: NodeId,
        duplicate_window_secs: u64,
    ) -> Result<(MeshEndpoint, MeshInbox), TransportError> {
        let command_topic = RegistryTopics::command(&node);
        let result_topic = RegistryTopics::result(&node);
        self.join_with_topics(node, command_topic, result_topic, duplicate_window_secs)
    }

    /// Attach `node` with explicit command and result topic names.
    pub fn join_with_topics(
        &self,
        node: NodeId,
        command_topic: String,
        result_topic: String,
        duplicate_window_secs: u64,
    ) -> Result<(MeshEndpoint, MeshInbox), TransportError> {
        let mut nodes = self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.contains_key(&node) {
            return Err(TransportError::AlreadyJoined(node));
        }
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (result_tx, results) = mpsc::unbounded_channel();
        nodes.insert(
            node.clone(),
            NodeChannels {
                command_topic,
                result_topic,
                command_tx,
                result_tx,
            },
        );
        tracing::debug!(node = %node, "Node joined mesh");

        let endpoint = MeshEndpoint {
            node,
            mesh: self.clone(),
            deliveries: Mutex::new(DeliveryLog::with_window(duplicate_window_secs)),
        };
        Ok((endpoint, MeshInbox { commands, results }))
    }

    /// Detach a node; its inbox closes once pending frames drain.
    pub fn leave(&self, node: &NodeId) {
        let mut nodes = self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.remove(node);
    }

    /// Sends to an unreachable node fail immediately.
    pub fn set_unreachable(&self, node: &NodeId, unreachable: bool) {
        let mut set = self.inner.unreachable.write().unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    /// Sends to a lossy node succeed but the frame is never delivered.
    pub fn set_lossy(&self, node: &NodeId, lossy: bool) {
        let mut set = self.inner.lossy.write().unwrap_or_else(PoisonError::into_inner);
        if lossy {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<NodeId> = nodes.keys().cloned().collect();
        members.sort();
        members
    }

    /// Snapshot of the frame trace.
    pub fn trace(&self) -> Vec<MessageTrace> {
        self.inner.trace.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of delivered frames matching `action` from `from` for a query.
    pub fn count_sent(&self, from: &NodeId, action: &str, correlation_id: &str) -> usize {
        self.inner
            .trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| {
                &t.from == from
                    && t.action == action
                    && t.correlation_id == correlation_id
                    && t.outcome == "delivered"
            })
            .count()
    }

    fn deliver(
        &self,
        from: &NodeId,
        to: &NodeId,
        kind: TopicKind,
        message: &ProtocolMessage,
    ) -> Result<(), TransportError> {
        let data = message.encode()?;
        let size_bytes = data.len();

        let (topic, tx, outcome) = {
            let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
            let unreachable = self
                .inner
                .unreachable
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(to);
            let lossy = self
                .inner
                .lossy
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(to);

            match nodes.get(to) {
                None => {
                    self.record(from, to, String::new(), message, size_bytes, "unknown");
                    return Err(TransportError::UnknownNeighbor(to.clone()));
                }
                Some(_) if unreachable => {
                    self.record(from, to, String::new(), message, size_bytes, "unreachable");
                    return Err(TransportError::Unreachable(to.clone()));
                }
                Some(channels) => {
                    let (topic, tx) = match kind {
                        TopicKind::Command => (channels.command_topic.clone(), channels.command_tx.clone()),
                        TopicKind::Result => (channels.result_topic.clone(), channels.result_tx.clone()),
                    };
                    (topic, tx, if lossy { "dropped" } else { "delivered" })
                }
            }
        };

        self.record(from, to, topic.clone(), message, size_bytes, outcome);
        if outcome == "dropped" {
            tracing::trace!(from = %from, to = %to, action = message.action(), "Frame dropped by lossy link");
            return Ok(());
        }

        let frame = Frame { topic, from: from.clone(), data };
        match self.delay() {
            Some(delay) => {
                let to = to.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(frame).is_err() {
                        tracing::debug!(to = %to, "Delayed frame dropped, inbox closed");
                    }
                });
                Ok(())
            }
            None => tx
                .send(frame)
                .map_err(|_| TransportError::ChannelClosed(to.clone())),
        }
    }

    fn delay(&self) -> Option<Duration> {
        let (min, max) = self.inner.options.latency_ms?;
        // Delayed delivery needs a runtime to park the frame on.
        tokio::runtime::Handle::try_current().ok()?;
        let ms = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Some(Duration::from_millis(ms))
    }

    fn record(
        &self,
        from: &NodeId,
        to: &NodeId,
        topic: String,
        message: &ProtocolMessage,
        size_bytes: usize,
        outcome: &'static str,
    ) {
        let mut trace = self.inner.trace.lock().unwrap_or_else(PoisonError::into_inner);
        if trace.len() >= MAX_TRACE_ENTRIES {
            trace.remove(0);
        }
        trace.push(MessageTrace {
            timestamp: std::time::SystemTime::now(),
            from: from.clone(),
            to: to.clone(),
            topic,
            action: message.action(),
            correlation_id: message.correlation_id().to_string(),
            size_bytes,
            outcome,
        });
    }
}

impl Default for LocalMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// A node's handle on the mesh.
pub struct MeshEndpoint {
    node: NodeId,
    mesh: LocalMesh,
    deliveries: Mutex<DeliveryLog>,
}

impl MeshEndpoint {
    pub fn mesh(&self) -> &LocalMesh {
        &self.mesh
    }
}

impl Transport for MeshEndpoint {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn send(&self, neighbor: &NodeId, message: &ProtocolMessage) -> Result<(), TransportError> {
        self.mesh.deliver(&self.node, neighbor, TopicKind::Command, message)
    }

    fn publish_result(&self, message: &ProtocolMessage) -> Result<(), TransportError> {
        self.mesh.deliver(&self.node, &self.node, TopicKind::Result, message)
    }

    fn is_duplicate_delivery(&self, query: &QueryMessage) -> bool {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_insert(&query.visited_marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_protocol::{CorrelationId, ResultAggregate, ResultMessage};

    fn partial(from: &str) -> ProtocolMessage {
        ProtocolMessage::PartialResult(ResultMessage::new(
            CorrelationId::new("c-1"),
            NodeId::new(from),
            ResultAggregate::empty_for(NodeId::new(from)),
        ))
    }

    #[test]
    fn join_twice_is_rejected() {
        let mesh = LocalMesh::new();
        mesh.join("a".into()).unwrap();
        assert!(matches!(mesh.join("a".into()), Err(TransportError::AlreadyJoined(_))));
    }

    #[tokio::test]
    async fn command_frames_land_on_command_topic() {
        let mesh = LocalMesh::new();
        let (a, _a_inbox) = mesh.join("a".into()).unwrap();
        let (_b, mut b_inbox) = mesh.join("b".into()).unwrap();

        a.send(&"b".into(), &partial("a")).unwrap();
        let frame = b_inbox.commands.recv().await.unwrap();
        assert_eq!(frame.topic, "$fabric/b/$registry/$command");
        assert_eq!(frame.from, NodeId::new("a"));
        assert!(matches!(ProtocolMessage::decode(&frame.data).unwrap(), ProtocolMessage::PartialResult(_)));
    }

    #[tokio::test]
    async fn published_results_stay_local() {
        let mesh = LocalMesh::new();
        let (a, mut a_inbox) = mesh.join("a".into()).unwrap();
        a.publish_result(&partial("a")).unwrap();
        let frame = a_inbox.results.recv().await.unwrap();
        assert_eq!(frame.topic, "$fabric/a/$registry/$results");
    }

    #[test]
    fn unreachable_and_unknown_neighbors_fail() {
        let mesh = LocalMesh::new();
        let (a, _ai) = mesh.join("a".into()).unwrap();
        let (_b, _bi) = mesh.join("b".into()).unwrap();
        mesh.set_unreachable(&"b".into(), true);

        assert!(matches!(a.send(&"b".into(), &partial("a")), Err(TransportError::Unreachable(_))));
        assert!(matches!(a.send(&"zz".into(), &partial("a")), Err(TransportError::UnknownNeighbor(_))));
    }

    #[test]
    fn lossy_neighbor_swallows_frames() {
        let mesh = LocalMesh::new();
        let (a, _ai) = mesh.join("a".into()).unwrap();
        let (_b, mut bi) = mesh.join("b".into()).unwrap();
        mesh.set_lossy(&"b".into(), true);

        assert!(a.send(&"b".into(), &partial("a")).is_ok());
        assert!(bi.commands.try_recv().is_err());
        assert_eq!(mesh.count_sent(&"a".into(), "PARTIAL_RESULT", "c-1"), 0);
    }

    #[test]
    fn duplicate_delivery_is_detected_per_endpoint() {
        let mesh = LocalMesh::new();
        let (a, _ai) = mesh.join("a".into()).unwrap();
        let (b, _bi) = mesh.join("b".into()).unwrap();
        let q = QueryMessage::originate(&"a".into(), CorrelationId::new("c-1"), "SELECT 1", 100, 10);

        assert!(!a.is_duplicate_delivery(&q));
        assert!(a.is_duplicate_delivery(&q.forwarded(&"b".into())));
        assert!(!b.is_duplicate_delivery(&q));
    }
}
