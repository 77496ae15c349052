//! Whole-mesh simulation built from a [`MeshConfig`].

use std::collections::BTreeMap;
use std::sync::Arc;

use fabric_network::{LocalMesh, MeshOptions, StaticTopology, TransportError};
use fabric_protocol::{NodeId, QueryScope, ResultAggregate};
use fabric_query::{MemoryStore, QueryError};

use crate::config::{ConfigError, MeshConfig};
use crate::node::FabricNode;

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Unknown node: {0}")]
    UnknownNode(String),
}

/// Per-query overrides for [`Simulation::run`].
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub timeout_ms: Option<i64>,
    pub decrement_ms: Option<i64>,
    pub scope: QueryScope,
}

pub struct Simulation {
    config: MeshConfig,
    mesh: LocalMesh,
    topology: Arc<StaticTopology>,
    nodes: BTreeMap<NodeId, FabricNode>,
    stores: BTreeMap<NodeId, Arc<MemoryStore>>,
}

impl Simulation {
    /// Start every node of `config` on a fresh mesh.
    pub fn start(config: MeshConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let mesh = LocalMesh::with_options(MeshOptions {
            latency_ms: config.latency_ms.map(|[min, max]| (min, max)),
        });
        let topology = Arc::new(StaticTopology::from_links(config.links()));

        let mut stores = BTreeMap::new();
        for node in &config.nodes {
            let store = MemoryStore::new();
            for (table, rows) in node.table_rows() {
                store.insert_table(&table, rows);
            }
            // Every store lists the registry of every node, like a shared
            // node table would.
            for other in &config.nodes {
                if let Some(uid) = &other.registry_uid {
                    store.publish_registry_uid(NodeId::new(other.name.clone()), uid.clone());
                }
            }
            if let Some(message) = &node.fail_queries {
                store.fail_with(message.clone());
            }
            topology.add_node(NodeId::new(node.name.clone()));
            stores.insert(NodeId::new(node.name.clone()), Arc::new(store));
        }

        let mut nodes = BTreeMap::new();
        for node in &config.nodes {
            let id = NodeId::new(node.name.clone());
            let store = stores
                .get(&id)
                .cloned()
                .ok_or_else(|| SimulationError::UnknownNode(node.name.clone()))?;
            let fabric_node = FabricNode::start(
                &config.node_config(node),
                &mesh,
                topology.clone(),
                store,
            )?;
            mesh.set_unreachable(&id, node.unreachable);
            mesh.set_lossy(&id, node.lossy);
            nodes.insert(id, fabric_node);
        }

        tracing::info!(
            nodes = nodes.len(),
            links = config.links().len(),
            "Simulated mesh started"
        );
        Ok(Self {
            config,
            mesh,
            topology,
            nodes,
            stores,
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn mesh(&self) -> &LocalMesh {
        &self.mesh
    }

    pub fn topology(&self) -> &Arc<StaticTopology> {
        &self.topology
    }

    pub fn node(&self, name: &str) -> Option<&FabricNode> {
        self.nodes
            .iter()
            .find(|(id, _)| id.same_node(&NodeId::new(name)))
            .map(|(_, node)| node)
    }

    pub fn store(&self, name: &str) -> Option<&Arc<MemoryStore>> {
        self.stores
            .iter()
            .find(|(id, _)| id.same_node(&NodeId::new(name)))
            .map(|(_, store)| store)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FabricNode> {
        self.nodes.values()
    }

    /// Issue `query_text` at node `from`.
    pub async fn run(
        &self,
        from: &str,
        query_text: &str,
        request: QueryRequest,
    ) -> Result<ResultAggregate, SimulationError> {
        let node = self
            .node(from)
            .ok_or_else(|| SimulationError::UnknownNode(from.to_string()))?;
        let aggregate = match request.scope {
            QueryScope::Local => node.query_scoped(query_text, QueryScope::Local).await?,
            QueryScope::Distributed => {
                let timeout = request
                    .timeout_ms
                    .unwrap_or(self.config.defaults.distributed_timeout_ms);
                let decrement = request
                    .decrement_ms
                    .unwrap_or(self.config.defaults.distributed_timeout_decrement_ms);
                node.query_with_budget(query_text, timeout, decrement).await?
            }
        };
        Ok(aggregate)
    }
}
