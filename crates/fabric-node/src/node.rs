//! A running fabric node.
//!
//! Joins the mesh, then runs two dispatch loops: the command loop hands
//! every inbound frame to the flood-query engine on its own task, the
//! result loop hands final results to the coordinator's waiting callers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fabric_network::{Frame, LocalMesh, MeshInbox, TopologyProvider, Transport, TransportError};
use fabric_protocol::{NodeId, QueryScope, ResultAggregate};
use fabric_query::{EngineStatsSnapshot, FloodQueryEngine, LocalStore, QueryCoordinator, QueryError};

use crate::config::NodeConfig;

pub struct FabricNode {
    node: NodeId,
    engine: Arc<FloodQueryEngine>,
    coordinator: Arc<QueryCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl FabricNode {
    /// Join `mesh` and start serving. Must be called inside a tokio runtime.
    pub fn start(
        config: &NodeConfig,
        mesh: &LocalMesh,
        topology: Arc<dyn TopologyProvider>,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self, TransportError> {
        let (endpoint, MeshInbox { commands, results }) = mesh.join_with_topics(
            config.node_name.clone(),
            config.command_topic(),
            config.result_topic(),
            config.settings.duplicate_window_secs,
        )?;
        let transport: Arc<dyn Transport> = Arc::new(endpoint);

        let engine = FloodQueryEngine::new(
            config.engine_config(),
            Arc::clone(&transport),
            topology,
            Arc::clone(&store),
        );
        let coordinator = Arc::new(QueryCoordinator::new(
            config.coordinator_config(),
            transport,
            store,
        ));

        let tasks = vec![
            tokio::spawn(command_loop(Arc::clone(&engine), commands)),
            tokio::spawn(result_loop(Arc::clone(&coordinator), results)),
        ];
        tracing::info!(
            node = %config.node_name,
            command_topic = %config.command_topic(),
            registry_uid = ?config.registry_uid,
            "Fabric node started"
        );

        Ok(Self {
            node: config.node_name.clone(),
            engine,
            coordinator,
            tasks,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn engine(&self) -> &Arc<FloodQueryEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<QueryCoordinator> {
        &self.coordinator
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.engine.stats().snapshot()
    }

    /// Run a query with this node's configured budget.
    pub async fn query(&self, query_text: &str) -> Result<ResultAggregate, QueryError> {
        self.coordinator.run_query_default(query_text).await
    }

    pub async fn query_scoped(
        &self,
        query_text: &str,
        scope: QueryScope,
    ) -> Result<ResultAggregate, QueryError> {
        self.coordinator.run_scoped(query_text, scope).await
    }

    pub async fn query_with_budget(
        &self,
        query_text: &str,
        timeout_budget: i64,
        budget_decrement: i64,
    ) -> Result<ResultAggregate, QueryError> {
        self.coordinator
            .run_query(query_text, timeout_budget, budget_decrement)
            .await
    }

    /// Stop both dispatch loops.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::debug!(node = %self.node, "Fabric node stopped");
    }
}

impl Drop for FabricNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn command_loop(engine: Arc<FloodQueryEngine>, mut commands: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = commands.recv().await {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tracing::trace!(node = %engine.node_id(), from = %frame.from, topic = %frame.topic, "Command frame");
            engine.handle_frame(&frame.data);
        });
    }
    tracing::debug!("Command topic closed");
}

async fn result_loop(coordinator: Arc<QueryCoordinator>, mut results: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = results.recv().await {
        coordinator.handle_result_frame(&frame.data);
    }
    tracing::debug!("Result topic closed");
}
