//! Node and mesh configuration.
//!
//! A mesh file describes every node of a simulated fabric: shared query
//! settings under `[defaults]`, then one `[[node]]` table per node with
//! its neighbors, fault flags and table contents.
//!
//! ```toml
//! [defaults]
//! distributed_timeout_ms = 2000
//! distributed_timeout_decrement_ms = 200
//!
//! [[node]]
//! name = "origin"
//! registry_uid = "reg-1"
//! neighbors = ["b"]
//!
//! [node.tables]
//! SERVICES = [ { id = "svc-1", port = 8080 } ]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use fabric_protocol::{
    NodeId, RegistryTopics, Row, Value, DEFAULT_BUDGET_DECREMENT_MS, DEFAULT_DUPLICATE_WINDOW_SECS,
    DEFAULT_TIMEOUT_BUDGET_MS, REGISTRY_COMMAND_TOPIC_DEFAULT, REGISTRY_RESULT_TOPIC_DEFAULT,
};
use fabric_query::{CoordinatorConfig, EngineConfig, RemoteFailurePolicy};

const CONFIG_DIR_NAME: &str = "fabric-node";
const CONFIG_FILE_NAME: &str = "mesh.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Node {node} lists unknown neighbor {neighbor}")]
    UnknownNeighbor { node: String, neighbor: String },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("Mesh has no nodes")]
    Empty,
}

/// Query settings shared by every node unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Caller-side timeout budget in milliseconds.
    pub distributed_timeout_ms: i64,
    /// Budget removed at every hop.
    pub distributed_timeout_decrement_ms: i64,
    pub flood_remote_query: bool,
    pub remote_failure_policy: RemoteFailurePolicy,
    /// Topic template; `{0}` is replaced by the node name.
    pub command_topic: String,
    pub result_topic: String,
    pub perf_logging: bool,
    pub duplicate_window_secs: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            distributed_timeout_ms: DEFAULT_TIMEOUT_BUDGET_MS,
            distributed_timeout_decrement_ms: DEFAULT_BUDGET_DECREMENT_MS,
            flood_remote_query: true,
            remote_failure_policy: RemoteFailurePolicy::BestEffort,
            command_topic: REGISTRY_COMMAND_TOPIC_DEFAULT.to_string(),
            result_topic: REGISTRY_RESULT_TOPIC_DEFAULT.to_string(),
            perf_logging: false,
            duplicate_window_secs: DEFAULT_DUPLICATE_WINDOW_SECS,
        }
    }
}

impl QuerySettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.distributed_timeout_ms <= 0 {
            return Err(ConfigError::InvalidSetting {
                key: "distributed_timeout_ms",
                reason: format!("must be positive, got {}", self.distributed_timeout_ms),
            });
        }
        if self.distributed_timeout_decrement_ms <= 0 {
            return Err(ConfigError::InvalidSetting {
                key: "distributed_timeout_decrement_ms",
                reason: format!("must be positive, got {}", self.distributed_timeout_decrement_ms),
            });
        }
        for (key, template) in [("command_topic", &self.command_topic), ("result_topic", &self.result_topic)] {
            if !template.contains("{0}") {
                return Err(ConfigError::InvalidSetting {
                    key,
                    reason: format!("'{template}' has no {{0}} placeholder"),
                });
            }
        }
        Ok(())
    }
}

/// Everything one node needs to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node_name: NodeId,
    #[serde(default)]
    pub registry_uid: Option<String>,
    #[serde(flatten)]
    pub settings: QuerySettings,
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: NodeId::new(node_name),
            registry_uid: None,
            settings: QuerySettings::default(),
        }
    }

    /// Load a standalone node config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        if config.node_name.is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "node_name",
                reason: "required for a standalone node".into(),
            });
        }
        config.settings.validate()?;
        Ok(config)
    }

    pub fn command_topic(&self) -> String {
        RegistryTopics::from_template(&self.settings.command_topic, &self.node_name)
    }

    pub fn result_topic(&self) -> String {
        RegistryTopics::from_template(&self.settings.result_topic, &self.node_name)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_budget_decrement: self.settings.distributed_timeout_decrement_ms,
            registry_uid: self.registry_uid.clone(),
            flood_remote_query: self.settings.flood_remote_query,
            perf_logging: self.settings.perf_logging,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_timeout_budget: self.settings.distributed_timeout_ms,
            default_budget_decrement: self.settings.distributed_timeout_decrement_ms,
            remote_failure_policy: self.settings.remote_failure_policy,
            flood_remote_query: self.settings.flood_remote_query,
        }
    }
}

/// One `[[node]]` entry of a mesh file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNodeConfig {
    pub name: String,
    #[serde(default)]
    pub registry_uid: Option<String>,
    #[serde(default)]
    pub neighbors: Vec<String>,
    /// Sends to this node fail.
    #[serde(default)]
    pub unreachable: bool,
    /// Sends to this node succeed but are never delivered.
    #[serde(default)]
    pub lossy: bool,
    /// Every local query on this node fails with this message.
    #[serde(default)]
    pub fail_queries: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<BTreeMap<String, toml::Value>>>,
}

impl MeshNodeConfig {
    /// Table contents as registry rows.
    pub fn table_rows(&self) -> BTreeMap<String, Vec<Row>> {
        self.tables
            .iter()
            .map(|(table, rows)| {
                let rows = rows
                    .iter()
                    .map(|row| row.iter().map(|(col, v)| (col.clone(), to_value(v))).collect())
                    .collect();
                (table.clone(), rows)
            })
            .collect()
    }
}

fn to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::Text(s.clone()),
        toml::Value::Integer(i) => Value::Int(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        other => Value::Text(other.to_string()),
    }
}

/// A whole simulated fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub defaults: QuerySettings,
    /// Random per-frame delivery delay, `[min, max]` milliseconds.
    #[serde(default)]
    pub latency_ms: Option<[u64; 2]>,
    #[serde(default, rename = "node")]
    pub nodes: Vec<MeshNodeConfig>,
}

impl MeshConfig {
    /// `<config dir>/fabric-node/mesh.toml`, when a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a mesh file.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Empty);
        }
        self.defaults.validate()?;

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(ConfigError::InvalidSetting {
                    key: "name",
                    reason: "node name is empty".into(),
                });
            }
            if !names.insert(node.name.to_ascii_lowercase()) {
                return Err(ConfigError::DuplicateNode(node.name.clone()));
            }
        }
        for node in &self.nodes {
            for neighbor in &node.neighbors {
                if !names.contains(&neighbor.to_ascii_lowercase()) {
                    return Err(ConfigError::UnknownNeighbor {
                        node: node.name.clone(),
                        neighbor: neighbor.clone(),
                    });
                }
            }
        }
        if let Some([min, max]) = self.latency_ms {
            if min > max {
                return Err(ConfigError::InvalidSetting {
                    key: "latency_ms",
                    reason: format!("min {min} exceeds max {max}"),
                });
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&MeshNodeConfig> {
        self.nodes.iter().find(|n| n.name.eq_ignore_ascii_case(name))
    }

    /// Startup config for one mesh node.
    pub fn node_config(&self, node: &MeshNodeConfig) -> NodeConfig {
        NodeConfig {
            node_name: NodeId::new(node.name.clone()),
            registry_uid: node.registry_uid.clone(),
            settings: self.defaults.clone(),
        }
    }

    /// Undirected links implied by every node's neighbor list.
    pub fn links(&self) -> Vec<(NodeId, NodeId)> {
        let canonical = |name: &str| {
            self.node(name)
                .map(|n| NodeId::new(n.name.clone()))
                .unwrap_or_else(|| NodeId::new(name))
        };
        self.nodes
            .iter()
            .flat_map(|node| {
                node.neighbors
                    .iter()
                    .map(move |neighbor| (NodeId::new(node.name.clone()), neighbor.clone()))
            })
            .map(|(a, b)| (a, canonical(&b)))
            .collect()
    }
}
