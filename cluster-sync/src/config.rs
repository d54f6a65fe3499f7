use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionDescription, Protocol};
use crate::error::{Error, Result};
use crate::types::NodeId;

/// Environment variable consulted when no server address is given.
pub const SERVER_ENV: &str = "CLUSTER_SYNC_SERVER";
/// Server address used when neither the command line nor the environment
/// names one.
pub const DEFAULT_SERVER: &str = "127.0.0.1:4242";

const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECEIVER_POLL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    #[serde(default)]
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn description(&self) -> ConnectionDescription {
        ConnectionDescription {
            protocol: self.protocol,
            address: self.address.clone(),
            port: self.port,
        }
    }
}

/// Which node this process is, and every node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub local_node: NodeId,
    pub nodes: Vec<NodeConfig>,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_receiver_poll_ms")]
    pub receiver_poll_ms: u64,
    /// Argv used to start remote nodes; `{host}` is replaced by the node's
    /// address. Without it nodes are expected to be started by hand.
    #[serde(default)]
    pub launch_command: Option<Vec<String>>,
}

fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

fn default_receiver_poll_ms() -> u64 {
    DEFAULT_RECEIVER_POLL_MS
}

impl ClusterConfig {
    pub fn new(local_node: NodeId, nodes: Vec<NodeConfig>) -> Self {
        Self {
            local_node,
            nodes,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            receiver_poll_ms: DEFAULT_RECEIVER_POLL_MS,
            launch_command: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node(self.local_node).is_none() {
            return Err(Error::Config(format!(
                "local node {} is not among the configured nodes",
                self.local_node
            )));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id.0 == 0 {
                return Err(Error::Config("node id 0 is reserved".to_string()));
            }
            if self.nodes[..i].iter().any(|other| other.id == node.id) {
                return Err(Error::Config(format!("{} is configured twice", node.id)));
            }
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Every configured node except the local one.
    pub fn remote_nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(move |node| node.id != self.local_node)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn receiver_poll(&self) -> Duration {
        Duration::from_millis(self.receiver_poll_ms)
    }
}

/// Picks the server a render client connects to: the explicit address, else
/// `CLUSTER_SYNC_SERVER`, else [`DEFAULT_SERVER`].
pub fn resolve_server_address(explicit: Option<&str>) -> Result<ConnectionDescription> {
    let from_env = std::env::var(SERVER_ENV).ok();
    resolve_server_from(explicit, from_env.as_deref())
}

fn resolve_server_from(explicit: Option<&str>, from_env: Option<&str>) -> Result<ConnectionDescription> {
    explicit
        .or(from_env)
        .filter(|addr| !addr.trim().is_empty())
        .unwrap_or(DEFAULT_SERVER)
        .parse()
}
