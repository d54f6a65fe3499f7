//! Peer nodes and their lifecycle.
//!
//! [`Nodes`] is the arena every component shares: ids are handed around
//! freely and resolved here, so no component holds a peer by pointer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::command::CommandQueue;
use crate::connection::{Connection, ConnectionDescription};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Stopped,
    /// Launch was requested, the node has not connected back yet.
    Launched,
    Initializing,
    Running,
    Stopping,
    StopFailed,
}

impl NodeState {
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Stopped, Launched | Initializing)
                | (Launched, Initializing | Stopping)
                | (Initializing, Running | Stopping | StopFailed)
                | (Running, Stopping)
                | (Stopping, Stopped | StopFailed)
                | (StopFailed, Stopped | Initializing)
        )
    }

    /// Whether the node still has (or is about to have) a live connection.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NodeState::Launched | NodeState::Initializing | NodeState::Running
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Stopped => "stopped",
            NodeState::Launched => "launched",
            NodeState::Initializing => "initializing",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::StopFailed => "stop-failed",
        };
        f.write_str(name)
    }
}

/// One peer: identity, how to reach it, its state and its connection.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    description: ConnectionDescription,
    state: NodeState,
    connection: Option<Connection>,
    /// Queues that carry work for this node; flushed when it goes away.
    queues: Vec<Arc<CommandQueue>>,
}

impl Node {
    fn new(id: NodeId, description: ConnectionDescription) -> Self {
        Self {
            id,
            description,
            state: NodeState::Stopped,
            connection: None,
            queues: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn set_state(&mut self, to: NodeState) -> Result<NodeState> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                node: self.id,
                from,
                to,
            });
        }
        debug!(node = %self.id, %from, %to, "node state changed");
        self.state = to;
        Ok(from)
    }
}

/// Shared table of every node this process knows about.
#[derive(Clone, Default)]
pub struct Nodes {
    inner: Arc<RwLock<BTreeMap<NodeId, Node>>>,
}

impl Nodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node in the `Stopped` state.
    pub fn insert(&self, id: NodeId, description: ConnectionDescription) -> Result<()> {
        let mut nodes = self.inner.write();
        if nodes.contains_key(&id) {
            return Err(Error::Config(format!("{id} is configured twice")));
        }
        nodes.insert(id, Node::new(id, description));
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.read().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.inner.read().keys().copied().collect()
    }

    pub fn ids_in(&self, state: NodeState) -> Vec<NodeId> {
        self.inner
            .read()
            .values()
            .filter(|node| node.state == state)
            .map(|node| node.id)
            .collect()
    }

    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Result<R> {
        self.inner
            .read()
            .get(&id)
            .map(f)
            .ok_or(Error::UnknownNode(id))
    }

    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        self.with_node(id, Node::state)
    }

    pub fn description(&self, id: NodeId) -> Result<ConnectionDescription> {
        self.with_node(id, |node| node.description.clone())
    }

    /// Records where a node is actually reachable, e.g. after binding port 0.
    pub fn set_description(&self, id: NodeId, description: ConnectionDescription) -> Result<()> {
        self.update(id, |node| {
            node.description = description;
            Ok(())
        })
    }

    /// Moves a node to `to`, returning the state it left.
    pub fn transition(&self, id: NodeId, to: NodeState) -> Result<NodeState> {
        self.update(id, |node| node.set_state(to))
    }

    /// Hands a connection to the node, closing any connection it replaces.
    pub fn attach_connection(&self, id: NodeId, connection: Connection) -> Result<()> {
        self.update(id, |node| {
            if let Some(previous) = node.connection.replace(connection) {
                previous.close();
            }
            Ok(())
        })
    }

    pub fn attach_queue(&self, id: NodeId, queue: Arc<CommandQueue>) -> Result<()> {
        self.update(id, |node| {
            if !node.queues.iter().any(|q| Arc::ptr_eq(q, &queue)) {
                node.queues.push(queue);
            }
            Ok(())
        })
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.with_node(id, Node::is_connected).unwrap_or(false)
    }

    pub fn send(&self, id: NodeId, packet: &Packet) -> Result<()> {
        let nodes = self.inner.read();
        let node = nodes.get(&id).ok_or(Error::UnknownNode(id))?;
        let connection = node.connection.as_ref().ok_or(Error::NotConnected(id))?;
        connection.send(packet)
    }

    /// Tears a node down after its connection was lost or shut.
    ///
    /// Goes through `Stopping`, flushes the node's queues, closes the
    /// connection and settles in `Stopped` (or `StopFailed` when `failed`).
    /// Returns true only for the call that performed the teardown.
    pub fn disconnect(&self, id: NodeId, failed: bool) -> Result<bool> {
        self.update(id, |node| {
            if !node.state.is_active() {
                return Ok(false);
            }
            node.set_state(NodeState::Stopping)?;
            let dropped: usize = node.queues.iter().map(|queue| queue.flush()).sum();
            if let Some(connection) = node.connection.take() {
                connection.close();
            }
            let settled = if failed {
                NodeState::StopFailed
            } else {
                NodeState::Stopped
            };
            node.set_state(settled)?;
            info!(node = %node.id, state = %settled, dropped_commands = dropped, "node disconnected");
            Ok(true)
        })
    }

    /// Graceful shutdown of one node. Already stopped nodes are left alone.
    pub fn stop(&self, id: NodeId) -> Result<()> {
        self.disconnect(id, false).map(|_| ())
    }

    fn update<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> Result<R>) -> Result<R> {
        let mut nodes = self.inner.write();
        let node = nodes.get_mut(&id).ok_or(Error::UnknownNode(id))?;
        f(node)
    }
}

impl fmt::Debug for Nodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.inner.read().values().map(|node| (node.id, node.state)))
            .finish()
    }
}

/// Anything that can put a packet on the way to a node.
pub trait Outbound {
    fn send_to(&self, node: NodeId, packet: &Packet) -> Result<()>;
}

impl Outbound for Nodes {
    fn send_to(&self, node: NodeId, packet: &Packet) -> Result<()> {
        self.send(node, packet)
    }
}
