//! Cluster bring-up: listener, launch, handshake and receiver.
//!
//! [`ClusterNetwork`] owns a small tokio runtime for socket I/O and exposes a
//! blocking API, so the command threads never see async code. Startup runs
//! listener, nodes (launch + accept) and receiver in that order; a failing
//! step unwinds the ones before it.

pub mod launcher;
mod receiver;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{self, Handle, Runtime};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::command::CommandRouter;
use crate::config::ClusterConfig;
use crate::connection::{read_handshake, write_handshake, Connection, ConnectionDescription};
use crate::error::{Error, Result, StartupStage};
use crate::node::{NodeState, Nodes};
use crate::types::NodeId;

pub use launcher::{launcher_for, LaunchArgs, Launcher, ManualLauncher, ProcessLauncher};
use receiver::Receiver;

/// How long an accepted peer has to announce its node id.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ClusterNetwork {
    config: ClusterConfig,
    nodes: Nodes,
    router: Arc<CommandRouter>,
    launcher: Box<dyn Launcher>,
    runtime: Runtime,
    listener: Option<TcpListener>,
    listener_addr: Option<SocketAddr>,
    /// Read halves accepted during startup, handed to the receiver once it runs.
    accepted: Vec<(NodeId, OwnedReadHalf)>,
    receiver: Option<Receiver>,
}

impl ClusterNetwork {
    /// Adds every configured node to `nodes` in the `Stopped` state.
    pub fn new(
        config: ClusterConfig,
        nodes: Nodes,
        router: Arc<CommandRouter>,
        launcher: Box<dyn Launcher>,
    ) -> Result<Self> {
        for node in &config.nodes {
            if !nodes.contains(node.id) {
                nodes.insert(node.id, node.description())?;
            }
        }
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cluster-net")
            .enable_all()
            .build()?;
        Ok(Self {
            config,
            nodes,
            router,
            launcher,
            runtime,
            listener: None,
            listener_addr: None,
            accepted: Vec::new(),
            receiver: None,
        })
    }

    /// Address the listener is bound to, while it runs.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_addr
    }

    pub fn is_running(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if let Err(err) = self.start_listener() {
            return Err(self.startup_failed(StartupStage::Listener, err));
        }
        if let Err((stage, err)) = self.start_nodes() {
            self.stop_nodes();
            self.stop_listener();
            return Err(self.startup_failed(stage, err));
        }
        if let Err(err) = self.start_receiver() {
            self.stop_receiver();
            self.stop_nodes();
            self.stop_listener();
            return Err(self.startup_failed(StartupStage::Receiver, err));
        }
        info!(
            node = %self.config.local_node,
            running = self.nodes.ids_in(NodeState::Running).len(),
            "cluster started"
        );
        Ok(())
    }

    fn startup_failed(&self, stage: StartupStage, err: Error) -> Error {
        error!(%stage, error = %err, "cluster startup failed");
        Error::startup(stage, err)
    }

    /// Stops the receiver, every remote node and the listener. Safe to call
    /// more than once.
    pub fn stop(&mut self) {
        self.stop_receiver();
        self.stop_nodes();
        self.stop_listener();
    }

    fn start_listener(&mut self) -> Result<()> {
        let local = self.config.local_node;
        let description = self.nodes.description(local).map_err(|_| {
            Error::Config(format!("local node {local} has no connection description"))
        })?;
        let listener = self.runtime.block_on(async {
            let addrs = description.socket_addrs().await?;
            Ok::<_, Error>(TcpListener::bind(&addrs[..]).await?)
        })?;
        let addr = listener.local_addr()?;

        let reachable = ConnectionDescription {
            port: addr.port(),
            ..description
        };
        self.nodes.set_description(local, reachable.clone())?;
        self.nodes.transition(local, NodeState::Initializing)?;
        self.nodes.transition(local, NodeState::Running)?;
        info!(node = %local, address = %reachable, "listener started");

        self.listener = Some(listener);
        self.listener_addr = Some(addr);
        Ok(())
    }

    fn stop_listener(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        {
            let _guard = self.runtime.enter();
            drop(listener);
        }
        self.listener_addr = None;
        let local = self.config.local_node;
        if self.nodes.state(local).ok() == Some(NodeState::Running) {
            let _ = self.nodes.transition(local, NodeState::Stopping);
            let _ = self.nodes.transition(local, NodeState::Stopped);
        }
        info!(node = %local, "listener stopped");
    }

    fn start_nodes(&mut self) -> std::result::Result<(), (StartupStage, Error)> {
        let local = self.config.local_node;
        let server = self
            .nodes
            .description(local)
            .map_err(|err| (StartupStage::Launch, err))?
            .to_string();

        let mut launched = Vec::new();
        for node in self.config.remote_nodes() {
            let state = self
                .nodes
                .state(node.id)
                .map_err(|err| (StartupStage::Launch, err))?;
            if state != NodeState::Stopped {
                debug!(node = %node.id, %state, "not launching node");
                continue;
            }
            let args = LaunchArgs {
                server: server.clone(),
                node_id: node.id,
            };
            self.launcher
                .launch(node.id, &node.description(), &args)
                .and_then(|()| self.nodes.transition(node.id, NodeState::Launched).map(|_| ()))
                .map_err(|err| (StartupStage::Launch, err))?;
            info!(node = %node.id, host = %node.address, "node launched");
            launched.push(node.id);
        }

        self.connect_nodes(&launched)
            .map_err(|err| (StartupStage::Connect, err))
    }

    /// Accepts connections until every launched node announced itself or
    /// the startup timeout expires. Each handshake is read by its own task,
    /// so a peer that connects and stays silent does not hold up the others.
    fn connect_nodes(&mut self, launched: &[NodeId]) -> Result<()> {
        if launched.is_empty() {
            return Ok(());
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Config("listener is not running".to_string()))?;
        let nodes = &self.nodes;
        let handle = self.runtime.handle().clone();
        let deadline = Instant::now() + self.config.startup_timeout();
        let handshake_timeout = self.config.startup_timeout().min(HANDSHAKE_TIMEOUT);
        let mut pending: BTreeSet<NodeId> = launched.iter().copied().collect();

        let accepted = self.runtime.block_on(async move {
            let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel();
            let mut accepted = Vec::new();
            while !pending.is_empty() {
                select! {
                    _ = time::sleep_until(deadline) => {
                        let ids: Vec<String> = pending.iter().map(ToString::to_string).collect();
                        return Err(Error::Timeout(format!("waiting for {} to connect", ids.join(", "))));
                    }
                    incoming = listener.accept() => {
                        let (stream, peer) = incoming?;
                        debug!(%peer, "accepted connection");
                        let announcements = handshake_tx.clone();
                        tokio::spawn(read_announcement(stream, peer, handshake_timeout, announcements));
                    }
                    Some(announcement) = handshake_rx.recv() => {
                        if let Some((id, reader)) = admit(announcement, &mut pending, nodes, &handle)? {
                            accepted.push((id, reader));
                        }
                    }
                }
            }
            Ok::<_, Error>(accepted)
        })?;

        self.accepted.extend(accepted);
        Ok(())
    }

    fn stop_nodes(&mut self) {
        self.accepted.clear();
        let local = self.config.local_node;
        for id in self.nodes.ids() {
            if id == local {
                continue;
            }
            if let Err(err) = self.nodes.stop(id) {
                warn!(node = %id, error = %err, "failed to stop node");
            }
        }
    }

    fn start_receiver(&mut self) -> Result<()> {
        let receiver = Receiver::spawn(
            self.runtime.handle(),
            self.nodes.clone(),
            Arc::clone(&self.router),
            self.config.receiver_poll(),
        );
        for (node, reader) in self.accepted.drain(..) {
            receiver.add(node, reader)?;
        }
        self.receiver = Some(receiver);
        debug!("receiver running");
        Ok(())
    }

    fn stop_receiver(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            self.runtime.block_on(receiver.stop());
        }
    }

    /// Joins a running cluster as a render client: connects to `server`,
    /// announces the local node and feeds the connection to the receiver.
    pub fn connect_server(&mut self, server: NodeId, description: ConnectionDescription) -> Result<()> {
        if self.nodes.contains(server) {
            self.nodes.set_description(server, description.clone())?;
        } else {
            self.nodes.insert(server, description.clone())?;
        }
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| Error::Config("network must be started before joining a server".to_string()))?;
        self.nodes.transition(server, NodeState::Initializing)?;

        let local = self.config.local_node;
        let timeout = self.config.startup_timeout();
        let target = description.clone();
        let connected = self.runtime.block_on(async move {
            let addrs = target.socket_addrs().await?;
            let mut stream = time::timeout(timeout, TcpStream::connect(&addrs[..]))
                .await
                .map_err(|_| Error::Timeout(format!("connecting to {target}")))??;
            stream.set_nodelay(true)?;
            write_handshake(&mut stream, local).await?;
            Ok::<_, Error>(stream)
        });

        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                warn!(node = %server, address = %description, error = %err, "failed to connect to server");
                let _ = self.nodes.transition(server, NodeState::StopFailed);
                return Err(err);
            }
        };
        let (reader, writer) = stream.into_split();
        let connection = Connection::spawn_tcp(self.runtime.handle(), description.clone(), writer);
        self.nodes.attach_connection(server, connection)?;
        self.nodes.transition(server, NodeState::Running)?;
        receiver.add(server, reader)?;
        info!(node = %server, address = %description, "connected to server");
        Ok(())
    }
}

/// Outcome of reading one peer's handshake.
struct Announcement {
    peer: SocketAddr,
    stream: TcpStream,
    node: Result<NodeId>,
}

async fn read_announcement(
    mut stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    announcements: mpsc::UnboundedSender<Announcement>,
) {
    let node = match time::timeout(timeout, read_handshake(&mut stream)).await {
        Ok(node) => node,
        Err(_) => Err(Error::Handshake(format!("no node id within {timeout:?}"))),
    };
    let _ = announcements.send(Announcement { peer, stream, node });
}

/// Matches an announced id against the launched nodes and, for a match,
/// attaches the connection and marks the node running.
fn admit(
    announcement: Announcement,
    pending: &mut BTreeSet<NodeId>,
    nodes: &Nodes,
    runtime: &Handle,
) -> Result<Option<(NodeId, OwnedReadHalf)>> {
    let Announcement { peer, stream, node } = announcement;
    let id = match node {
        Ok(id) => id,
        Err(err) => {
            error!(%peer, error = %err, "rejected connection");
            return Ok(None);
        }
    };
    if !pending.remove(&id) {
        error!(%peer, node = %id, "rejected connection from a node that was not launched");
        return Ok(None);
    }

    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    nodes.transition(id, NodeState::Initializing)?;
    let description = nodes.description(id)?;
    nodes.attach_connection(id, Connection::spawn_tcp(runtime, description, writer))?;
    nodes.transition(id, NodeState::Running)?;
    info!(node = %id, %peer, "node connected");
    Ok(Some((id, reader)))
}

impl Drop for ClusterNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}
