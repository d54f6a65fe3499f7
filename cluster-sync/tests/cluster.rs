//! Cluster bring-up, rejection of strangers, and orderly exit.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, unbounded, Sender};

use cluster_sync::client::{exit_packet, SERVER_NODE};
use cluster_sync::command::{CommandQueue, CommandRouter};
use cluster_sync::config::ClusterConfig;
use cluster_sync::connection::ConnectionDescription;
use cluster_sync::error::{Error, StartupStage};
use cluster_sync::network::{ClusterNetwork, LaunchArgs, Launcher};
use cluster_sync::node::{NodeState, Nodes};
use cluster_sync::packet::{CommandKind, DataType, Subscription};
use cluster_sync::types::{NodeId, ObjectId, VERSION_OLDEST};

use common::{node_config, wait_for, Counter, TestCluster, MASTER, TIMEOUT};

fn announce(server: &str, id: u32) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(server)?;
    stream.write_all(&id.to_le_bytes())?;
    Ok(stream)
}

/// Records where nodes were told to connect and never starts them.
struct SilentLauncher {
    servers: Sender<String>,
}

impl Launcher for SilentLauncher {
    fn launch(
        &self,
        _node: NodeId,
        _description: &ConnectionDescription,
        args: &LaunchArgs,
    ) -> cluster_sync::Result<()> {
        let _ = self.servers.send(args.server.clone());
        Ok(())
    }
}

/// Connects a stranger first, then the launched node.
struct ImpostorLauncher {
    streams: Sender<Vec<TcpStream>>,
}

impl Launcher for ImpostorLauncher {
    fn launch(
        &self,
        node: NodeId,
        _description: &ConnectionDescription,
        args: &LaunchArgs,
    ) -> cluster_sync::Result<()> {
        let server = args.server.clone();
        let streams = self.streams.clone();
        thread::spawn(move || {
            let (Ok(stranger), Ok(real)) = (announce(&server, 99), announce(&server, node.0)) else {
                return;
            };
            // Keep both sockets open until the test is done with them.
            let _ = streams.send(vec![stranger, real]);
        });
        Ok(())
    }
}

/// Opens a connection that never says who it is, then connects the launched
/// node shortly after.
struct SilentPeerLauncher {
    streams: Sender<Vec<TcpStream>>,
}

impl Launcher for SilentPeerLauncher {
    fn launch(
        &self,
        node: NodeId,
        _description: &ConnectionDescription,
        args: &LaunchArgs,
    ) -> cluster_sync::Result<()> {
        let server = args.server.clone();
        let streams = self.streams.clone();
        thread::spawn(move || {
            let Ok(silent) = TcpStream::connect(&server) else {
                return;
            };
            thread::sleep(Duration::from_millis(100));
            let Ok(real) = announce(&server, node.0) else {
                return;
            };
            let _ = streams.send(vec![silent, real]);
        });
        Ok(())
    }
}

/// Plays every launched node with a bare socket that only sends its id.
struct RawSocketLauncher {
    streams: Sender<(NodeId, TcpStream)>,
}

impl Launcher for RawSocketLauncher {
    fn launch(
        &self,
        node: NodeId,
        _description: &ConnectionDescription,
        args: &LaunchArgs,
    ) -> cluster_sync::Result<()> {
        let server = args.server.clone();
        let streams = self.streams.clone();
        thread::spawn(move || {
            if let Ok(stream) = announce(&server, node.0) {
                let _ = streams.send((node, stream));
            }
        });
        Ok(())
    }
}

fn two_node_config() -> ClusterConfig {
    let mut config = ClusterConfig::new(MASTER, vec![node_config(MASTER, 0), node_config(NodeId(2), 0)]);
    config.startup_timeout_ms = 2_000;
    config.receiver_poll_ms = 100;
    config
}

#[test]
fn startup_times_out_and_closes_listener() -> Result<()> {
    let (servers_tx, servers_rx) = unbounded();
    let nodes = Nodes::new();
    let mut network = ClusterNetwork::new(
        two_node_config(),
        nodes.clone(),
        Arc::new(CommandRouter::new()),
        Box::new(SilentLauncher { servers: servers_tx }),
    )?;

    match network.start() {
        Err(Error::Startup {
            stage: StartupStage::Connect,
            ..
        }) => {}
        Err(other) => bail!("unexpected startup error: {other}"),
        Ok(()) => bail!("startup succeeded without the launched node"),
    }

    let server = servers_rx.try_recv().map_err(|_| anyhow!("node 2 was never launched"))?;
    assert!(network.listener_addr().is_none());
    assert!(!network.is_running());
    assert!(TcpStream::connect(&server).is_err());
    assert_eq!(nodes.state(NodeId(2))?, NodeState::Stopped);
    assert_eq!(nodes.state(MASTER)?, NodeState::Stopped);
    Ok(())
}

#[test]
fn unexpected_node_is_rejected_during_startup() -> Result<()> {
    let (streams_tx, streams_rx) = unbounded();
    let nodes = Nodes::new();
    let mut config = two_node_config();
    config.startup_timeout_ms = TIMEOUT.as_millis() as u64;
    let mut network = ClusterNetwork::new(
        config,
        nodes.clone(),
        Arc::new(CommandRouter::new()),
        Box::new(ImpostorLauncher { streams: streams_tx }),
    )?;

    network.start()?;
    let _streams = streams_rx
        .recv_timeout(TIMEOUT)
        .map_err(|_| anyhow!("launcher thread did not connect"))?;

    assert!(network.is_running());
    assert_eq!(nodes.state(NodeId(2))?, NodeState::Running);
    assert!(nodes.is_connected(NodeId(2)));
    assert!(!nodes.contains(NodeId(99)));
    network.stop();
    assert_eq!(nodes.state(NodeId(2))?, NodeState::Stopped);
    Ok(())
}

#[test]
fn silent_connection_does_not_hold_up_startup() -> Result<()> {
    let (streams_tx, streams_rx) = unbounded();
    let nodes = Nodes::new();
    let mut network = ClusterNetwork::new(
        two_node_config(),
        nodes.clone(),
        Arc::new(CommandRouter::new()),
        Box::new(SilentPeerLauncher { streams: streams_tx }),
    )?;

    let started = Instant::now();
    network.start()?;
    assert!(started.elapsed() < Duration::from_secs(2));
    let _streams = streams_rx
        .recv_timeout(TIMEOUT)
        .map_err(|_| anyhow!("launcher thread did not connect"))?;

    assert_eq!(nodes.state(NodeId(2))?, NodeState::Running);
    assert!(nodes.is_connected(NodeId(2)));
    network.stop();
    Ok(())
}

#[test]
fn read_error_fails_only_the_broken_node() -> Result<()> {
    let mut config = ClusterConfig::new(
        MASTER,
        vec![node_config(MASTER, 0), node_config(NodeId(2), 0), node_config(NodeId(3), 0)],
    );
    config.startup_timeout_ms = TIMEOUT.as_millis() as u64;
    config.receiver_poll_ms = 100;

    let (streams_tx, streams_rx) = unbounded();
    let nodes = Nodes::new();
    let router = Arc::new(CommandRouter::new());
    let lost = Arc::new(CommandQueue::new("lost-nodes"));
    router.register(DataType::Node, CommandKind::Disconnected, Arc::clone(&lost));
    let mut network = ClusterNetwork::new(
        config,
        nodes.clone(),
        Arc::clone(&router),
        Box::new(RawSocketLauncher { streams: streams_tx }),
    )?;
    network.start()?;

    let mut streams = Vec::new();
    for _ in 0..2 {
        streams.push(
            streams_rx
                .recv_timeout(TIMEOUT)
                .map_err(|_| anyhow!("launcher thread did not connect"))?,
        );
    }
    let (_, broken) = streams
        .iter_mut()
        .find(|(node, _)| *node == NodeId(2))
        .ok_or_else(|| anyhow!("node 2 never connected"))?;
    // A length prefix far beyond the frame limit.
    broken.write_all(&u32::MAX.to_be_bytes())?;
    broken.flush()?;

    wait_for("node 2 to fail", || Ok(nodes.state(NodeId(2))? == NodeState::StopFailed))?;
    let notice = lost
        .pop(Some(TIMEOUT))
        .ok_or_else(|| anyhow!("node loss was not routed"))?;
    assert_eq!(notice.origin(), NodeId(2));
    thread::sleep(Duration::from_millis(200));
    assert!(lost.is_empty());

    assert_eq!(nodes.state(NodeId(3))?, NodeState::Running);
    assert!(nodes.is_connected(NodeId(3)));
    assert!(network.is_running());
    network.stop();
    Ok(())
}

#[test]
fn pending_mapping_fails_when_master_is_lost() -> Result<()> {
    let mut cluster = TestCluster::start(&[2])?;
    // Nothing on the master answers the subscription any more.
    cluster.master.session.shutdown()?;

    let session = cluster.client(2).session.clone();
    let (result_tx, result_rx) = bounded(1);
    thread::spawn(move || {
        let result = session.map_object(
            ObjectId(1),
            SERVER_NODE,
            Counter::default(),
            Subscription::uncached(VERSION_OLDEST),
        );
        let _ = result_tx.send(result);
    });
    thread::sleep(Duration::from_millis(100));
    cluster.master.network.stop();

    let result = result_rx
        .recv_timeout(TIMEOUT)
        .map_err(|_| anyhow!("mapping still waits after the master left"))?;
    assert!(matches!(result, Err(Error::NotConnected(SERVER_NODE))));

    cluster.shutdown()
}

#[test]
fn exit_from_master_disconnects_render_client() -> Result<()> {
    let mut cluster = TestCluster::start(&[2])?;
    assert_eq!(cluster.master.nodes.state(NodeId(2))?, NodeState::Running);

    cluster.master.nodes.send(NodeId(2), &exit_packet())?;
    let client = cluster.client_mut(2);
    assert!(client.client.process_command(Some(TIMEOUT))?);
    assert!(!client.client.is_running());
    assert_eq!(client.nodes.state(SERVER_NODE)?, NodeState::Stopped);

    let master_nodes = cluster.master.nodes.clone();
    wait_for("master to notice the client left", || {
        Ok(!master_nodes.state(NodeId(2))?.is_active())
    })?;

    cluster.shutdown()
}

#[test]
fn render_client_leaves_when_master_stops() -> Result<()> {
    let mut cluster = TestCluster::start(&[2])?;
    cluster.master.network.stop();

    let client = cluster.client_mut(2);
    let deadline = Instant::now() + TIMEOUT;
    while client.client.is_running() {
        if Instant::now() > deadline {
            bail!("render client never heard that the master went away");
        }
        // Losing the server flushes the queue, which may wake this empty-handed.
        client.client.process_command(Some(Duration::from_millis(100)))?;
    }
    assert!(!client.nodes.state(SERVER_NODE)?.is_active());

    cluster.shutdown()
}
