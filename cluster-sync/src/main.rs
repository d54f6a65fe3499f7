use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cluster_sync::{
    cli::Cli,
    client::{self, Client, SERVER_NODE},
    command::CommandRouter,
    config::{self, ClusterConfig, NodeConfig},
    connection::Protocol,
    network::{launcher_for, ClusterNetwork, ManualLauncher},
    node::{NodeState, Nodes},
    object::{DataIStream, DataOStream, Distributable, MasterKind},
    packet::Subscription,
    session::SessionThread,
    types::{NodeId, ObjectId, VERSION_OLDEST},
};

const DEFAULT_MASTER_NODE: NodeId = NodeId(1);
const DEFAULT_CLIENT_NODE: u32 = 2;
/// How long the master waits for clients to subscribe and later to leave.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// The shared object of the demo: the frame the cluster is rendering.
#[derive(Debug, Default)]
struct FrameData {
    frame: u64,
    camera: [f32; 3],
}

impl Distributable for FrameData {
    fn get_instance_data(&self, os: &mut DataOStream) -> cluster_sync::Result<()> {
        os.write(&self.frame)?;
        os.write(&self.camera)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream<'_>) -> cluster_sync::Result<()> {
        self.frame = is.read()?;
        self.camera = is.read()?;
        info!(frame = self.frame, camera = ?self.camera, "frame data received");
        Ok(())
    }
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.client {
        run_render_client(&cli)
    } else {
        run_master(&cli)
    }
}

fn master_config(cli: &Cli) -> Result<ClusterConfig> {
    if let Some(path) = &cli.config {
        return ClusterConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()));
    }
    let listen = config::resolve_server_address(cli.server.as_deref())?;
    let local = NodeConfig {
        id: cli.node_id.map_or(DEFAULT_MASTER_NODE, NodeId),
        protocol: Protocol::Tcpip,
        address: listen.address,
        port: listen.port,
    };
    Ok(ClusterConfig::new(local.id, vec![local]))
}

fn run_master(cli: &Cli) -> Result<()> {
    let config = master_config(cli)?;
    let local = config.local_node;
    let nodes = Nodes::new();
    let router = Arc::new(CommandRouter::new());

    let launcher = launcher_for(config.launch_command.as_deref())?;
    let mut network = ClusterNetwork::new(config, nodes.clone(), Arc::clone(&router), launcher)?;
    network.start().context("starting cluster")?;
    let (session, command_thread) = SessionThread::spawn(local, nodes.clone(), Arc::clone(&router))?;

    let object = session.register_object(FrameData::default(), MasterKind::Buffered { depth: 4 })?;
    let clients: Vec<NodeId> = nodes
        .ids_in(NodeState::Running)
        .into_iter()
        .filter(|id| *id != local)
        .collect();
    wait_until(SETTLE_TIMEOUT, || {
        let subscribed = session.call(move |session| {
            session
                .master_object(object)
                .map_or(0, |master| master.change_manager().slaves().len())
        });
        matches!(subscribed, Ok(count) if count >= clients.len())
    });

    let interval = Duration::from_millis(cli.frame_interval_ms);
    for frame in 1..=u64::from(cli.frames) {
        session.call(move |session| {
            let data = session
                .master_object_mut(object)
                .and_then(|master| master.data_mut::<FrameData>());
            if let Some(data) = data {
                data.frame = frame;
                data.camera = [0.0, 0.0, frame as f32 * 0.1];
            }
        })?;
        let version = session.commit(object)?;
        info!(frame, version, "frame committed");
        thread::sleep(interval);
    }

    for id in &clients {
        if let Err(err) = nodes.send(*id, &client::exit_packet()) {
            warn!(node = %id, error = %err, "failed to send exit");
        }
    }
    wait_until(SETTLE_TIMEOUT, || {
        clients
            .iter()
            .all(|id| nodes.state(*id).map_or(true, |state| !state.is_active()))
    });

    if let Err(err) = session.deregister_object(object) {
        warn!(error = %err, "object still had subscribers");
    }
    session.shutdown()?;
    let _ = command_thread.join();
    network.stop();
    info!("master finished");
    Ok(())
}

fn run_render_client(cli: &Cli) -> Result<()> {
    let server = config::resolve_server_address(cli.server.as_deref())?;
    let local = NodeId(cli.node_id.unwrap_or(DEFAULT_CLIENT_NODE));
    let config = ClusterConfig::new(
        local,
        vec![NodeConfig {
            id: local,
            protocol: Protocol::Tcpip,
            address: "0.0.0.0".to_string(),
            port: 0,
        }],
    );

    let nodes = Nodes::new();
    let router = Arc::new(CommandRouter::new());
    let mut client = Client::new(local, nodes.clone(), &router);

    let mut network = ClusterNetwork::new(config, nodes.clone(), Arc::clone(&router), Box::new(ManualLauncher))?;
    network.start().context("starting render client")?;
    network
        .connect_server(SERVER_NODE, server.clone())
        .with_context(|| format!("joining {server}"))?;
    client.watch_server(SERVER_NODE, &router);
    if !nodes.state(SERVER_NODE)?.is_active() {
        bail!("lost {server} while joining");
    }

    let (session, command_thread) = SessionThread::spawn(local, nodes, Arc::clone(&router))?;
    let (instance, version) = session
        .map_object(
            ObjectId(1),
            SERVER_NODE,
            FrameData::default(),
            Subscription::uncached(VERSION_OLDEST),
        )
        .context("mapping frame data")?;
    info!(%instance, version, "frame data mapped");

    client.client_loop();

    if let Err(err) = session.unmap_object(ObjectId(1), instance) {
        warn!(error = %err, "failed to unmap frame data");
    }
    session.shutdown()?;
    let _ = command_thread.join();
    network.stop();
    info!(node = %local, "render client finished");
    Ok(())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    done()
}
