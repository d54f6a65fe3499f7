//! Shared harness: a master and render clients joined over localhost TCP.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};

use cluster_sync::client::{Client, SERVER_NODE};
use cluster_sync::command::CommandRouter;
use cluster_sync::config::{ClusterConfig, NodeConfig};
use cluster_sync::connection::{ConnectionDescription, Protocol};
use cluster_sync::network::{ClusterNetwork, LaunchArgs, Launcher, ManualLauncher};
use cluster_sync::node::Nodes;
use cluster_sync::object::{DataIStream, DataOStream, Distributable};
use cluster_sync::session::{Session, SessionHandle, SessionThread};
use cluster_sync::types::{InstanceId, NodeId, ObjectId, Version};

pub const MASTER: NodeId = NodeId(1);
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Counter that packs only after a change and remembers every value applied.
#[derive(Debug, Default, Clone)]
pub struct Counter {
    pub value: u64,
    pub dirty: bool,
    pub seen: Vec<u64>,
}

impl Counter {
    pub fn set(&mut self, value: u64) {
        self.value = value;
        self.dirty = true;
    }
}

impl Distributable for Counter {
    fn get_instance_data(&self, os: &mut DataOStream) -> cluster_sync::Result<()> {
        os.write(&self.value)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream<'_>) -> cluster_sync::Result<()> {
        self.value = is.read()?;
        self.seen.push(self.value);
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) -> cluster_sync::Result<()> {
        if std::mem::take(&mut self.dirty) {
            os.write(&self.value)?;
        }
        Ok(())
    }
}

pub fn node_config(id: NodeId, port: u16) -> NodeConfig {
    NodeConfig {
        id,
        protocol: Protocol::Tcpip,
        address: "127.0.0.1".to_string(),
        port,
    }
}

/// Network side of a render client that joined a master.
pub struct Joined {
    pub node: NodeId,
    pub network: ClusterNetwork,
    pub nodes: Nodes,
    pub router: Arc<CommandRouter>,
}

/// Does what a render client process does on startup: listen, then join.
pub fn join_cluster(node: NodeId, server: &str) -> Result<Joined> {
    let config = ClusterConfig::new(node, vec![node_config(node, 0)]);
    let nodes = Nodes::new();
    let router = Arc::new(CommandRouter::new());
    let mut network = ClusterNetwork::new(
        config,
        nodes.clone(),
        Arc::clone(&router),
        Box::new(ManualLauncher),
    )?;
    network.start()?;
    let server: ConnectionDescription = server.parse()?;
    network.connect_server(SERVER_NODE, server)?;
    Ok(Joined {
        node,
        network,
        nodes,
        router,
    })
}

/// Plays the remote nodes in-process: each launch joins from a new thread.
pub struct InProcessLauncher {
    joined: Sender<Result<Joined>>,
}

impl Launcher for InProcessLauncher {
    fn launch(
        &self,
        node: NodeId,
        _description: &ConnectionDescription,
        args: &LaunchArgs,
    ) -> cluster_sync::Result<()> {
        let joined = self.joined.clone();
        let server = args.server.clone();
        thread::spawn(move || {
            let _ = joined.send(join_cluster(node, &server));
        });
        Ok(())
    }
}

pub struct Master {
    pub network: ClusterNetwork,
    pub nodes: Nodes,
    pub session: SessionHandle,
    thread: Option<JoinHandle<Session>>,
}

pub struct RenderClient {
    pub node: NodeId,
    pub network: ClusterNetwork,
    pub nodes: Nodes,
    pub router: Arc<CommandRouter>,
    pub client: Client,
    pub session: SessionHandle,
    thread: Option<JoinHandle<Session>>,
}

pub struct TestCluster {
    pub master: Master,
    pub clients: Vec<RenderClient>,
}

impl TestCluster {
    /// Starts a master on an ephemeral port and launches one render client
    /// per id.
    pub fn start(client_ids: &[u32]) -> Result<Self> {
        let mut nodes_config = vec![node_config(MASTER, 0)];
        nodes_config.extend(client_ids.iter().map(|id| node_config(NodeId(*id), 0)));
        let mut config = ClusterConfig::new(MASTER, nodes_config);
        config.startup_timeout_ms = TIMEOUT.as_millis() as u64;
        config.receiver_poll_ms = 200;

        let (joined_tx, joined_rx): (Sender<Result<Joined>>, Receiver<Result<Joined>>) = unbounded();
        let nodes = Nodes::new();
        let router = Arc::new(CommandRouter::new());
        let mut network = ClusterNetwork::new(
            config,
            nodes.clone(),
            Arc::clone(&router),
            Box::new(InProcessLauncher { joined: joined_tx }),
        )?;
        network.start().context("starting master")?;

        let (session, thread) = SessionThread::spawn(MASTER, nodes.clone(), router)?;
        let master = Master {
            network,
            nodes,
            session,
            thread: Some(thread),
        };

        let mut clients = Vec::new();
        for _ in client_ids {
            let joined = joined_rx
                .recv_timeout(TIMEOUT)
                .map_err(|_| anyhow!("render client did not report back"))??;
            let mut client = Client::new(joined.node, joined.nodes.clone(), &joined.router);
            client.watch_server(SERVER_NODE, &joined.router);
            let (session, thread) =
                SessionThread::spawn(joined.node, joined.nodes.clone(), Arc::clone(&joined.router))?;
            clients.push(RenderClient {
                node: joined.node,
                network: joined.network,
                nodes: joined.nodes,
                router: joined.router,
                client,
                session,
                thread: Some(thread),
            });
        }
        clients.sort_by_key(|client| client.node);

        Ok(Self { master, clients })
    }

    pub fn client(&self, id: u32) -> &RenderClient {
        self.clients
            .iter()
            .find(|client| client.node == NodeId(id))
            .expect("render client")
    }

    pub fn client_mut(&mut self, id: u32) -> &mut RenderClient {
        self.clients
            .iter_mut()
            .find(|client| client.node == NodeId(id))
            .expect("render client")
    }

    pub fn shutdown(mut self) -> Result<()> {
        for client in &mut self.clients {
            client.session.shutdown()?;
            if let Some(thread) = client.thread.take() {
                thread.join().map_err(|_| anyhow!("client command thread panicked"))?;
            }
            client.network.stop();
        }
        self.master.session.shutdown()?;
        if let Some(thread) = self.master.thread.take() {
            thread.join().map_err(|_| anyhow!("master command thread panicked"))?;
        }
        self.master.network.stop();
        Ok(())
    }
}

/// Sets the master's counter and commits it.
pub fn commit_value(session: &SessionHandle, object: ObjectId, value: u64) -> Result<Version> {
    session.call(move |session| {
        if let Some(counter) = session
            .master_object_mut(object)
            .and_then(|master| master.data_mut::<Counter>())
        {
            counter.set(value);
        }
    })?;
    Ok(session.commit(object)?)
}

/// Version and data of a mapped counter.
pub fn slave_state(
    session: &SessionHandle,
    object: ObjectId,
    instance: InstanceId,
) -> Result<Option<(Version, Counter)>> {
    Ok(session.call(move |session| {
        let slave = session.object(object, instance)?;
        Some((slave.version(), slave.data::<Counter>()?.clone()))
    })?)
}

pub fn wait_for(what: &str, mut done: impl FnMut() -> Result<bool>) -> Result<()> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if done()? {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}
