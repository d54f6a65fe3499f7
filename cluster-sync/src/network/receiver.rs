//! The receiver loop.
//!
//! One reader task per connection decodes frames and reports them as events;
//! the receiver task owns the event stream and turns each event into a routed
//! command or a node disconnect. Handlers never run here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandRouter};
use crate::connection::read_packet;
use crate::error::{Error, Result};
use crate::node::Nodes;
use crate::packet::{CommandKind, DataType, Packet};
use crate::types::NodeId;

enum Control {
    Add(NodeId, OwnedReadHalf),
    Stop,
}

#[derive(Debug)]
enum Event {
    Packet(NodeId, Packet),
    HangUp(NodeId),
    Failed(NodeId, Error),
}

pub(crate) struct Receiver {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl Receiver {
    pub(crate) fn spawn(
        runtime: &Handle,
        nodes: Nodes,
        router: Arc<CommandRouter>,
        idle_timeout: Duration,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run(control_rx, nodes, router, idle_timeout));
        Self { control, task }
    }

    /// Starts reading from a newly connected node.
    pub(crate) fn add(&self, node: NodeId, reader: OwnedReadHalf) -> Result<()> {
        self.control
            .send(Control::Add(node, reader))
            .map_err(|_| Error::Config("receiver is not running".to_string()))
    }

    pub(crate) async fn stop(self) {
        let _ = self.control.send(Control::Stop);
        if let Err(err) = self.task.await {
            warn!(error = %err, "receiver task failed");
        }
    }
}

async fn run(
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    nodes: Nodes,
    router: Arc<CommandRouter>,
    idle_timeout: Duration,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut readers: HashMap<NodeId, JoinHandle<()>> = HashMap::new();
    debug!("receiver started");

    loop {
        select! {
            control = control_rx.recv() => match control {
                Some(Control::Add(node, reader)) => {
                    let task = tokio::spawn(read_loop(node, reader, event_tx.clone()));
                    if let Some(previous) = readers.insert(node, task) {
                        previous.abort();
                    }
                }
                Some(Control::Stop) | None => break,
            },
            Some(event) = event_rx.recv() => {
                if let Some(node) = handle_event(event, &nodes, &router) {
                    readers.remove(&node);
                }
            }
            _ = tokio::time::sleep(idle_timeout) => {
                debug!(connections = readers.len(), "receiver idle");
            }
        }
    }

    for (_, reader) in readers.drain() {
        reader.abort();
    }
    debug!("receiver stopped");
}

/// Returns the node whose reader finished, if any.
fn handle_event(event: Event, nodes: &Nodes, router: &CommandRouter) -> Option<NodeId> {
    match event {
        Event::Packet(node, packet) => {
            let _ = router.route(Command::new(packet, node));
            None
        }
        Event::HangUp(node) => {
            node_lost(node, false, nodes, router);
            Some(node)
        }
        Event::Failed(node, err) => {
            warn!(%node, error = %err, "dropping connection after read error");
            node_lost(node, true, nodes, router);
            Some(node)
        }
    }
}

fn node_lost(node: NodeId, failed: bool, nodes: &Nodes, router: &CommandRouter) {
    match nodes.disconnect(node, failed) {
        Ok(true) => {
            info!(%node, "node left the cluster");
            announce_loss(node, router);
        }
        Ok(false) => debug!(%node, "connection closed after node stopped"),
        Err(err) => warn!(%node, error = %err, "failed to disconnect node"),
    }
}

/// Tells the session and the main thread, whichever registered for it.
fn announce_loss(node: NodeId, router: &CommandRouter) {
    let mut told = 0;
    for data_type in [DataType::Session, DataType::Node] {
        if router.queue_for(data_type, CommandKind::Disconnected).is_some() {
            let lost = Packet::new(data_type, CommandKind::Disconnected);
            if router.route(Command::new(lost, node)).is_ok() {
                told += 1;
            }
        }
    }
    if told == 0 {
        debug!(%node, "nobody watches node loss");
    }
}

async fn read_loop(node: NodeId, reader: OwnedReadHalf, events: mpsc::UnboundedSender<Event>) {
    let mut reader = BufReader::new(reader);
    loop {
        let event = match read_packet(&mut reader).await {
            Ok(Some(packet)) => Event::Packet(node, packet),
            Ok(None) => Event::HangUp(node),
            Err(err) => Event::Failed(node, err),
        };
        let last = !matches!(event, Event::Packet(..));
        if events.send(event).is_err() || last {
            return;
        }
    }
}
