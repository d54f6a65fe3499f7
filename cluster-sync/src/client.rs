//! Process entry point: the local node and the main-thread command loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{Command, CommandQueue, CommandRouter, Dispatcher};
use crate::error::Result;
use crate::node::Nodes;
use crate::packet::{CommandKind, DataType, Packet};
use crate::types::NodeId;

/// Local id a render client gives the server it joined.
pub const SERVER_NODE: NodeId = NodeId(u32::MAX);

/// What main-thread handlers get to work with.
pub struct ClientState {
    local_node: NodeId,
    nodes: Nodes,
    queue: Arc<CommandQueue>,
    running: bool,
}

impl ClientState {
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ends the command loop after the current command.
    pub fn stop(&mut self) {
        self.running = false;
    }
}

pub struct Client {
    state: ClientState,
    dispatcher: Dispatcher<ClientState>,
}

impl Client {
    /// Creates the main-thread queue and routes exit and interrupt commands
    /// to it.
    pub fn new(local_node: NodeId, nodes: Nodes, router: &CommandRouter) -> Self {
        let queue = Arc::new(CommandQueue::new("main"));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(router, DataType::Client, CommandKind::Exit, &queue, cmd_exit);
        dispatcher.register(router, DataType::Client, CommandKind::Interrupt, &queue, cmd_interrupt);
        Self {
            state: ClientState {
                local_node,
                nodes,
                queue,
                running: true,
            },
            dispatcher,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn has_commands(&self) -> bool {
        !self.state.queue.is_empty()
    }

    /// Adds an application command that runs on the main thread.
    pub fn register_command<F>(&mut self, router: &CommandRouter, kind: CommandKind, handler: F)
    where
        F: FnMut(&mut ClientState, Command) -> Result<()> + Send + 'static,
    {
        self.dispatcher
            .register(router, DataType::Client, kind, &self.state.queue, handler);
    }

    /// Treats the loss of `server` like an exit command. Once the server is
    /// in the node table, losing it also drops main-thread commands still
    /// queued.
    pub fn watch_server(&mut self, server: NodeId, router: &CommandRouter) {
        if self.state.nodes.contains(server) {
            if let Err(err) = self.state.nodes.attach_queue(server, Arc::clone(&self.state.queue)) {
                warn!(%server, error = %err, "failed to attach main queue to server");
            }
        }
        self.dispatcher.register(
            router,
            DataType::Node,
            CommandKind::Disconnected,
            &self.state.queue,
            move |state: &mut ClientState, command: Command| {
                if command.origin() == server {
                    info!(%server, "server disconnected, leaving");
                    state.running = false;
                } else {
                    debug!(node = %command.origin(), "peer disconnected");
                }
                Ok(())
            },
        );
    }

    /// Handle for waking the command loop from another thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            local_node: self.state.local_node,
            queue: Arc::clone(&self.state.queue),
        }
    }

    /// Pops and runs one command. Returns false when nothing arrived in time.
    pub fn process_command(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let Some(command) = self.state.queue.pop(timeout) else {
            return Ok(false);
        };
        self.dispatcher.invoke(&mut self.state, command)?;
        Ok(true)
    }

    /// Runs main-thread commands until an exit. Handler failures are logged
    /// and do not end the loop.
    pub fn client_loop(&mut self) {
        while self.state.running {
            let _ = self.process_command(None);
        }
        debug!(node = %self.state.local_node, "client loop finished");
    }

    /// Stops the loop and drops whatever is still queued.
    pub fn exit_client(&mut self) -> usize {
        self.state.running = false;
        let dropped = self.state.queue.flush();
        if dropped > 0 {
            debug!(dropped, "discarded pending main-thread commands");
        }
        dropped
    }
}

/// Wakes a blocked [`Client::process_command`] without side effects.
#[derive(Clone)]
pub struct Interrupter {
    local_node: NodeId,
    queue: Arc<CommandQueue>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        let packet = Packet::new(DataType::Client, CommandKind::Interrupt);
        self.queue.push(Command::new(packet, self.local_node));
    }
}

/// The command a master sends to make a render client leave.
pub fn exit_packet() -> Packet {
    Packet::new(DataType::Client, CommandKind::Exit)
}

fn cmd_exit(state: &mut ClientState, command: Command) -> Result<()> {
    state.running = false;
    let origin = command.origin();
    if origin != state.local_node {
        info!(node = %origin, "exit requested by peer");
        if let Err(err) = state.nodes.disconnect(origin, false) {
            warn!(node = %origin, error = %err, "failed to disconnect peer");
        }
    }
    Ok(())
}

fn cmd_interrupt(_state: &mut ClientState, _command: Command) -> Result<()> {
    debug!("command loop interrupted");
    Ok(())
}
