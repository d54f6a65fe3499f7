use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{Command, CommandQueue};
use crate::error::{Error, Result};
use crate::packet::{CommandKind, DataType};

pub type CommandKey = (DataType, CommandKind);

/// Maps each command kind to the queue of the thread that handles it.
///
/// Shared by the receiver (remote packets) and by any thread that posts
/// local commands.
#[derive(Default)]
pub struct CommandRouter {
    routes: RwLock<HashMap<CommandKey, Arc<CommandQueue>>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `(data_type, kind)` to `queue`, replacing any earlier route.
    pub fn register(&self, data_type: DataType, kind: CommandKind, queue: Arc<CommandQueue>) {
        let target = queue.name().to_string();
        if let Some(previous) = self.routes.write().insert((data_type, kind), queue) {
            warn!(?data_type, ?kind, from = previous.name(), to = %target, "command route replaced");
        }
    }

    pub fn queue_for(&self, data_type: DataType, kind: CommandKind) -> Option<Arc<CommandQueue>> {
        self.routes.read().get(&(data_type, kind)).cloned()
    }

    /// Pushes the command onto its registered queue.
    pub fn route(&self, command: Command) -> Result<()> {
        let queue = self.queue_for(command.data_type(), command.kind());
        match queue {
            Some(queue) => {
                debug!(?command, queue = queue.name(), "routing command");
                queue.push(command);
                Ok(())
            }
            None => {
                warn!(?command, "no route for command");
                Err(Error::Config(format!(
                    "no queue registered for {:?}/{:?}",
                    command.data_type(),
                    command.kind()
                )))
            }
        }
    }
}

type Handler<T> = Box<dyn FnMut(&mut T, Command) -> Result<()> + Send>;

/// Handler table of one consumer. `T` is the state the handlers operate on.
pub struct Dispatcher<T> {
    handlers: HashMap<CommandKey, Handler<T>>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` and routes the command kind to `queue`.
    pub fn register<F>(
        &mut self,
        router: &CommandRouter,
        data_type: DataType,
        kind: CommandKind,
        queue: &Arc<CommandQueue>,
        handler: F,
    ) where
        F: FnMut(&mut T, Command) -> Result<()> + Send + 'static,
    {
        self.handlers.insert((data_type, kind), Box::new(handler));
        router.register(data_type, kind, Arc::clone(queue));
    }

    /// Runs the handler for `command`. Handler errors are logged and returned.
    pub fn invoke(&mut self, target: &mut T, command: Command) -> Result<()> {
        let key = (command.data_type(), command.kind());
        let Some(handler) = self.handlers.get_mut(&key) else {
            return Err(Error::contract(format!(
                "command {:?}/{:?} reached a queue without a handler",
                key.0, key.1
            )));
        };
        handler(target, command).inspect_err(|err| {
            warn!(data_type = ?key.0, kind = ?key.1, error = %err, "command handler failed");
        })
    }
}
