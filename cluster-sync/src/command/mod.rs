//! Command envelopes and their delivery.
//!
//! - [`queue`]: the blocking FIFO owned by one consumer thread
//! - [`dispatch`]: routing of command kinds to queues, and handler tables

pub mod dispatch;
pub mod queue;

use std::any::Any;
use std::fmt;

use crate::packet::{CommandKind, DataType, Packet};
use crate::types::NodeId;

pub use dispatch::{CommandRouter, Dispatcher};
pub use queue::CommandQueue;

/// A packet together with the node it came from.
///
/// Locally generated commands may carry an attachment, a value that never
/// crosses the wire (for example a closure to run on the consuming thread).
pub struct Command {
    packet: Packet,
    origin: NodeId,
    attachment: Option<Box<dyn Any + Send>>,
}

impl Command {
    pub fn new(packet: Packet, origin: NodeId) -> Self {
        Self {
            packet,
            origin,
            attachment: None,
        }
    }

    pub fn with_attachment<T: Any + Send>(packet: Packet, origin: NodeId, attachment: T) -> Self {
        Self {
            packet,
            origin,
            attachment: Some(Box::new(attachment)),
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn data_type(&self) -> DataType {
        self.packet.data_type
    }

    pub fn kind(&self) -> CommandKind {
        self.packet.command
    }

    /// Takes the attachment if it has type `T`.
    pub fn take_attachment<T: Any>(&mut self) -> Option<T> {
        let attachment = self.attachment.take()?;
        match attachment.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.attachment = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("data_type", &self.packet.data_type)
            .field("command", &self.packet.command)
            .field("object", &self.packet.object_id)
            .field("instance", &self.packet.instance_id)
            .field("origin", &self.origin)
            .field("attachment", &self.attachment.is_some())
            .finish()
    }
}
