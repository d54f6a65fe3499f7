use std::fmt;

use thiserror::Error;

use crate::node::NodeState;
use crate::types::{InstanceId, NodeId, ObjectId, RequestId};

/// Cluster startup steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    Listener,
    Launch,
    Connect,
    Receiver,
}

impl fmt::Display for StartupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            StartupStage::Listener => "starting the listener",
            StartupStage::Launch => "launching nodes",
            StartupStage::Connect => "connecting nodes",
            StartupStage::Receiver => "starting the receiver",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("unknown instance {instance} of {object}")]
    UnknownInstance { object: ObjectId, instance: InstanceId },
    #[error("{0} is not connected")]
    NotConnected(NodeId),
    #[error("{node} cannot go from {from} to {to}")]
    InvalidTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("failed to launch {node}: {reason}")]
    Launch { node: NodeId, reason: String },
    #[error("timed out {0}")]
    Timeout(String),
    #[error("request {0} was abandoned")]
    RequestAbandoned(RequestId),
    #[error("the session thread has stopped")]
    SessionStopped,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("contract violation: {0}")]
    ContractViolation(String),
    #[error("cluster startup failed while {stage}: {source}")]
    Startup {
        stage: StartupStage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn startup(stage: StartupStage, source: Error) -> Self {
        Error::Startup {
            stage,
            source: Box::new(source),
        }
    }

    /// Builds a contract violation and reports it where it was detected.
    pub(crate) fn contract(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "contract violation");
        Error::ContractViolation(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
