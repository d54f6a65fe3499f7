//! The wire packet.
//!
//! Every frame on a connection is a 4-byte big-endian length followed by a
//! bincode-encoded [`Packet`]. The header fields are fixed; the payload is
//! opaque to this crate and belongs to the object's pack/unpack callbacks.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{InstanceId, ObjectId, RequestId, Version, VERSION_NONE};

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Which dispatcher family a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Node,
    Session,
    Object,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Local request to commit a master instance.
    Commit,
    /// Full instance data for one subscriber.
    Instance,
    /// Incremental change between two consecutive versions.
    Delta,
    Subscribe,
    SubscribeReply,
    Unsubscribe,
    /// A peer connection was lost. Generated locally by the receiver.
    Disconnected,
    /// Runs a closure attached to the command on the consuming thread.
    Invoke,
    Exit,
    Interrupt,
    Custom(u16),
}

/// Extra header of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// `VERSION_OLDEST`, `VERSION_NONE` or the master's current version.
    pub requested_version: Version,
    pub min_cached_version: Version,
    pub max_cached_version: Version,
    /// Master instance the cached versions came from.
    pub cache_source: InstanceId,
}

impl Subscription {
    /// A subscription from a node that holds no cached data.
    pub fn uncached(requested_version: Version) -> Self {
        Self {
            requested_version,
            min_cached_version: Version::MAX,
            max_cached_version: VERSION_NONE,
            cache_source: InstanceId::NONE,
        }
    }

    /// A subscription from a node that already holds versions `min..=max`
    /// of the data served by master instance `source`.
    pub fn cached(requested_version: Version, min: Version, max: Version, source: InstanceId) -> Self {
        Self {
            requested_version,
            min_cached_version: min,
            max_cached_version: max,
            cache_source: source,
        }
    }

    pub fn cache_contains(&self, version: Version) -> bool {
        self.min_cached_version <= version && version <= self.max_cached_version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub data_type: DataType,
    pub command: CommandKind,
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    /// Master instance that produced the data or answers a subscription.
    pub master_instance_id: InstanceId,
    pub version: Version,
    pub request_id: RequestId,
    pub subscription: Option<Subscription>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(data_type: DataType, command: CommandKind) -> Self {
        Self {
            data_type,
            command,
            object_id: ObjectId(0),
            instance_id: InstanceId::NONE,
            master_instance_id: InstanceId::NONE,
            version: VERSION_NONE,
            request_id: 0,
            subscription: None,
            payload: Vec::new(),
        }
    }

    pub fn with_object(mut self, object_id: ObjectId, instance_id: InstanceId) -> Self {
        self.object_id = object_id;
        self.instance_id = instance_id;
        self
    }

    pub fn with_master_instance(mut self, master_instance_id: InstanceId) -> Self {
        self.master_instance_id = master_instance_id;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Encodes the packet as one length-prefixed frame.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(body)?)
    }
}
