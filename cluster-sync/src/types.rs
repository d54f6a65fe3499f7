//! Identifiers shared by every layer, plus the version sentinels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic object version. Real versions start at [`VERSION_FIRST`].
pub type Version = u32;

/// Correlates an asynchronous completion with the request that started it.
pub type RequestId = u32;

/// No data desired; subscribe for version tracking only.
pub const VERSION_NONE: Version = 0;
/// First version of a newly registered object.
pub const VERSION_FIRST: Version = 1;
/// Oldest version still retained by the master.
pub const VERSION_OLDEST: Version = 0xffff_fffd;
/// Nothing was served from cache; the data arrives as a separate stream.
pub const VERSION_INVALID: Version = 0xffff_fffe;
/// Whatever the master holds right now.
pub const VERSION_HEAD: Version = 0xffff_ffff;

/// True for versions that name an actual committed state.
pub fn is_real_version(version: Version) -> bool {
    version != VERSION_NONE && version < VERSION_OLDEST
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Distinguishes the mirrors of one object living on the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Addresses every instance of an object on the receiving node.
    pub const ALL: InstanceId = InstanceId(u32::MAX);
    pub const NONE: InstanceId = InstanceId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object-{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            InstanceId::ALL => f.write_str("instance-*"),
            InstanceId(id) => write!(f, "instance-{id}"),
        }
    }
}
