//! Replicated objects.
//!
//! An [`Object`] is one local instance of a shared object: the application
//! data behind the [`Distributable`] callbacks plus the [`ChangeManager`] that
//! decides what crosses the wire.

pub mod change_manager;
pub mod stream;

use std::any::Any;

use crate::error::Result;
use crate::node::Outbound;
use crate::packet::{Packet, Subscription};
use crate::types::{InstanceId, NodeId, ObjectId, Version};

pub use change_manager::{ChangeManager, MasterKind, ObjectRef, SlaveList};
pub use stream::{DataIStream, DataOStream};

/// Serialization callbacks of shared application data.
///
/// `get_instance_data`/`apply_instance_data` move the full state; `pack`
/// and `unpack` move the change since the last commit and default to the
/// full state. Writing nothing in `pack` means nothing changed.
pub trait Distributable: Send {
    fn get_instance_data(&self, os: &mut DataOStream) -> Result<()>;

    fn apply_instance_data(&mut self, is: &mut DataIStream<'_>) -> Result<()>;

    fn pack(&mut self, os: &mut DataOStream) -> Result<()> {
        self.get_instance_data(os)
    }

    fn unpack(&mut self, is: &mut DataIStream<'_>) -> Result<()> {
        self.apply_instance_data(is)
    }
}

/// Object data that can still be handed back to the application as its
/// concrete type.
trait StoredData: Distributable {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Distributable + 'static> StoredData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct Object {
    id: ObjectId,
    instance_id: InstanceId,
    change_manager: ChangeManager,
    data: Box<dyn StoredData>,
}

impl Object {
    pub fn master<T>(id: ObjectId, instance_id: InstanceId, data: T, kind: MasterKind) -> Result<Self>
    where
        T: Distributable + 'static,
    {
        let mut change_manager = ChangeManager::master(kind);
        change_manager.record_snapshot(&data)?;
        Ok(Self {
            id,
            instance_id,
            change_manager,
            data: Box::new(data),
        })
    }

    pub fn slave<T>(id: ObjectId, instance_id: InstanceId, master_node: NodeId, data: T) -> Self
    where
        T: Distributable + 'static,
    {
        Self {
            id,
            instance_id,
            change_manager: ChangeManager::slave(master_node),
            data: Box::new(data),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn version(&self) -> Version {
        self.change_manager.version()
    }

    pub fn is_master(&self) -> bool {
        self.change_manager.is_master()
    }

    pub fn change_manager(&self) -> &ChangeManager {
        &self.change_manager
    }

    /// The application data, if it is a `T`.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref()
    }

    pub fn data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.as_any_mut().downcast_mut()
    }

    fn target(&self) -> ObjectRef {
        ObjectRef {
            object: self.id,
            instance: self.instance_id,
        }
    }

    pub fn commit(&mut self, out: &dyn Outbound) -> Result<Version> {
        let target = self.target();
        self.change_manager.commit(target, &mut *self.data, out)
    }

    pub fn add_slave(
        &mut self,
        out: &dyn Outbound,
        node: NodeId,
        slave_instance: InstanceId,
        subscription: Subscription,
    ) -> Result<Version> {
        let target = self.target();
        self.change_manager
            .add_slave(target, &*self.data, out, node, slave_instance, subscription)
    }

    pub fn remove_slave(&mut self, node: NodeId) -> Result<()> {
        let target = self.target();
        self.change_manager.remove_slave(target, node)
    }

    pub fn remove_node(&mut self, node: NodeId) -> bool {
        self.change_manager.remove_node(node)
    }

    pub fn adopt_cached(&mut self, version: Version, source: InstanceId) {
        self.change_manager.adopt_cached(version, source);
    }

    pub fn apply(&mut self, packet: &Packet) -> Result<bool> {
        let target = self.target();
        self.change_manager.apply(target, &mut *self.data, packet)
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("change_manager", &self.change_manager)
            .finish_non_exhaustive()
    }
}
