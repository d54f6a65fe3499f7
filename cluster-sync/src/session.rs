//! Object registration and the subscription protocol.
//!
//! A [`Session`] owns every local object instance and is driven by exactly
//! one thread, the command thread, which pops its queue and runs the
//! registered handlers. Other threads talk to it through a
//! [`SessionHandle`]: either a request-id round trip (commit) or a closure
//! shipped as an `Invoke` command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandQueue, CommandRouter, Dispatcher};
use crate::error::{Error, Result};
use crate::node::{Nodes, Outbound};
use crate::object::{Distributable, MasterKind, Object};
use crate::packet::{CommandKind, DataType, Packet, Subscription};
use crate::request::{PendingRequest, Requests};
use crate::types::{InstanceId, NodeId, ObjectId, Version, VERSION_INVALID, VERSION_NONE};

/// Closure executed on the command thread.
pub type Invocation = Box<dyn FnOnce(&mut Session) + Send>;

type SessionHandler = fn(&mut Session, Command) -> Result<()>;

/// Sends to peers through the node table and to the local node through the
/// router, so masters and slaves may share a process.
struct SessionOutbound<'a> {
    local_node: NodeId,
    nodes: &'a Nodes,
    router: &'a CommandRouter,
}

impl Outbound for SessionOutbound<'_> {
    fn send_to(&self, node: NodeId, packet: &Packet) -> Result<()> {
        if node == self.local_node {
            self.router.route(Command::new(packet.clone(), node))
        } else {
            self.nodes.send(node, packet)
        }
    }
}

pub struct Session {
    local_node: NodeId,
    nodes: Nodes,
    router: Arc<CommandRouter>,
    requests: Requests,
    queue: Arc<CommandQueue>,
    objects: HashMap<ObjectId, Vec<Object>>,
    next_object_id: u32,
    next_instance_id: u32,
    running: bool,
}

impl Session {
    pub fn new(local_node: NodeId, nodes: Nodes, router: Arc<CommandRouter>) -> Self {
        Self {
            local_node,
            nodes,
            router,
            requests: Requests::new(),
            queue: Arc::new(CommandQueue::new("command-thread")),
            objects: HashMap::new(),
            next_object_id: 1,
            next_instance_id: 1,
            running: true,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn nodes(&self) -> &Nodes {
        &self.nodes
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn requests(&self) -> &Requests {
        &self.requests
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Installs the session's handlers. They all run on the session queue.
    pub fn register_handlers(&self, dispatcher: &mut Dispatcher<Session>) {
        let handlers: [(DataType, CommandKind, SessionHandler); 9] = [
            (DataType::Session, CommandKind::Commit, Session::cmd_commit),
            (DataType::Object, CommandKind::Instance, Session::cmd_object_data),
            (DataType::Object, CommandKind::Delta, Session::cmd_object_data),
            (DataType::Session, CommandKind::Subscribe, Session::cmd_subscribe),
            (DataType::Session, CommandKind::SubscribeReply, Session::cmd_subscribe_reply),
            (DataType::Session, CommandKind::Unsubscribe, Session::cmd_unsubscribe),
            (DataType::Session, CommandKind::Invoke, Session::cmd_invoke),
            (DataType::Session, CommandKind::Exit, Session::cmd_exit),
            (DataType::Session, CommandKind::Disconnected, Session::cmd_node_disconnected),
        ];
        for (data_type, kind, handler) in handlers {
            dispatcher.register(&self.router, data_type, kind, &self.queue, handler);
        }
    }

    /// Pops and handles commands until an exit command arrives.
    pub fn run(&mut self, dispatcher: &mut Dispatcher<Session>) {
        while self.running {
            if let Some(command) = self.queue.pop(None) {
                let _ = dispatcher.invoke(self, command);
            }
        }
        self.requests.abandon_all();
    }

    fn outbound(&self) -> SessionOutbound<'_> {
        SessionOutbound {
            local_node: self.local_node,
            nodes: &self.nodes,
            router: &self.router,
        }
    }

    fn next_instance(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        id
    }

    /// Registers new shared data with this node as its master, at version 1.
    pub fn register_object<T>(&mut self, data: T, kind: MasterKind) -> Result<ObjectId>
    where
        T: Distributable + 'static,
    {
        let id = ObjectId(self.next_object_id);
        let instance = self.next_instance();
        let object = Object::master(id, instance, data, kind)?;
        self.next_object_id += 1;
        self.objects.entry(id).or_default().push(object);
        info!(object = %id, %instance, ?kind, "registered object");
        Ok(id)
    }

    /// Removes every local instance of an object. A master must not have
    /// slaves left.
    pub fn deregister_object(&mut self, id: ObjectId) -> Result<()> {
        let instances = self.objects.get(&id).ok_or(Error::UnknownObject(id))?;
        if let Some(master) = instances.iter().find(|object| object.is_master()) {
            let slaves = master.change_manager().slaves();
            if !slaves.is_empty() {
                return Err(Error::contract(format!(
                    "{id} deregistered while {} node(s) still subscribe",
                    slaves.len()
                )));
            }
        }
        self.objects.remove(&id);
        info!(object = %id, "deregistered object");
        Ok(())
    }

    pub fn object(&self, id: ObjectId, instance: InstanceId) -> Option<&Object> {
        self.objects
            .get(&id)?
            .iter()
            .find(|object| object.instance_id() == instance)
    }

    pub fn object_mut(&mut self, id: ObjectId, instance: InstanceId) -> Option<&mut Object> {
        self.objects
            .get_mut(&id)?
            .iter_mut()
            .find(|object| object.instance_id() == instance)
    }

    pub fn master_object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)?.iter().find(|object| object.is_master())
    }

    pub fn master_object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects
            .get_mut(&id)?
            .iter_mut()
            .find(|object| object.is_master())
    }

    pub fn object_version(&self, id: ObjectId, instance: InstanceId) -> Result<Version> {
        self.object(id, instance)
            .map(Object::version)
            .ok_or(Error::UnknownInstance {
                object: id,
                instance,
            })
    }

    pub fn commit(&mut self, id: ObjectId) -> Result<Version> {
        let out = SessionOutbound {
            local_node: self.local_node,
            nodes: &self.nodes,
            router: &self.router,
        };
        let master = self
            .objects
            .get_mut(&id)
            .and_then(|instances| instances.iter_mut().find(|object| object.is_master()))
            .ok_or(Error::UnknownObject(id))?;
        master.commit(&out)
    }

    /// Subscribes `node` to the local master of `id`.
    pub fn add_slave(
        &mut self,
        id: ObjectId,
        node: NodeId,
        slave_instance: InstanceId,
        subscription: Subscription,
    ) -> Result<Version> {
        let out = SessionOutbound {
            local_node: self.local_node,
            nodes: &self.nodes,
            router: &self.router,
        };
        let master = self
            .objects
            .get_mut(&id)
            .and_then(|instances| instances.iter_mut().find(|object| object.is_master()))
            .ok_or(Error::UnknownObject(id))?;
        master.add_slave(&out, node, slave_instance, subscription)
    }

    pub fn remove_slave(&mut self, id: ObjectId, node: NodeId) -> Result<()> {
        let master = self
            .objects
            .get_mut(&id)
            .and_then(|instances| instances.iter_mut().find(|object| object.is_master()))
            .ok_or(Error::UnknownObject(id))?;
        master.remove_slave(node)
    }

    /// Creates a slave instance of `id` and asks `master_node` for its data.
    ///
    /// The returned request resolves to the slave's version once the master
    /// answered, or fails if `master_node` is lost first. Wait for it off the
    /// command thread.
    pub fn map_object<T>(
        &mut self,
        id: ObjectId,
        master_node: NodeId,
        data: T,
        subscription: Subscription,
    ) -> Result<(InstanceId, PendingRequest)>
    where
        T: Distributable + 'static,
    {
        if master_node != self.local_node && !self.nodes.is_connected(master_node) {
            return Err(Error::NotConnected(master_node));
        }
        let instance = self.next_instance();
        self.objects
            .entry(id)
            .or_default()
            .push(Object::slave(id, instance, master_node, data));

        let pending = if master_node == self.local_node {
            self.requests.register()
        } else {
            self.requests.register_for(master_node)
        };
        let subscribe = Packet::new(DataType::Session, CommandKind::Subscribe)
            .with_object(id, instance)
            .with_request(pending.id())
            .with_subscription(subscription);
        if let Err(err) = self.outbound().send_to(master_node, &subscribe) {
            self.drop_instance(id, instance);
            return Err(err);
        }
        debug!(object = %id, %instance, master = %master_node, "mapping object");
        Ok((instance, pending))
    }

    /// Removes a slave instance and unsubscribes it from its master.
    pub fn unmap_object(&mut self, id: ObjectId, instance: InstanceId) -> Result<()> {
        let object = self.object(id, instance).ok_or(Error::UnknownInstance {
            object: id,
            instance,
        })?;
        let Some(master_node) = object.change_manager().master_node() else {
            return Err(Error::contract(format!("{instance} of {id} is a master, not a mapping")));
        };
        self.drop_instance(id, instance);

        let unsubscribe = Packet::new(DataType::Session, CommandKind::Unsubscribe).with_object(id, instance);
        match self.outbound().send_to(master_node, &unsubscribe) {
            Err(Error::NotConnected(_) | Error::UnknownNode(_)) => {
                debug!(object = %id, master = %master_node, "master is gone, nothing to unsubscribe");
                Ok(())
            }
            other => other,
        }
    }

    fn drop_instance(&mut self, id: ObjectId, instance: InstanceId) {
        if let Some(instances) = self.objects.get_mut(&id) {
            instances.retain(|object| object.instance_id() != instance);
            if instances.is_empty() {
                self.objects.remove(&id);
            }
        }
    }

    fn cmd_commit(&mut self, command: Command) -> Result<()> {
        let packet = command.packet();
        let request = packet.request_id;
        match self.commit(packet.object_id) {
            Ok(version) => {
                self.requests.serve(request, version);
                Ok(())
            }
            Err(err) => {
                warn!(object = %packet.object_id, error = %err, "commit failed");
                self.requests.fail(request, err);
                Ok(())
            }
        }
    }

    fn cmd_object_data(&mut self, command: Command) -> Result<()> {
        let packet = command.packet();
        let Some(instances) = self.objects.get_mut(&packet.object_id) else {
            debug!(object = %packet.object_id, "data for an object that is not mapped");
            return Ok(());
        };
        for object in instances.iter_mut() {
            if packet.instance_id == InstanceId::ALL || packet.instance_id == object.instance_id() {
                object.apply(packet)?;
            }
        }
        Ok(())
    }

    fn cmd_subscribe(&mut self, command: Command) -> Result<()> {
        let node = command.origin();
        let packet = command.packet();
        let subscription = packet
            .subscription
            .unwrap_or_else(|| Subscription::uncached(VERSION_NONE));
        let reply = Packet::new(DataType::Session, CommandKind::SubscribeReply)
            .with_object(packet.object_id, packet.instance_id)
            .with_request(packet.request_id);

        let result = self.add_slave(packet.object_id, node, packet.instance_id, subscription);
        let master_instance = self
            .master_object(packet.object_id)
            .map_or(InstanceId::NONE, Object::instance_id);
        let version = result.unwrap_or_else(|err| {
            warn!(object = %packet.object_id, %node, error = %err, "subscription refused");
            VERSION_NONE
        });
        self.outbound().send_to(
            node,
            &reply.with_master_instance(master_instance).with_version(version),
        )
    }

    fn cmd_subscribe_reply(&mut self, command: Command) -> Result<()> {
        let packet = command.packet();
        let (id, instance, request) = (packet.object_id, packet.instance_id, packet.request_id);

        if packet.version == VERSION_NONE {
            self.drop_instance(id, instance);
            self.requests.fail(request, Error::UnknownObject(id));
            return Ok(());
        }
        let Some(object) = self.object_mut(id, instance) else {
            self.requests.fail(request, Error::UnknownInstance { object: id, instance });
            return Ok(());
        };
        if packet.version != VERSION_INVALID {
            object.adopt_cached(packet.version, packet.master_instance_id);
        }
        // Instance data travels ahead of the reply on the same link.
        let version = object.version();
        self.requests.serve(request, version);
        debug!(object = %id, %instance, version, "object mapped");
        Ok(())
    }

    fn cmd_unsubscribe(&mut self, command: Command) -> Result<()> {
        let packet = command.packet();
        self.remove_slave(packet.object_id, command.origin())
    }

    fn cmd_node_disconnected(&mut self, command: Command) -> Result<()> {
        let node = command.origin();
        for instances in self.objects.values_mut() {
            for object in instances.iter_mut() {
                if object.remove_node(node) {
                    info!(object = %object.id(), %node, "dropped subscriptions of lost node");
                }
                if object.change_manager().master_node() == Some(node) {
                    warn!(
                        object = %object.id(),
                        instance = %object.instance_id(),
                        %node,
                        "master of mapped object is gone"
                    );
                }
            }
        }
        let failed = self.requests.fail_node(node);
        if failed > 0 {
            info!(%node, failed, "failed requests waiting on lost node");
        }
        Ok(())
    }

    fn cmd_invoke(&mut self, mut command: Command) -> Result<()> {
        let invocation = command
            .take_attachment::<Invocation>()
            .ok_or_else(|| Error::contract("invoke command without a closure"))?;
        invocation(self);
        Ok(())
    }

    fn cmd_exit(&mut self, _command: Command) -> Result<()> {
        debug!("session exit requested");
        self.running = false;
        Ok(())
    }
}

/// The command thread and the session it drives.
pub struct SessionThread;

impl SessionThread {
    /// Starts the command thread.
    pub fn spawn(
        local_node: NodeId,
        nodes: Nodes,
        router: Arc<CommandRouter>,
    ) -> Result<(SessionHandle, JoinHandle<Session>)> {
        let mut session = Session::new(local_node, nodes, Arc::clone(&router));
        let mut dispatcher = Dispatcher::new();
        session.register_handlers(&mut dispatcher);

        let stopped = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle {
            local_node,
            queue: Arc::clone(session.queue()),
            requests: session.requests().clone(),
            stopped: Arc::clone(&stopped),
        };

        let join = thread::Builder::new()
            .name("command-thread".to_string())
            .spawn(move || {
                session.run(&mut dispatcher);
                stopped.store(true, Ordering::SeqCst);
                session.queue().flush();
                session.requests().abandon_all();
                debug!("command thread stopped");
                session
            })?;
        Ok((handle, join))
    }
}

/// Cheap, cloneable access to a running session from any thread.
#[derive(Clone)]
pub struct SessionHandle {
    local_node: NodeId,
    queue: Arc<CommandQueue>,
    requests: Requests,
    stopped: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    fn post(&self, packet: Packet, invocation: Option<Invocation>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::SessionStopped);
        }
        let command = match invocation {
            Some(invocation) => Command::with_attachment(packet, self.local_node, invocation),
            None => Command::new(packet, self.local_node),
        };
        self.queue.push(command);
        // The thread may have drained its queue for the last time before the
        // push landed; release whatever is left so no caller waits forever.
        if self.stopped.load(Ordering::SeqCst) {
            self.queue.flush();
            self.requests.abandon_all();
        }
        Ok(())
    }

    /// Commits the local master of `object` and returns its new version.
    pub fn commit(&self, object: ObjectId) -> Result<Version> {
        let pending = self.requests.register();
        let packet = Packet::new(DataType::Session, CommandKind::Commit)
            .with_object(object, InstanceId::NONE)
            .with_request(pending.id());
        self.post(packet, None)?;
        pending.wait(None)
    }

    /// Runs `f` on the command thread and returns its result.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let invocation: Invocation = Box::new(move |session| {
            let _ = tx.send(f(session));
        });
        self.post(Packet::new(DataType::Session, CommandKind::Invoke), Some(invocation))?;
        rx.recv().map_err(|_| Error::SessionStopped)
    }

    pub fn register_object<T>(&self, data: T, kind: MasterKind) -> Result<ObjectId>
    where
        T: Distributable + 'static,
    {
        self.call(move |session| session.register_object(data, kind))?
    }

    pub fn deregister_object(&self, id: ObjectId) -> Result<()> {
        self.call(move |session| session.deregister_object(id))?
    }

    /// Maps `id` from `master_node` and waits until the slave holds the
    /// requested version.
    pub fn map_object<T>(
        &self,
        id: ObjectId,
        master_node: NodeId,
        data: T,
        subscription: Subscription,
    ) -> Result<(InstanceId, Version)>
    where
        T: Distributable + 'static,
    {
        let (instance, pending) =
            self.call(move |session| session.map_object(id, master_node, data, subscription))??;
        Ok((instance, pending.wait(None)?))
    }

    pub fn unmap_object(&self, id: ObjectId, instance: InstanceId) -> Result<()> {
        self.call(move |session| session.unmap_object(id, instance))?
    }

    pub fn object_version(&self, id: ObjectId, instance: InstanceId) -> Result<Version> {
        self.call(move |session| session.object_version(id, instance))?
    }

    /// Asks the command thread to stop after the commands queued so far.
    /// Stopping a stopped session is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        match self.post(Packet::new(DataType::Session, CommandKind::Exit), None) {
            Err(Error::SessionStopped) => Ok(()),
            other => other,
        }
    }
}
