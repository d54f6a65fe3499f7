//! Replication strategies.
//!
//! Masters stream changes to their slave nodes; slaves apply what arrives.
//! New subscribers always get full instance data, existing ones get deltas.
//! All methods run on the thread that owns the object.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace, warn};

use super::stream::{DataIStream, DataOStream};
use super::Distributable;
use crate::error::{Error, Result};
use crate::node::Outbound;
use crate::packet::{CommandKind, DataType, Packet, Subscription};
use crate::types::{
    is_real_version, InstanceId, NodeId, ObjectId, Version, VERSION_FIRST, VERSION_HEAD,
    VERSION_INVALID, VERSION_NONE, VERSION_OLDEST,
};

/// Which object instance a change manager works for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub object: ObjectId,
    pub instance: InstanceId,
}

/// Sorted, de-duplicated slave nodes with a subscriber count per node.
#[derive(Debug, Default)]
pub struct SlaveList {
    nodes: Vec<NodeId>,
    counts: HashMap<NodeId, u32>,
}

impl SlaveList {
    pub fn add(&mut self, node: NodeId) {
        *self.counts.entry(node).or_insert(0) += 1;
        if let Err(pos) = self.nodes.binary_search(&node) {
            self.nodes.insert(pos, node);
        }
    }

    /// Drops one subscription of `node`. The node leaves the list when its
    /// last subscription goes.
    pub fn remove(&mut self, node: NodeId) -> Result<()> {
        let Some(count) = self.counts.get_mut(&node).filter(|count| **count > 0) else {
            return Err(Error::contract(format!(
                "{node} removed as slave without a matching subscription"
            )));
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&node);
            if let Ok(pos) = self.nodes.binary_search(&node) {
                self.nodes.remove(pos);
            }
        }
        Ok(())
    }

    /// Drops every subscription of `node` at once.
    pub fn purge(&mut self, node: NodeId) -> bool {
        let had = self.counts.remove(&node).is_some();
        if let Ok(pos) = self.nodes.binary_search(&node) {
            self.nodes.remove(pos);
        }
        had
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn count(&self, node: NodeId) -> u32 {
        self.counts.get(&node).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// How a master keeps history for late joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterKind {
    /// No history; the latest state only.
    Unbuffered,
    /// Retains up to `depth` prior snapshots.
    Buffered { depth: usize },
}

#[derive(Debug)]
pub enum ChangeManager {
    UnbufferedMaster {
        version: Version,
        slaves: SlaveList,
    },
    BufferedMaster {
        version: Version,
        slaves: SlaveList,
        /// Full snapshots, oldest first. The newest one belongs to `version`.
        history: VecDeque<(Version, Vec<u8>)>,
        depth: usize,
    },
    Slave {
        version: Version,
        master_node: NodeId,
        master_instance: InstanceId,
    },
}

impl ChangeManager {
    pub fn master(kind: MasterKind) -> Self {
        match kind {
            MasterKind::Unbuffered => ChangeManager::UnbufferedMaster {
                version: VERSION_FIRST,
                slaves: SlaveList::default(),
            },
            MasterKind::Buffered { depth } => ChangeManager::BufferedMaster {
                version: VERSION_FIRST,
                slaves: SlaveList::default(),
                history: VecDeque::new(),
                depth,
            },
        }
    }

    pub fn slave(master_node: NodeId) -> Self {
        ChangeManager::Slave {
            version: VERSION_NONE,
            master_node,
            master_instance: InstanceId::NONE,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            ChangeManager::UnbufferedMaster { version, .. }
            | ChangeManager::BufferedMaster { version, .. }
            | ChangeManager::Slave { version, .. } => *version,
        }
    }

    pub fn is_master(&self) -> bool {
        !matches!(self, ChangeManager::Slave { .. })
    }

    pub fn master_node(&self) -> Option<NodeId> {
        match self {
            ChangeManager::Slave { master_node, .. } => Some(*master_node),
            _ => None,
        }
    }

    /// Instance on the master that last fed this slave.
    pub fn master_instance(&self) -> Option<InstanceId> {
        match self {
            ChangeManager::Slave {
                master_instance, ..
            } => Some(*master_instance),
            _ => None,
        }
    }

    pub fn slaves(&self) -> &[NodeId] {
        match self {
            ChangeManager::UnbufferedMaster { slaves, .. }
            | ChangeManager::BufferedMaster { slaves, .. } => slaves.nodes(),
            ChangeManager::Slave { .. } => &[],
        }
    }

    pub fn subscriber_count(&self, node: NodeId) -> u32 {
        match self {
            ChangeManager::UnbufferedMaster { slaves, .. }
            | ChangeManager::BufferedMaster { slaves, .. } => slaves.count(node),
            ChangeManager::Slave { .. } => 0,
        }
    }

    /// Oldest version a subscriber asking for `VERSION_OLDEST` would get.
    pub fn oldest_version(&self) -> Version {
        match self {
            ChangeManager::BufferedMaster {
                history, version, ..
            } => history.front().map_or(*version, |(oldest, _)| *oldest),
            other => other.version(),
        }
    }

    /// Snapshots the current state for late joiners. No-op unless buffered.
    pub fn record_snapshot<D>(&mut self, data: &D) -> Result<()>
    where
        D: Distributable + ?Sized,
    {
        if let ChangeManager::BufferedMaster {
            version,
            history,
            depth,
            ..
        } = self
        {
            let mut os = DataOStream::new();
            data.get_instance_data(&mut os)?;
            if history.back().is_some_and(|(v, _)| *v == *version) {
                history.pop_back();
            }
            history.push_back((*version, os.into_bytes()));
            while history.len() > *depth + 1 {
                history.pop_front();
            }
        }
        Ok(())
    }

    /// Propagates local changes to every slave and returns the resulting
    /// version. The version advances only when packing produced data.
    pub fn commit<D>(&mut self, target: ObjectRef, data: &mut D, out: &dyn Outbound) -> Result<Version>
    where
        D: Distributable + ?Sized,
    {
        let (version, slaves) = match self {
            ChangeManager::UnbufferedMaster { version, slaves }
            | ChangeManager::BufferedMaster { version, slaves, .. } => (version, slaves),
            ChangeManager::Slave { .. } => {
                return Err(Error::contract(format!(
                    "commit on slave {} of {}",
                    target.instance, target.object
                )));
            }
        };
        if slaves.is_empty() {
            return Ok(*version);
        }

        let mut os = DataOStream::new();
        data.pack(&mut os)?;
        if !os.has_data() {
            trace!(object = %target.object, version = *version, "nothing to commit");
            return Ok(*version);
        }

        let next = *version + 1;
        let delta = Packet::new(DataType::Object, CommandKind::Delta)
            .with_object(target.object, InstanceId::ALL)
            .with_master_instance(target.instance)
            .with_version(next)
            .with_payload(os.into_bytes());
        for &node in slaves.nodes() {
            if let Err(err) = out.send_to(node, &delta) {
                warn!(object = %target.object, %node, error = %err, "failed to send delta");
            }
        }
        *version = next;
        debug!(object = %target.object, version = next, slaves = slaves.nodes().len(), "committed");

        self.record_snapshot(&*data)?;
        Ok(next)
    }

    /// Subscribes `node` and decides what it needs to receive.
    ///
    /// The subscription names the master instance that filled the
    /// subscriber's cache. Returns the cached version on a cache hit, otherwise
    /// `VERSION_INVALID` after streaming instance data to the subscriber.
    pub fn add_slave<D>(
        &mut self,
        target: ObjectRef,
        data: &D,
        out: &dyn Outbound,
        node: NodeId,
        slave_instance: InstanceId,
        subscription: Subscription,
    ) -> Result<Version>
    where
        D: Distributable + ?Sized,
    {
        let (version, slaves, history) = match self {
            ChangeManager::UnbufferedMaster { version, slaves } => (*version, slaves, None),
            ChangeManager::BufferedMaster {
                version,
                slaves,
                history,
                ..
            } => (*version, slaves, Some(&*history)),
            ChangeManager::Slave { .. } => {
                return Err(Error::contract(format!(
                    "{node} subscribed to slave {} of {}",
                    target.instance, target.object
                )));
            }
        };

        let requested = match subscription.requested_version {
            VERSION_HEAD => version,
            requested => requested,
        };
        if requested != VERSION_OLDEST && requested != VERSION_NONE && requested != version {
            return Err(Error::contract(format!(
                "{node} requested version {requested} of {}, current is {version}",
                target.object
            )));
        }
        slaves.add(node);

        if subscription.cache_source == target.instance && subscription.cache_contains(version) {
            debug!(object = %target.object, %node, version, "subscriber is served from its cache");
            return Ok(if requested == VERSION_OLDEST {
                subscription.min_cached_version
            } else {
                version
            });
        }

        let instance = |version: Version, payload: Vec<u8>| {
            Packet::new(DataType::Object, CommandKind::Instance)
                .with_object(target.object, slave_instance)
                .with_master_instance(target.instance)
                .with_version(version)
                .with_payload(payload)
        };

        let mut sent = false;
        if requested != VERSION_NONE {
            if requested == VERSION_OLDEST {
                for (old, snapshot) in history.into_iter().flatten() {
                    if *old < version {
                        out.send_to(node, &instance(*old, snapshot.clone()))?;
                        sent = true;
                    }
                }
            }
            let mut os = DataOStream::new();
            data.get_instance_data(&mut os)?;
            if os.has_data() {
                out.send_to(node, &instance(version, os.into_bytes()))?;
                sent = true;
            }
        }
        if !sent {
            out.send_to(node, &instance(version, Vec::new()))?;
        }
        Ok(VERSION_INVALID)
    }

    pub fn remove_slave(&mut self, target: ObjectRef, node: NodeId) -> Result<()> {
        match self {
            ChangeManager::UnbufferedMaster { slaves, .. }
            | ChangeManager::BufferedMaster { slaves, .. } => slaves.remove(node),
            ChangeManager::Slave { .. } => Err(Error::contract(format!(
                "{node} unsubscribed from slave {} of {}",
                target.instance, target.object
            ))),
        }
    }

    /// Forgets every subscription of a node that went away.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        match self {
            ChangeManager::UnbufferedMaster { slaves, .. }
            | ChangeManager::BufferedMaster { slaves, .. } => slaves.purge(node),
            ChangeManager::Slave { .. } => false,
        }
    }

    /// A subscriber served from its cache takes the version it already holds.
    pub fn adopt_cached(&mut self, cached: Version, source: InstanceId) {
        if let ChangeManager::Slave {
            version,
            master_instance,
            ..
        } = self
        {
            *version = cached;
            *master_instance = source;
        }
    }

    /// Applies an instance or delta packet. Returns whether anything changed;
    /// versions at or below the applied one are ignored.
    pub fn apply<D>(&mut self, target: ObjectRef, data: &mut D, packet: &Packet) -> Result<bool>
    where
        D: Distributable + ?Sized,
    {
        let ChangeManager::Slave {
            version,
            master_instance,
            ..
        } = self
        else {
            trace!(object = %target.object, kind = ?packet.command, "master ignores incoming data");
            return Ok(false);
        };
        if !is_real_version(packet.version) {
            return Err(Error::contract(format!(
                "{:?} for {} carries no version",
                packet.command, target.object
            )));
        }
        if *version != VERSION_NONE && packet.version <= *version {
            trace!(object = %target.object, version = packet.version, applied = *version, "stale data");
            return Ok(false);
        }

        let mut is = DataIStream::new(&packet.payload);
        match packet.command {
            CommandKind::Instance if packet.payload.is_empty() => {}
            CommandKind::Instance => data.apply_instance_data(&mut is)?,
            CommandKind::Delta => data.unpack(&mut is)?,
            other => {
                return Err(Error::contract(format!(
                    "{other:?} cannot be applied to {}",
                    target.object
                )));
            }
        }
        *version = packet.version;
        if packet.master_instance_id != InstanceId::NONE {
            *master_instance = packet.master_instance_id;
        }
        trace!(object = %target.object, instance = %target.instance, version = *version, "applied");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Counter that only packs when it changed since the last pack.
    #[derive(Debug, Default)]
    struct Counter {
        value: u64,
        dirty: bool,
    }

    impl Counter {
        fn bump(&mut self) {
            self.value += 1;
            self.dirty = true;
        }
    }

    impl Distributable for Counter {
        fn get_instance_data(&self, os: &mut DataOStream) -> Result<()> {
            os.write(&self.value)
        }

        fn apply_instance_data(&mut self, is: &mut DataIStream<'_>) -> Result<()> {
            self.value = is.read()?;
            Ok(())
        }

        fn pack(&mut self, os: &mut DataOStream) -> Result<()> {
            if std::mem::take(&mut self.dirty) {
                os.write(&self.value)?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: RefCell<Vec<(NodeId, Packet)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(NodeId, Packet)> {
            std::mem::take(&mut *self.sent.borrow_mut())
        }
    }

    impl Outbound for Recorder {
        fn send_to(&self, node: NodeId, packet: &Packet) -> Result<()> {
            self.sent.borrow_mut().push((node, packet.clone()));
            Ok(())
        }
    }

    const MASTER: ObjectRef = ObjectRef {
        object: ObjectId(1),
        instance: InstanceId(1),
    };
    const SLAVE: ObjectRef = ObjectRef {
        object: ObjectId(1),
        instance: InstanceId(5),
    };

    fn subscribe(
        cm: &mut ChangeManager,
        data: &Counter,
        out: &Recorder,
        node: NodeId,
    ) -> Version {
        cm.add_slave(
            MASTER,
            data,
            out,
            node,
            SLAVE.instance,
            Subscription::uncached(VERSION_NONE),
        )
        .expect("add slave")
    }

    #[test]
    fn commit_without_slaves_keeps_version() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let mut data = Counter::default();
        let out = Recorder::default();

        for _ in 0..10 {
            data.bump();
            assert_eq!(cm.commit(MASTER, &mut data, &out).expect("commit"), VERSION_FIRST);
        }
        assert_eq!(cm.version(), VERSION_FIRST);
        assert!(out.take().is_empty());
    }

    #[test]
    fn each_commit_with_data_advances_once() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let mut data = Counter::default();
        let out = Recorder::default();
        subscribe(&mut cm, &data, &out, NodeId(2));
        out.take();

        for expected in 2..=6 {
            data.bump();
            assert_eq!(cm.commit(MASTER, &mut data, &out).expect("commit"), expected);
            assert_eq!(cm.commit(MASTER, &mut data, &out).expect("no-op"), expected);
        }
        let versions: Vec<_> = out.take().into_iter().map(|(_, p)| p.version).collect();
        assert_eq!(versions, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn slaves_are_reference_counted() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let data = Counter::default();
        let out = Recorder::default();

        subscribe(&mut cm, &data, &out, NodeId(3));
        cm.remove_slave(MASTER, NodeId(3)).expect("remove");
        assert_eq!(cm.subscriber_count(NodeId(3)), 0);
        assert!(cm.slaves().is_empty());

        subscribe(&mut cm, &data, &out, NodeId(3));
        subscribe(&mut cm, &data, &out, NodeId(3));
        subscribe(&mut cm, &data, &out, NodeId(2));
        assert_eq!(cm.slaves(), &[NodeId(2), NodeId(3)]);

        cm.remove_slave(MASTER, NodeId(3)).expect("first remove");
        assert_eq!(cm.slaves(), &[NodeId(2), NodeId(3)]);
        cm.remove_slave(MASTER, NodeId(3)).expect("second remove");
        assert_eq!(cm.slaves(), &[NodeId(2)]);

        assert!(matches!(
            cm.remove_slave(MASTER, NodeId(3)),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn cache_hit_sends_nothing() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let data = Counter::default();
        let out = Recorder::default();

        let version = cm
            .add_slave(
                MASTER,
                &data,
                &out,
                NodeId(2),
                SLAVE.instance,
                Subscription::cached(VERSION_FIRST, VERSION_FIRST, VERSION_FIRST, MASTER.instance),
            )
            .expect("add slave");
        assert_eq!(version, VERSION_FIRST);
        assert!(out.take().is_empty());

        // Same range, but the cache was filled by another instance.
        let version = cm
            .add_slave(
                MASTER,
                &data,
                &out,
                NodeId(2),
                SLAVE.instance,
                Subscription::cached(VERSION_FIRST, VERSION_FIRST, VERSION_FIRST, InstanceId(9)),
            )
            .expect("add slave");
        assert_eq!(version, VERSION_INVALID);
        assert_eq!(out.take().len(), 1);
    }

    #[test]
    fn new_subscriber_gets_full_state() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let data = Counter {
            value: 41,
            dirty: false,
        };
        let out = Recorder::default();

        let result = cm
            .add_slave(
                MASTER,
                &data,
                &out,
                NodeId(2),
                SLAVE.instance,
                Subscription::uncached(VERSION_OLDEST),
            )
            .expect("add slave");
        assert_eq!(result, VERSION_INVALID);

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        let (node, packet) = &sent[0];
        assert_eq!(*node, NodeId(2));
        assert_eq!(packet.command, CommandKind::Instance);
        assert_eq!(packet.instance_id, SLAVE.instance);
        assert_eq!(packet.version, VERSION_FIRST);
        let mut is = DataIStream::new(&packet.payload);
        assert_eq!(is.read::<u64>().expect("value"), 41);
    }

    #[test]
    fn version_only_subscriber_gets_empty_instance() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let data = Counter::default();
        let out = Recorder::default();

        subscribe(&mut cm, &data, &out, NodeId(2));
        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.payload.is_empty());
        assert_eq!(sent[0].1.version, VERSION_FIRST);
    }

    #[test]
    fn unexpected_requested_version_is_rejected() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let data = Counter::default();
        let out = Recorder::default();

        let result = cm.add_slave(
            MASTER,
            &data,
            &out,
            NodeId(2),
            SLAVE.instance,
            Subscription::uncached(7),
        );
        assert!(matches!(result, Err(Error::ContractViolation(_))));
        assert!(cm.slaves().is_empty());
    }

    #[test]
    fn head_subscriber_gets_current_state() {
        let mut cm = ChangeManager::master(MasterKind::Buffered { depth: 2 });
        let mut data = Counter::default();
        let out = Recorder::default();
        cm.record_snapshot(&data).expect("snapshot");
        subscribe(&mut cm, &data, &out, NodeId(2));
        for _ in 0..3 {
            data.bump();
            cm.commit(MASTER, &mut data, &out).expect("commit");
        }
        out.take();

        let result = cm
            .add_slave(
                MASTER,
                &data,
                &out,
                NodeId(3),
                SLAVE.instance,
                Subscription::uncached(VERSION_HEAD),
            )
            .expect("add slave");
        assert_eq!(result, VERSION_INVALID);
        let versions: Vec<_> = out.take().into_iter().map(|(_, p)| p.version).collect();
        assert_eq!(versions, vec![4]);
    }

    #[test]
    fn removed_slave_receives_no_more_deltas() {
        let mut cm = ChangeManager::master(MasterKind::Unbuffered);
        let mut data = Counter::default();
        let out = Recorder::default();
        subscribe(&mut cm, &data, &out, NodeId(2));
        subscribe(&mut cm, &data, &out, NodeId(3));
        for _ in 0..4 {
            data.bump();
            cm.commit(MASTER, &mut data, &out).expect("commit");
        }
        assert_eq!(cm.version(), 5);
        out.take();

        cm.remove_slave(MASTER, NodeId(3)).expect("remove");
        data.bump();
        assert_eq!(cm.commit(MASTER, &mut data, &out).expect("commit"), 6);
        let receivers: Vec<_> = out.take().into_iter().map(|(node, _)| node).collect();
        assert_eq!(receivers, vec![NodeId(2)]);
    }

    #[test]
    fn buffered_master_replays_history_to_oldest_subscriber() {
        let mut cm = ChangeManager::master(MasterKind::Buffered { depth: 2 });
        let mut data = Counter::default();
        let out = Recorder::default();
        cm.record_snapshot(&data).expect("snapshot");
        subscribe(&mut cm, &data, &out, NodeId(2));
        for _ in 0..4 {
            data.bump();
            cm.commit(MASTER, &mut data, &out).expect("commit");
        }
        assert_eq!(cm.version(), 5);
        assert_eq!(cm.oldest_version(), 3);
        out.take();

        cm.add_slave(
            MASTER,
            &data,
            &out,
            NodeId(3),
            SLAVE.instance,
            Subscription::uncached(VERSION_OLDEST),
        )
        .expect("add slave");
        let versions: Vec<_> = out.take().into_iter().map(|(_, p)| p.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn slave_applies_newer_versions_only() {
        let mut cm = ChangeManager::slave(NodeId(1));
        let mut data = Counter::default();
        let payload = |value: u64| {
            let mut os = DataOStream::new();
            os.write(&value).expect("write");
            os.into_bytes()
        };

        let instance = Packet::new(DataType::Object, CommandKind::Instance)
            .with_object(SLAVE.object, SLAVE.instance)
            .with_master_instance(MASTER.instance)
            .with_version(3)
            .with_payload(payload(30));
        assert!(cm.apply(SLAVE, &mut data, &instance).expect("instance"));
        assert_eq!((cm.version(), data.value), (3, 30));
        assert_eq!(cm.master_instance(), Some(MASTER.instance));

        let stale = Packet::new(DataType::Object, CommandKind::Delta)
            .with_version(3)
            .with_payload(payload(99));
        assert!(!cm.apply(SLAVE, &mut data, &stale).expect("stale"));
        assert_eq!(data.value, 30);

        let delta = Packet::new(DataType::Object, CommandKind::Delta)
            .with_version(4)
            .with_payload(payload(40));
        assert!(cm.apply(SLAVE, &mut data, &delta).expect("delta"));
        assert_eq!((cm.version(), data.value), (4, 40));

        let version_only = Packet::new(DataType::Object, CommandKind::Instance).with_version(5);
        assert!(cm.apply(SLAVE, &mut data, &version_only).expect("empty"));
        assert_eq!((cm.version(), data.value), (5, 40));
    }

    #[test]
    fn slave_rejects_data_without_a_real_version() {
        let mut cm = ChangeManager::slave(NodeId(1));
        let mut data = Counter::default();
        let unversioned = Packet::new(DataType::Object, CommandKind::Instance).with_version(VERSION_OLDEST);
        let result = cm.apply(SLAVE, &mut data, &unversioned);
        assert!(matches!(result, Err(Error::ContractViolation(_))));
        assert_eq!(cm.version(), VERSION_NONE);
    }

    #[test]
    fn commit_on_slave_is_a_contract_violation() {
        let mut cm = ChangeManager::slave(NodeId(1));
        let mut data = Counter::default();
        let result = cm.commit(SLAVE, &mut data, &Recorder::default());
        assert!(matches!(result, Err(Error::ContractViolation(_))));
    }
}
