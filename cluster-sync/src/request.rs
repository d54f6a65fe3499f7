//! Correlation of asynchronous completions.
//!
//! A caller registers a request, ships the id inside a packet and blocks on
//! the returned [`PendingRequest`]. Whichever thread handles the reply serves
//! the id with the resulting version.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{NodeId, RequestId, Version};

#[derive(Clone, Default)]
pub struct Requests {
    inner: Arc<Mutex<RequestTable>>,
}

#[derive(Default)]
struct RequestTable {
    next_id: RequestId,
    pending: HashMap<RequestId, Waiter>,
}

struct Waiter {
    /// Node expected to answer, if the answer comes from a peer.
    node: Option<NodeId>,
    tx: Sender<Result<Version>>,
}

impl Requests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request answered on this node.
    pub fn register(&self) -> PendingRequest {
        self.insert(None)
    }

    /// Registers a request answered by `node`. It fails if that node is lost
    /// first, see [`Requests::fail_node`].
    pub fn register_for(&self, node: NodeId) -> PendingRequest {
        self.insert(Some(node))
    }

    fn insert(&self, node: Option<NodeId>) -> PendingRequest {
        let (tx, rx) = bounded(1);
        let mut table = self.inner.lock();
        // Id 0 means "no request" on the wire.
        table.next_id = table.next_id.wrapping_add(1).max(1);
        let id = table.next_id;
        table.pending.insert(id, Waiter { node, tx });
        PendingRequest { id, rx }
    }

    /// Completes request `id`. Returns false if nobody was waiting for it.
    pub fn serve(&self, id: RequestId, version: Version) -> bool {
        self.complete(id, Ok(version))
    }

    /// Completes request `id` with an error.
    pub fn fail(&self, id: RequestId, err: Error) -> bool {
        self.complete(id, Err(err))
    }

    fn complete(&self, id: RequestId, result: Result<Version>) -> bool {
        let Some(waiter) = self.inner.lock().pending.remove(&id) else {
            debug!(request = id, "served unknown request");
            return false;
        };
        waiter.tx.send(result).is_ok()
    }

    /// Fails every request waiting on `node` with [`Error::NotConnected`].
    /// Returns how many were failed.
    pub fn fail_node(&self, node: NodeId) -> usize {
        let failed: Vec<Waiter> = {
            let mut table = self.inner.lock();
            let ids: Vec<RequestId> = table
                .pending
                .iter()
                .filter(|(_, waiter)| waiter.node == Some(node))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| table.pending.remove(id)).collect()
        };
        for waiter in &failed {
            let _ = waiter.tx.send(Err(Error::NotConnected(node)));
        }
        failed.len()
    }

    /// Wakes every waiter with [`Error::RequestAbandoned`].
    pub fn abandon_all(&self) {
        let abandoned: Vec<_> = self.inner.lock().pending.drain().collect();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning pending requests");
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// The waiting side of one registered request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    rx: Receiver<Result<Version>>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Blocks until the request is served. `None` waits indefinitely.
    pub fn wait(self, timeout: Option<Duration>) -> Result<Version> {
        match timeout {
            None => self.rx.recv().map_err(|_| Error::RequestAbandoned(self.id))?,
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                    "waiting {timeout:?} for request {}",
                    self.id
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(Error::RequestAbandoned(self.id)),
            },
        }
    }

    pub fn is_served(&self) -> bool {
        !self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::types::ObjectId;

    #[test]
    fn serve_completes_the_matching_request() {
        let requests = Requests::new();
        let first = requests.register();
        let second = requests.register();
        assert_ne!(first.id(), second.id());

        let server = {
            let requests = requests.clone();
            let id = second.id();
            thread::spawn(move || requests.serve(id, 7))
        };
        assert_eq!(second.wait(Some(Duration::from_secs(5))).expect("served"), 7);
        assert!(server.join().expect("server thread"));
        assert_eq!(requests.pending(), 1);
        assert!(!first.is_served());
    }

    #[test]
    fn failed_request_returns_the_error() {
        let requests = Requests::new();
        let pending = requests.register();
        assert!(requests.fail(pending.id(), Error::UnknownObject(ObjectId(3))));
        assert!(matches!(pending.wait(None), Err(Error::UnknownObject(ObjectId(3)))));
    }

    #[test]
    fn unknown_request_is_ignored() {
        let requests = Requests::new();
        assert!(!requests.serve(42, 1));
    }

    #[test]
    fn abandoned_request_fails_the_waiter() {
        let requests = Requests::new();
        let pending = requests.register();
        let id = pending.id();
        requests.abandon_all();
        assert!(matches!(pending.wait(None), Err(Error::RequestAbandoned(got)) if got == id));
    }

    #[test]
    fn losing_a_node_fails_only_its_requests() {
        let requests = Requests::new();
        let remote = requests.register_for(NodeId(4));
        let other = requests.register_for(NodeId(5));
        let local = requests.register();

        assert_eq!(requests.fail_node(NodeId(4)), 1);
        assert!(matches!(remote.wait(None), Err(Error::NotConnected(NodeId(4)))));
        assert!(!other.is_served());
        assert!(!local.is_served());
        assert_eq!(requests.pending(), 2);
    }

    #[test]
    fn wait_times_out() {
        let requests = Requests::new();
        let pending = requests.register();
        assert!(matches!(
            pending.wait(Some(Duration::from_millis(10))),
            Err(Error::Timeout(_))
        ));
    }
}
