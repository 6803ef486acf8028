//! An in-process fabric connecting simulated workers.
//!
//! Every worker holds a [`LocalTransport`] onto one shared [`LocalFabric`]. Bytes are copied
//! into a buffer the receiver posted, or stashed until one is posted. A link stashing
//! `max_stash` chunks refuses further sends until the receiver catches up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::arc::Bytes;
use crossbeam_channel::{Receiver, Sender};

use super::{ChannelEvent, Inbox, Transport};
use crate::buffer::DataBuffer;
use crate::{EdgeId, WorkerId};

/// Inboxes keyed by (receiving worker, edge, sending worker).
struct Fabric {
    inboxes: HashMap<(WorkerId, EdgeId, WorkerId), Inbox>,
    max_stash: usize,
}

/// The shared medium of a set of in-process workers.
#[derive(Clone)]
pub struct LocalFabric {
    shared: Arc<Mutex<Fabric>>,
}

impl LocalFabric {
    /// A fabric whose links stash at most `max_stash` chunks.
    pub fn new(max_stash: usize) -> Self {
        LocalFabric {
            shared: Arc::new(Mutex::new(Fabric { inboxes: HashMap::new(), max_stash: max_stash.max(1) })),
        }
    }

    /// The transport of `worker`.
    pub fn transport(&self, worker: WorkerId) -> LocalTransport {
        LocalTransport { worker, shared: self.shared.clone() }
    }
}

/// One worker's handle onto a [`LocalFabric`].
#[derive(Clone)]
pub struct LocalTransport {
    worker: WorkerId,
    shared: Arc<Mutex<Fabric>>,
}

impl LocalTransport {
    /// The worker owning this handle.
    pub fn worker(&self) -> WorkerId { self.worker }

    fn fabric(&self) -> MutexGuard<Fabric> {
        self.shared.lock().expect("local fabric mutex poisoned")
    }
}

impl Transport for LocalTransport {
    fn send_message(&mut self, worker: WorkerId, edge: EdgeId, ticket: u64, bytes: &[u8], listener: &Sender<ChannelEvent>) -> bool {
        let from = self.worker;
        let mut fabric = self.fabric();
        let max_stash = fabric.max_stash;
        let inbox = fabric.inboxes.entry((worker, edge, from)).or_insert_with(Inbox::default);
        if !inbox.try_deliver(from, bytes) {
            if inbox.stashed() >= max_stash {
                return false;
            }
            inbox.stash(Bytes::from(bytes.to_vec().into_boxed_slice()));
        }
        // the bytes were copied, so the sender's buffer is free at once.
        listener.send(ChannelEvent::SendComplete { ticket }).is_ok()
    }

    fn receive_message(&mut self, worker: WorkerId, edge: EdgeId, listener: Sender<ChannelEvent>, buffers: Receiver<DataBuffer>) {
        let me = self.worker;
        let mut fabric = self.fabric();
        let inbox = fabric.inboxes.entry((me, edge, worker)).or_insert_with(Inbox::default);
        inbox.register(listener, buffers);
        inbox.flush(worker);
    }

    fn release_buffers(&mut self, worker: WorkerId, edge: EdgeId) {
        let me = self.worker;
        if let Some(inbox) = self.fabric().inboxes.get_mut(&(me, edge, worker)) {
            inbox.deregister();
        }
    }

    fn progress(&mut self) {
        let me = self.worker;
        for (&(to, _edge, from), inbox) in self.fabric().inboxes.iter_mut() {
            if to == me {
                inbox.flush(from);
            }
        }
    }

    fn has_pending(&self, edge: EdgeId) -> bool {
        let me = self.worker;
        self.fabric().inboxes.iter().any(|(&(to, e, _), inbox)| to == me && e == edge && inbox.stashed() > 0)
    }
}
