//! Moving chunk bytes between workers.
//!
//! A transport never touches the state of a channel operation. Filled receive buffers and send
//! acknowledgements travel back as [`ChannelEvent`]s over a channel, which the operation drains
//! at the start of every progress call.

use std::collections::VecDeque;

use bytes::arc::Bytes;
use crossbeam_channel::{Receiver, Sender};

use crate::buffer::DataBuffer;
use crate::error::CommsError;
use crate::{EdgeId, WorkerId};

pub mod frames;
pub mod local;
pub mod network;
pub mod tcp;

pub use self::local::{LocalFabric, LocalTransport};
pub use self::tcp::TcpTransport;

/// Completion reported by a transport.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A posted buffer was filled with a chunk from `worker`.
    Received {
        /// the sending worker.
        worker: WorkerId,
        /// the filled buffer.
        buffer: DataBuffer,
    },
    /// Bytes handed over with `ticket` no longer need their buffer.
    SendComplete {
        /// ticket passed to [`Transport::send_message`].
        ticket: u64,
    },
    /// A chunk from `worker` did not fit the posted buffer, which comes back unfilled.
    Rejected {
        /// the sending worker.
        worker: WorkerId,
        /// the posted buffer.
        buffer: DataBuffer,
        /// why the chunk was refused.
        error: CommsError,
    },
}

/// The capability of moving chunks to and from peer workers.
pub trait Transport {
    /// Allocates a buffer for a pool.
    fn create_buffer(&mut self, capacity: usize) -> DataBuffer {
        DataBuffer::new(capacity)
    }

    /// Offers `bytes` to `worker`; false if the transport cannot take them now.
    ///
    /// Accepted bytes are acknowledged with a [`ChannelEvent::SendComplete`] on `listener`.
    fn send_message(&mut self, worker: WorkerId, edge: EdgeId, ticket: u64, bytes: &[u8], listener: &Sender<ChannelEvent>) -> bool;

    /// Starts receiving chunks of `edge` from `worker` into buffers taken from `buffers`.
    fn receive_message(&mut self, worker: WorkerId, edge: EdgeId, listener: Sender<ChannelEvent>, buffers: Receiver<DataBuffer>);

    /// Stops receiving chunks of `edge` from `worker`.
    fn release_buffers(&mut self, worker: WorkerId, edge: EdgeId);

    /// Moves data that waited for buffers.
    fn progress(&mut self) { }

    /// True while chunks of `edge` wait at this worker for buffers.
    fn has_pending(&self, _edge: EdgeId) -> bool {
        false
    }
}

/// Chunks from one peer on one edge, and where to put them.
#[derive(Default)]
pub(crate) struct Inbox {
    listener: Option<Sender<ChannelEvent>>,
    buffers: Option<Receiver<DataBuffer>>,
    stash: VecDeque<Bytes>,
}

impl Inbox {
    pub(crate) fn register(&mut self, listener: Sender<ChannelEvent>, buffers: Receiver<DataBuffer>) {
        self.listener = Some(listener);
        self.buffers = Some(buffers);
    }

    pub(crate) fn deregister(&mut self) {
        self.listener = None;
        self.buffers = None;
    }

    pub(crate) fn stashed(&self) -> usize {
        self.stash.len()
    }

    /// Places `bytes` directly into a posted buffer when nothing waits ahead of them.
    pub(crate) fn try_deliver(&mut self, from: WorkerId, bytes: &[u8]) -> bool {
        if !self.stash.is_empty() {
            return false;
        }
        match self.take_buffer() {
            Some(buffer) => {
                self.deliver(from, buffer, bytes);
                true
            }
            None => false,
        }
    }

    pub(crate) fn stash(&mut self, bytes: Bytes) {
        self.stash.push_back(bytes);
    }

    /// Moves stashed chunks into posted buffers, in arrival order.
    pub(crate) fn flush(&mut self, from: WorkerId) {
        while !self.stash.is_empty() {
            let buffer = match self.take_buffer() {
                Some(buffer) => buffer,
                None => return,
            };
            if let Some(bytes) = self.stash.pop_front() {
                self.deliver(from, buffer, &bytes[..]);
            }
        }
    }

    fn take_buffer(&mut self) -> Option<DataBuffer> {
        self.listener.as_ref()?;
        self.buffers.as_ref().and_then(|b| b.try_recv().ok())
    }

    fn deliver(&mut self, from: WorkerId, mut buffer: DataBuffer, bytes: &[u8]) {
        let event = if buffer.fill_from(bytes) {
            ChannelEvent::Received { worker: from, buffer }
        }
        else {
            let error = CommsError::OversizedChunk { worker: from, length: bytes.len(), capacity: buffer.capacity() };
            ChannelEvent::Rejected { worker: from, buffer, error }
        };
        let delivered = match self.listener.as_ref() {
            Some(listener) => listener.send(event).is_ok(),
            None => false,
        };
        if !delivered {
            // the operation is gone along with its buffers.
            self.deregister();
        }
    }
}
