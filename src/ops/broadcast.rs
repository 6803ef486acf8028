//! One source sending to every destination.

use crate::error::{CommsError, Result};
use crate::message::Payload;
use crate::operation::ChannelOperation;
use crate::receiver::MessageReceiver;
use crate::routing::Destination;
use crate::transport::Transport;
use crate::{Data, TaskId};

use super::Collective;

/// Replicates the messages of one root task to every destination.
///
/// Each chunk is built once and handed to every destination worker.
pub struct Broadcast<T: Data, X: Transport, R: MessageReceiver<T>> {
    collective: Collective<T, X, R>,
    root: TaskId,
}

impl<T: Data, X: Transport, R: MessageReceiver<T>> Broadcast<T, X, R> {
    /// A broadcast from `root`, which must be the only source of `operation`.
    pub fn new(operation: ChannelOperation<T, X, R>, root: TaskId) -> Result<Self> {
        if operation.routing().sources() != &[root][..] {
            return Err(CommsError::UnknownSource { task: root });
        }
        Ok(Broadcast { collective: Collective::new(operation), root })
    }

    /// The broadcasting task.
    pub fn root(&self) -> TaskId { self.root }

    /// Sends `records` to every destination; only the root's worker may call this.
    pub fn broadcast(&mut self, records: Vec<T>) -> Result<bool> {
        self.collective.submit(self.root, Destination::All, Payload::Records(records), 0)
    }

    /// Sends a synchronisation barrier to every destination.
    pub fn barrier(&mut self, bytes: Vec<u8>) -> Result<bool> {
        self.collective.barrier(self.root, bytes)
    }

    /// Ends the stream of the root; only the root's worker may call this.
    pub fn finish(&mut self) -> Result<()> { self.collective.finish(self.root) }
    /// Performs one step; true while work remains.
    pub fn progress(&mut self) -> Result<bool> { self.collective.progress() }
    /// True once the stream ended and nothing is in flight.
    pub fn is_complete(&self) -> bool { self.collective.is_complete() }
    /// Closes the operation.
    pub fn close(&mut self) -> Result<()> { self.collective.close() }
    /// The wrapped collective.
    pub fn collective(&self) -> &Collective<T, X, R> { &self.collective }
}
