//! Errors raised by channel operations.
//!
//! Backpressure is never an error: operations that cannot make progress return `Ok(false)`.
//! Everything reported through [`CommsError`] breaks an accounting invariant, and a channel
//! operation that observes one refuses further work.

use thiserror::Error;

use crate::{EdgeId, TaskId, WorkerId};

/// Failures of the communication layer.
#[derive(Debug, Error)]
pub enum CommsError {
    /// The task is not a local source of the operation.
    #[error("task {task} is not a local source of this operation")]
    UnknownSource {
        /// offending task.
        task: TaskId,
    },
    /// The task is not a destination of the operation.
    #[error("task {task} is not a destination of this operation")]
    UnknownDestination {
        /// offending task.
        task: TaskId,
    },
    /// The logical plan does not place the task on any worker.
    #[error("task {task} is not placed on any worker")]
    UnplacedTask {
        /// offending task.
        task: TaskId,
    },
    /// A buffer was released into a pool that already holds all of its buffers.
    #[error("released a buffer into the full {pool} pool")]
    BufferPoolOverflow {
        /// name of the pool family.
        pool: &'static str,
    },
    /// A worker delivered a second message within one round of its receive group.
    #[error("worker {worker} delivered twice within receive group {group}")]
    DuplicateGroupReceive {
        /// offending worker.
        worker: WorkerId,
        /// index of the current group.
        group: usize,
    },
    /// A chunk arrived that is larger than the buffers posted for it.
    #[error("chunk of {length} bytes from worker {worker} exceeds the posted buffer of {capacity} bytes")]
    OversizedChunk {
        /// the sending worker.
        worker: WorkerId,
        /// bytes in the chunk.
        length: usize,
        /// capacity of the posted buffer.
        capacity: usize,
    },
    /// A source accumulated more in-flight messages than receive buffers allow.
    #[error("receive queue of task {task} exceeded {limit} messages")]
    ReceiveQueueOverflow {
        /// source task of the queue.
        task: TaskId,
        /// the hard limit.
        limit: usize,
    },
    /// Receive groups do not partition the receiving workers.
    #[error("invalid receive groups: {0}")]
    InvalidGroups(String),
    /// Receive groups may only be installed before the operation starts.
    #[error("receive groups must be configured before the first progress call")]
    GroupsAfterStart,
    /// A chunk could not be interpreted.
    #[error("malformed chunk on edge {edge}: {reason}")]
    MalformedChunk {
        /// edge of the operation.
        edge: EdgeId,
        /// what was wrong.
        reason: String,
    },
    /// A message state machine was asked to move backwards.
    #[error("illegal state transition from {from} to {to}")]
    StateRegression {
        /// current state.
        from: String,
        /// requested state.
        to: String,
    },
    /// An acknowledgement named a chunk with no outstanding sends.
    #[error("no outstanding send for ticket {ticket}")]
    UnknownTicket {
        /// the acknowledged ticket.
        ticket: u64,
    },
    /// The source already queued its end-of-stream marker.
    #[error("task {task} already finished its stream")]
    SourceFinished {
        /// offending task.
        task: TaskId,
    },
    /// Keyed records found no destination.
    #[error("no destination for a keyed record of task {task}")]
    NoDestination {
        /// the sending task.
        task: TaskId,
    },
    /// The operation was closed.
    #[error("operation is closed")]
    Closed,
    /// The operation observed a fatal error earlier.
    #[error("operation aborted after a fatal error")]
    Aborted,
    /// Record encoding or decoding failed.
    #[error("codec failure: {0}")]
    Codec(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CommsError {
    /// Builds a [`CommsError::MalformedChunk`].
    pub fn malformed<S: Into<String>>(edge: EdgeId, reason: S) -> Self {
        CommsError::MalformedChunk { edge, reason: reason.into() }
    }

    /// True for errors that leave the operation unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            CommsError::Closed | CommsError::Aborted | CommsError::GroupsAfterStart | CommsError::SourceFinished { .. } => false,
            _ => true,
        }
    }
}

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, CommsError>;
