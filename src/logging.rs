//! Communication events reported through `timely_logging`.

use crate::header::MessageHeader;

/// Logger of communication events.
pub type CommsLogger = ::logging_core::Logger<CommsEvent, CommsSetup>;

/// Identifies the party that logs.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct CommsSetup {
    /// the logging worker.
    pub worker: usize,
    /// the edge of a channel operation, or the peer of a network thread.
    pub edge: usize,
    /// true for network threads.
    pub network: bool,
}

/// Various communication events.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CommsEvent {
    /// An observed chunk.
    Message(MessageEvent),
    /// Occupancy of a buffer pool.
    Buffer(BufferEvent),
    /// A receive group was admitted.
    Group(GroupEvent),
    /// An operation or thread started or stopped.
    State(StateEvent),
}

/// An observed chunk.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MessageEvent {
    /// true for chunks leaving the worker.
    pub is_send: bool,
    /// the peer worker.
    pub peer: usize,
    /// associated message header.
    pub header: MessageHeader,
}

/// Occupancy of a buffer pool when an operation starts or closes.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct BufferEvent {
    /// true for the receive pool family.
    pub receive: bool,
    /// free buffers.
    pub free: usize,
    /// buffers of the family.
    pub total: usize,
}

/// Admission of a receive group.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct GroupEvent {
    /// index of the admitted group.
    pub group: usize,
    /// completed rotations.
    pub round: usize,
    /// workers in the group.
    pub workers: usize,
}

/// Starting or stopping an operation or a network thread.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct StateEvent {
    /// true for sending threads.
    pub send: bool,
    /// the remote worker, if any.
    pub remote: Option<usize>,
    /// is the party starting or stopping.
    pub start: bool,
}

impl From<MessageEvent> for CommsEvent {
    fn from(v: MessageEvent) -> CommsEvent { CommsEvent::Message(v) }
}
impl From<BufferEvent> for CommsEvent {
    fn from(v: BufferEvent) -> CommsEvent { CommsEvent::Buffer(v) }
}
impl From<GroupEvent> for CommsEvent {
    fn from(v: GroupEvent) -> CommsEvent { CommsEvent::Group(v) }
}
impl From<StateEvent> for CommsEvent {
    fn from(v: StateEvent) -> CommsEvent { CommsEvent::State(v) }
}
