//! Message envelopes moving through a channel operation.
//!
//! An [`OutMessage`] is one logical send, an [`InMessage`] one logical message being rebuilt
//! from the chunks that arrive for it, and a [`ChannelMessage`] one wire chunk held in a
//! [`DataBuffer`]. Both envelopes carry a forward-only state machine.

use std::collections::VecDeque;
use std::fmt;

use crate::buffer::DataBuffer;
use crate::error::{CommsError, Result};
use crate::header::{MessageHeader, HEADER_SIZE, SINGLE_MESSAGE};
use crate::routing::RoutingParameters;
use crate::{TaskId, WorkerId};

/// The object model of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<T> {
    /// One non-enumerable object.
    Single(T),
    /// An enumeration of records, possibly empty.
    Records(Vec<T>),
    /// Raw bytes carried by a synchronisation barrier.
    Raw(Vec<u8>),
}

impl<T> Payload<T> {
    /// The record count announced in headers.
    pub fn record_count(&self) -> i32 {
        match self {
            Payload::Records(records) => records.len() as i32,
            _ => SINGLE_MESSAGE,
        }
    }

    /// Number of length-prefixed frames the payload occupies on the wire.
    pub fn frames(&self) -> usize {
        match self {
            Payload::Records(records) => records.len(),
            _ => 1,
        }
    }

    /// The records of the payload, as a slice.
    pub fn records(&self) -> &[T] {
        match self {
            Payload::Single(record) => ::std::slice::from_ref(record),
            Payload::Records(records) => &records[..],
            Payload::Raw(_) => &[],
        }
    }
}

/// Progress of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SendState {
    /// Accepted into a send queue.
    Init,
    /// Delivered to every internal route.
    SentInternally,
    /// Some chunks are built.
    PartiallySerialized,
    /// Every chunk is built.
    Serialized,
    /// Every chunk was accepted by every external route.
    Sent,
}

/// Progress of an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReceivedState {
    /// Chunks are arriving.
    Init,
    /// Records are being unpacked.
    Building,
    /// Every record is unpacked.
    Built,
    /// Every chunk was handed over; the payload awaits delivery.
    Receive,
    /// Delivered to every target.
    Done,
}

fn transition<S: Ord + Copy + fmt::Debug>(state: &mut S, next: S) -> Result<()> {
    if next < *state {
        return Err(CommsError::StateRegression {
            from: format!("{:?}", state),
            to: format!("{:?}", next),
        });
    }
    *state = next;
    Ok(())
}

impl SendState {
    /// Moves to `next`, which may not precede the current state.
    pub fn advance(&mut self, next: SendState) -> Result<()> { transition(self, next) }
}

impl ReceivedState {
    /// Moves to `next`, which may not precede the current state.
    pub fn advance(&mut self, next: ReceivedState) -> Result<()> { transition(self, next) }
}

/// Whether a chunk is leaving or arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Built by this worker for external routes.
    Out,
    /// Received from a peer worker.
    In,
}

/// One wire chunk: a header and payload bytes in a pooled buffer.
#[derive(Debug)]
pub struct ChannelMessage {
    header: MessageHeader,
    buffer: DataBuffer,
    direction: Direction,
    worker: WorkerId,
    /// outstanding acknowledgements before the buffer may be released.
    pub ref_count: usize,
    /// external routes that accepted this chunk.
    pub accepted_external_sends: usize,
    /// true once `ref_count` accounts for every external route.
    pub out_count_updated: bool,
}

impl ChannelMessage {
    /// A chunk built by this worker.
    pub fn outgoing(header: MessageHeader, buffer: DataBuffer, worker: WorkerId) -> Self {
        ChannelMessage {
            header,
            buffer,
            direction: Direction::Out,
            worker,
            ref_count: 0,
            accepted_external_sends: 0,
            out_count_updated: false,
        }
    }

    /// A chunk that arrived from `worker`.
    pub fn incoming(header: MessageHeader, buffer: DataBuffer, worker: WorkerId) -> Self {
        ChannelMessage {
            header,
            buffer,
            direction: Direction::In,
            worker,
            ref_count: 0,
            accepted_external_sends: 0,
            out_count_updated: false,
        }
    }

    /// The chunk header.
    pub fn header(&self) -> &MessageHeader { &self.header }
    /// Leaving or arriving.
    pub fn direction(&self) -> Direction { self.direction }
    /// The worker that built the chunk.
    pub fn worker(&self) -> WorkerId { self.worker }
    /// Header and payload as they travel on the wire.
    pub fn bytes(&self) -> &[u8] { self.buffer.as_slice() }
    /// Payload bytes following the header.
    pub fn payload(&self) -> &[u8] { &self.buffer.as_slice()[HEADER_SIZE..] }
    /// Surrenders the buffer.
    pub fn into_buffer(self) -> DataBuffer { self.buffer }
}

/// One logical send.
#[derive(Debug)]
pub struct OutMessage<T> {
    source: TaskId,
    routing: RoutingParameters,
    flags: u32,
    payload: Payload<T>,
    state: SendState,
    /// internal routes that accepted the payload, in route order.
    pub(crate) accepted_internal: usize,
    /// tickets of built chunks not yet accepted by every external route.
    pub(crate) tickets: VecDeque<u64>,
    /// index of the next frame to stage.
    pub(crate) cursor: usize,
    /// the framed record currently being written out.
    pub(crate) staged: Vec<u8>,
    /// bytes of `staged` already written.
    pub(crate) staged_offset: usize,
    /// chunks built so far.
    pub(crate) chunks_built: u32,
}

impl<T> OutMessage<T> {
    /// A message from `source` along `routing`.
    pub fn new(source: TaskId, routing: RoutingParameters, payload: Payload<T>, flags: u32) -> Self {
        OutMessage {
            source,
            routing,
            flags,
            payload,
            state: SendState::Init,
            accepted_internal: 0,
            tickets: VecDeque::new(),
            cursor: 0,
            staged: Vec::new(),
            staged_offset: 0,
            chunks_built: 0,
        }
    }

    /// The sending task.
    pub fn source(&self) -> TaskId { self.source }
    /// Routes of the message.
    pub fn routing(&self) -> &RoutingParameters { &self.routing }
    /// Header flags.
    pub fn flags(&self) -> u32 { self.flags }
    /// The object being sent.
    pub fn payload(&self) -> &Payload<T> { &self.payload }
    /// Current state.
    pub fn state(&self) -> SendState { self.state }
    /// Moves the state forward.
    pub fn set_state(&mut self, next: SendState) -> Result<()> { self.state.advance(next) }

    /// True once every frame has been written into chunks.
    pub fn serialization_done(&self) -> bool {
        self.chunks_built > 0 && self.cursor >= self.payload.frames() && self.staged.is_empty()
    }
}

/// One logical message being rebuilt.
#[derive(Debug)]
pub struct InMessage<T> {
    worker: WorkerId,
    header: MessageHeader,
    raw: bool,
    state: ReceivedState,
    arrived_records: usize,
    arrived: bool,
    next_seqno: u32,
    /// chunks awaiting unpacking.
    pub(crate) pending: VecDeque<ChannelMessage>,
    /// unpacked chunks awaiting hand-off.
    pub(crate) built: VecDeque<ChannelMessage>,
    /// records unpacked so far.
    pub(crate) unpacked: usize,
    /// bytes of a record split across chunks.
    pub(crate) partial: Vec<u8>,
    /// length of the record in `partial`, once its prefix is complete.
    pub(crate) partial_length: Option<usize>,
    pub(crate) records: Vec<T>,
    pub(crate) raw_bytes: Option<Vec<u8>>,
    payload: Option<Payload<T>>,
    targets: Vec<TaskId>,
    /// targets that accepted the payload, in order.
    pub(crate) delivered: usize,
}

impl<T> InMessage<T> {
    /// An empty message from `worker` described by the header of its first chunk.
    pub fn new(worker: WorkerId, header: MessageHeader, raw: bool, targets: Vec<TaskId>) -> Self {
        InMessage {
            worker,
            header,
            raw,
            state: ReceivedState::Init,
            arrived_records: 0,
            arrived: false,
            next_seqno: 0,
            pending: VecDeque::new(),
            built: VecDeque::new(),
            unpacked: 0,
            partial: Vec::new(),
            partial_length: None,
            records: Vec::new(),
            raw_bytes: None,
            payload: None,
            targets,
            delivered: 0,
        }
    }

    /// The worker the chunks come from.
    pub fn worker(&self) -> WorkerId { self.worker }
    /// Header of the first chunk.
    pub fn header(&self) -> &MessageHeader { &self.header }
    /// True for synchronisation barriers.
    pub fn is_raw(&self) -> bool { self.raw }
    /// Current state.
    pub fn state(&self) -> ReceivedState { self.state }
    /// Moves the state forward.
    pub fn set_state(&mut self, next: ReceivedState) -> Result<()> { self.state.advance(next) }
    /// True once every chunk has arrived.
    pub fn is_arrived(&self) -> bool { self.arrived }
    /// Tasks the payload is delivered to.
    pub fn targets(&self) -> &[TaskId] { &self.targets }
    /// The rebuilt payload, once built.
    pub fn payload(&self) -> Option<&Payload<T>> { self.payload.as_ref() }
    /// Buffers held by the message.
    pub fn held_buffers(&self) -> usize { self.pending.len() + self.built.len() }

    /// Appends a chunk, returning true once the whole message has arrived.
    pub fn add_buffer_and_calculate(&mut self, chunk: ChannelMessage) -> Result<bool> {
        let edge = self.header.edge as usize;
        let header = *chunk.header();
        if self.arrived {
            return Err(CommsError::malformed(edge, "chunk after the message completed"));
        }
        if header.source != self.header.source || header.number_of_records != self.header.number_of_records {
            return Err(CommsError::malformed(edge, "chunk does not belong to the message"));
        }
        if header.seqno != self.next_seqno {
            return Err(CommsError::malformed(edge, format!("expected chunk {} found {}", self.next_seqno, header.seqno)));
        }
        self.next_seqno += 1;
        self.arrived_records += header.completed_records as usize;
        let expected = self.header.expected_records();
        if self.arrived_records > expected {
            return Err(CommsError::malformed(edge, format!("{} records announced, {} arrived", expected, self.arrived_records)));
        }
        self.pending.push_back(chunk);
        self.arrived = self.arrived_records == expected;
        Ok(self.arrived)
    }

    /// Stores the rebuilt payload.
    pub(crate) fn complete(&mut self, payload: Payload<T>) -> Result<()> {
        self.payload = Some(payload);
        self.set_state(ReceivedState::Built)
    }
}
