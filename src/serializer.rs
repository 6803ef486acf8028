//! Writing outgoing messages into chunks.

use crate::buffer::BufferPool;
use crate::codec;
use crate::error::Result;
use crate::header::{flags, MessageHeader, HEADER_SIZE};
use crate::message::{ChannelMessage, OutMessage, Payload, SendState};
use crate::{Data, EdgeId, WorkerId};

/// Streams the records of an [`OutMessage`] into pooled buffers, one chunk per call.
///
/// Each record is framed with a `u32` length and may span several chunks. Only the record being
/// written is held in encoded form.
#[derive(Debug)]
pub struct MessageSerializer {
    edge: EdgeId,
    worker: WorkerId,
    keyed: bool,
}

impl MessageSerializer {
    /// A serializer for chunks of `edge` built on `worker`.
    pub fn new(edge: EdgeId, worker: WorkerId, keyed: bool) -> Self {
        MessageSerializer { edge, worker, keyed }
    }

    /// True if chunks are flagged as keyed.
    pub fn is_keyed(&self) -> bool { self.keyed }

    /// Builds the next chunk of `message`.
    ///
    /// Returns `None` when the message is fully serialized or no buffer is free.
    pub fn build<T: Data>(&mut self, message: &mut OutMessage<T>, pool: &mut BufferPool) -> Result<Option<ChannelMessage>> {
        if message.serialization_done() {
            return Ok(None);
        }
        let mut buffer = match pool.acquire() {
            Some(buffer) => buffer,
            None => return Ok(None),
        };
        buffer.set_size(HEADER_SIZE);

        let frames = message.payload().frames();
        let mut completed = 0u32;
        while buffer.remaining() > 0 {
            if message.staged_offset == message.staged.len() {
                if message.cursor >= frames {
                    break;
                }
                message.staged.clear();
                message.staged_offset = 0;
                stage(message)?;
            }
            let written = buffer.write(&message.staged[message.staged_offset..]);
            message.staged_offset += written;
            if message.staged_offset == message.staged.len() {
                message.staged.clear();
                message.staged_offset = 0;
                message.cursor += 1;
                completed += 1;
            }
        }

        let mut flags = message.flags();
        if self.keyed {
            flags |= flags::KEYED;
        }
        let header = MessageHeader {
            source: message.source() as i32,
            destination: message.routing().header_destination(),
            edge: self.edge as i32,
            flags,
            number_of_records: message.payload().record_count(),
            length: (buffer.size() - HEADER_SIZE) as u32,
            completed_records: completed,
            seqno: message.chunks_built,
        };
        header.write_into(buffer.as_mut_slice());
        message.chunks_built += 1;

        let next = if message.serialization_done() { SendState::Serialized } else { SendState::PartiallySerialized };
        message.set_state(next)?;
        Ok(Some(ChannelMessage::outgoing(header, buffer, self.worker)))
    }
}

/// Encodes the frame at the cursor into `staged`.
fn stage<T: Data>(message: &mut OutMessage<T>) -> Result<()> {
    let cursor = message.cursor;
    let mut staged = ::std::mem::replace(&mut message.staged, Vec::new());
    let result = match message.payload() {
        Payload::Single(record) => codec::encode_framed(record, &mut staged),
        Payload::Records(records) => codec::encode_framed(&records[cursor], &mut staged),
        Payload::Raw(bytes) => codec::frame_raw(bytes, &mut staged),
    };
    message.staged = staged;
    result
}
