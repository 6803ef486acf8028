//! Rebuilding incoming messages from chunks.

use crate::buffer::DataBuffer;
use crate::codec::{self, LENGTH_PREFIX};
use crate::error::{CommsError, Result};
use crate::header::MessageHeader;
use crate::message::{InMessage, Payload, ReceivedState};
use crate::{Data, EdgeId};

/// Unpacks the chunks of an [`InMessage`] as they arrive.
///
/// Records split across chunks are carried over; a message is built once as many records were
/// unpacked as its header announced.
#[derive(Debug)]
pub struct MessageDeserializer {
    edge: EdgeId,
}

impl MessageDeserializer {
    /// A deserializer for chunks of `edge`.
    pub fn new(edge: EdgeId) -> Self {
        MessageDeserializer { edge }
    }

    /// Reads and checks the header of a filled buffer.
    pub fn build_header(&self, buffer: &DataBuffer) -> Result<MessageHeader> {
        let header = MessageHeader::try_read(buffer.as_slice())
            .ok_or_else(|| CommsError::malformed(self.edge, format!("{} bytes do not hold a chunk", buffer.size())))?;
        if header.required_bytes() != buffer.size() {
            return Err(CommsError::malformed(self.edge, format!("chunk of {} bytes in a buffer of {}", header.required_bytes(), buffer.size())));
        }
        if header.edge as EdgeId != self.edge || header.edge < 0 {
            return Err(CommsError::malformed(self.edge, format!("chunk of edge {}", header.edge)));
        }
        if header.source < 0 {
            return Err(CommsError::malformed(self.edge, "negative source"));
        }
        Ok(header)
    }

    /// Unpacks every chunk that arrived for `message` since the last call.
    pub fn build<T: Data>(&mut self, message: &mut InMessage<T>) -> Result<()> {
        if message.state() >= ReceivedState::Built {
            return Ok(());
        }
        let expected = message.header().expected_records();
        while let Some(chunk) = message.pending.pop_front() {
            message.set_state(ReceivedState::Building)?;
            let mut bytes = chunk.payload();
            while !bytes.is_empty() {
                let wanted = match message.partial_length {
                    None => LENGTH_PREFIX - message.partial.len(),
                    Some(length) => length - message.partial.len(),
                };
                let take = wanted.min(bytes.len());
                message.partial.extend_from_slice(&bytes[..take]);
                bytes = &bytes[take..];

                if message.partial_length.is_none() {
                    if message.partial.len() == LENGTH_PREFIX {
                        let prefix = [message.partial[0], message.partial[1], message.partial[2], message.partial[3]];
                        message.partial_length = Some(u32::from_le_bytes(prefix) as usize);
                        message.partial.clear();
                    }
                    else {
                        continue;
                    }
                }
                if message.partial_length == Some(message.partial.len()) {
                    if message.unpacked >= expected {
                        return Err(CommsError::malformed(self.edge, format!("more than {} records", expected)));
                    }
                    if message.is_raw() {
                        message.raw_bytes = Some(::std::mem::replace(&mut message.partial, Vec::new()));
                    }
                    else {
                        let record = codec::decode::<T>(&message.partial)?;
                        message.records.push(record);
                        message.partial.clear();
                    }
                    message.partial_length = None;
                    message.unpacked += 1;
                }
            }
            message.built.push_back(chunk);
        }

        if message.is_arrived() && message.pending.is_empty() {
            if message.unpacked != expected || message.partial_length.is_some() || !message.partial.is_empty() {
                return Err(CommsError::malformed(self.edge, format!("{} of {} records unpacked", message.unpacked, expected)));
            }
            let payload = if message.is_raw() {
                Payload::Raw(message.raw_bytes.take().unwrap_or_default())
            }
            else if message.header().number_of_records < 0 {
                match message.records.pop() {
                    Some(record) => Payload::Single(record),
                    None => return Err(CommsError::malformed(self.edge, "single message without a record")),
                }
            }
            else {
                Payload::Records(::std::mem::replace(&mut message.records, Vec::new()))
            };
            message.complete(payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::header::{flags, HEADER_SIZE};
    use crate::message::{ChannelMessage, OutMessage};
    use crate::routing::{Destination, RoutingParameters};
    use crate::serializer::MessageSerializer;

    fn chunks_of<T: Data>(payload: Payload<T>, flags: u32, size: usize) -> Vec<ChannelMessage> {
        let routing = RoutingParameters { internal_routes: vec![], external_routes: vec![1], destination: Destination::All };
        let mut out = OutMessage::new(4, routing, payload, flags);
        let mut pool = BufferPool::with_buffers("send", (0..64).map(|_| DataBuffer::new(size)).collect());
        let mut serializer = MessageSerializer::new(1, 0, false);
        let mut chunks = Vec::new();
        while let Some(chunk) = serializer.build(&mut out, &mut pool).unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    fn rebuild<T: Data>(chunks: Vec<ChannelMessage>) -> InMessage<T> {
        let mut deserializer = MessageDeserializer::new(1);
        let first = *chunks[0].header();
        let mut message = InMessage::new(0, first, first.has_flag(flags::SYNC_BARRIER), vec![9]);
        for chunk in chunks {
            let buffer = chunk.into_buffer();
            let header = deserializer.build_header(&buffer).unwrap();
            let arrived = message.add_buffer_and_calculate(ChannelMessage::incoming(header, buffer, 0)).unwrap();
            deserializer.build(&mut message).unwrap();
            assert_eq!(arrived, message.state() == ReceivedState::Built);
        }
        message
    }

    #[test]
    fn rebuilds_records_split_across_chunks() {
        let records: Vec<(u64, String)> = (0..20).map(|i| (i, "y".repeat(i as usize * 3))).collect();
        let message = rebuild::<(u64, String)>(chunks_of(Payload::Records(records.clone()), 0, HEADER_SIZE + 24));
        assert_eq!(message.payload(), Some(&Payload::Records(records)));
        assert!(message.held_buffers() > 20);
    }

    #[test]
    fn single_and_empty_messages() {
        let single = rebuild::<String>(chunks_of(Payload::Single("z".repeat(70)), 0, 48));
        assert_eq!(single.payload(), Some(&Payload::Single("z".repeat(70))));

        let empty = rebuild::<u64>(chunks_of(Payload::<u64>::Records(vec![]), flags::LAST, 48));
        assert_eq!(empty.payload(), Some(&Payload::Records(vec![])));
    }

    #[test]
    fn barriers_stay_raw() {
        let raw = rebuild::<u64>(chunks_of::<u64>(Payload::Raw(vec![1, 2, 3, 4, 5, 6, 7]), flags::SYNC_BARRIER, 40));
        assert_eq!(raw.payload(), Some(&Payload::Raw(vec![1, 2, 3, 4, 5, 6, 7])));
    }

    #[test]
    fn rejects_foreign_edges() {
        let chunks = chunks_of(Payload::Single(1u64), 0, 64);
        let deserializer = MessageDeserializer::new(2);
        let buffer = chunks.into_iter().next().unwrap().into_buffer();
        assert!(deserializer.build_header(&buffer).is_err());
    }
}
