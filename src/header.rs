//! Wire header at the front of every chunk.

use std::convert::TryInto;

use crate::TaskId;

/// Number of bytes a header occupies on the wire.
pub const HEADER_SIZE: usize = 32;

/// Destination value addressing every destination hosted by the receiving worker.
pub const ALL_DESTINATIONS: i32 = -1;

/// Record count of a message carrying one non-enumerable object.
pub const SINGLE_MESSAGE: i32 = -1;

/// Header flags.
pub mod flags {
    /// The sender will send no further messages on this edge.
    pub const LAST: u32 = 1;
    /// The payload is raw bytes, whatever the type of the edge.
    pub const SYNC_BARRIER: u32 = 1 << 1;
    /// Records are key/value pairs.
    pub const KEYED: u32 = 1 << 2;
}

/// Framing information of one chunk.
///
/// Message boundaries are found by accounting `completed_records` of consecutive chunks
/// against `number_of_records`, never from a total payload length.
#[derive(Abomonation, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MessageHeader {
    /// task sending the message.
    pub source: i32,
    /// task receiving the message, or [`ALL_DESTINATIONS`].
    pub destination: i32,
    /// edge the message travels on; -1 marks a connection shutdown.
    pub edge: i32,
    /// bitmask of [`flags`].
    pub flags: u32,
    /// records in the whole message, or [`SINGLE_MESSAGE`].
    pub number_of_records: i32,
    /// payload bytes in this chunk.
    pub length: u32,
    /// records whose last byte lies in this chunk.
    pub completed_records: u32,
    /// position of the chunk within its message.
    pub seqno: u32,
}

impl MessageHeader {
    /// Returns a header when there is enough supporting data
    #[inline]
    pub fn try_read(bytes: &[u8]) -> Option<MessageHeader> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let header = MessageHeader {
            source: i32::from_le_bytes(word(bytes, 0)),
            destination: i32::from_le_bytes(word(bytes, 1)),
            edge: i32::from_le_bytes(word(bytes, 2)),
            flags: u32::from_le_bytes(word(bytes, 3)),
            number_of_records: i32::from_le_bytes(word(bytes, 4)),
            length: u32::from_le_bytes(word(bytes, 5)),
            completed_records: u32::from_le_bytes(word(bytes, 6)),
            seqno: u32::from_le_bytes(word(bytes, 7)),
        };
        if bytes.len() - HEADER_SIZE >= header.length as usize {
            Some(header)
        }
        else {
            None
        }
    }

    /// Writes the header as binary data.
    #[inline]
    pub fn write_to<W: ::std::io::Write>(&self, writer: &mut W) -> ::std::io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Writes the header over the first [`HEADER_SIZE`] bytes of `bytes`.
    #[inline]
    pub fn write_into(&self, bytes: &mut [u8]) {
        bytes[..HEADER_SIZE].copy_from_slice(&self.to_bytes());
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let words = [
            self.source.to_le_bytes(),
            self.destination.to_le_bytes(),
            self.edge.to_le_bytes(),
            self.flags.to_le_bytes(),
            self.number_of_records.to_le_bytes(),
            self.length.to_le_bytes(),
            self.completed_records.to_le_bytes(),
            self.seqno.to_le_bytes(),
        ];
        for (index, word) in words.iter().enumerate() {
            bytes[4 * index .. 4 * index + 4].copy_from_slice(word);
        }
        bytes
    }

    /// The number of bytes required for the header and data.
    #[inline]
    pub fn required_bytes(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }

    /// The header closing a network connection.
    pub fn shutdown() -> Self {
        MessageHeader {
            source: 0,
            destination: 0,
            edge: -1,
            flags: 0,
            number_of_records: 0,
            length: 0,
            completed_records: 0,
            seqno: 0,
        }
    }

    /// True for the connection shutdown header.
    pub fn is_shutdown(&self) -> bool {
        self.edge < 0
    }

    /// Tests a flag.
    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// The addressed task, `None` for every local destination.
    pub fn destination_task(&self) -> Option<TaskId> {
        if self.destination < 0 { None } else { Some(self.destination as TaskId) }
    }

    /// Records to account for before the message is complete.
    pub fn expected_records(&self) -> usize {
        self.number_of_records.unsigned_abs() as usize
    }
}

fn word(bytes: &[u8], index: usize) -> [u8; 4] {
    // bounds were checked against HEADER_SIZE by the caller.
    bytes[4 * index .. 4 * index + 4].try_into().unwrap_or([0u8; 4])
}
