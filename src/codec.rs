//! Encoding of individual records.
//!
//! Records are encoded with `abomonation`, or with `bincode` when the `bincode` feature is on.
//! Chunks frame each encoded record with a little-endian `u32` length.

use crate::error::{CommsError, Result};
use crate::Data;

/// Bytes of the length prefix in front of each record.
pub const LENGTH_PREFIX: usize = 4;

/// Appends the length-prefixed encoding of `record` to `bytes`.
pub fn encode_framed<T: Data>(record: &T, bytes: &mut Vec<u8>) -> Result<()> {
    let start = bytes.len();
    bytes.extend_from_slice(&[0u8; LENGTH_PREFIX]);
    encode(record, bytes)?;
    frame(bytes, start)
}

/// Appends `raw` with a length prefix.
pub fn frame_raw(raw: &[u8], bytes: &mut Vec<u8>) -> Result<()> {
    let start = bytes.len();
    bytes.extend_from_slice(&[0u8; LENGTH_PREFIX]);
    bytes.extend_from_slice(raw);
    frame(bytes, start)
}

fn frame(bytes: &mut Vec<u8>, start: usize) -> Result<()> {
    let length = bytes.len() - start - LENGTH_PREFIX;
    if length > u32::max_value() as usize {
        return Err(CommsError::Codec(format!("record of {} bytes exceeds the frame limit", length)));
    }
    bytes[start .. start + LENGTH_PREFIX].copy_from_slice(&(length as u32).to_le_bytes());
    Ok(())
}

/// Appends the encoding of `record` to `bytes`.
#[cfg(not(feature = "bincode"))]
pub fn encode<T: Data>(record: &T, bytes: &mut Vec<u8>) -> Result<()> {
    unsafe { abomonation::encode(record, bytes) }?;
    Ok(())
}

/// Decodes a record from exactly `bytes`.
#[cfg(not(feature = "bincode"))]
pub fn decode<T: Data>(bytes: &[u8]) -> Result<T> {
    // abomonation reads in place; copy into storage aligned for any record.
    let mut aligned = vec![0u64; (bytes.len() + 7) / 8];
    let scratch = unsafe { ::std::slice::from_raw_parts_mut(aligned.as_mut_ptr() as *mut u8, bytes.len()) };
    scratch.copy_from_slice(bytes);
    match unsafe { abomonation::decode::<T>(scratch) } {
        Some((typed, rest)) if rest.is_empty() => Ok(typed.clone()),
        Some((_, rest)) => Err(CommsError::Codec(format!("{} trailing bytes after record", rest.len()))),
        None => Err(CommsError::Codec(format!("cannot decode record from {} bytes", bytes.len()))),
    }
}

/// Appends the encoding of `record` to `bytes`.
#[cfg(feature = "bincode")]
pub fn encode<T: Data>(record: &T, bytes: &mut Vec<u8>) -> Result<()> {
    ::bincode::serialize_into(bytes, record).map_err(|e| CommsError::Codec(e.to_string()))
}

/// Decodes a record from exactly `bytes`.
#[cfg(feature = "bincode")]
pub fn decode<T: Data>(bytes: &[u8]) -> Result<T> {
    ::bincode::deserialize(bytes).map_err(|e| CommsError::Codec(e.to_string()))
}
