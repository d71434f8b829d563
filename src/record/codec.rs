//! Binary framing for log batches.
//!
//! A batch is the unit the sequencer hands to `LogStorage`: a sequence of
//! frames, one per entry, little-endian:
//!
//! ```text
//! u32 frame_length | i64 position | i64 source_position | i64 key
//! u8 record_type | u8 value_type | u8 intent
//! u32 metadata_length | metadata (JSON, empty when default)
//! u32 payload_length | payload
//! ```
//!
//! `frame_length` counts the bytes after itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Intent, LogAppendEntry, LogEntry, RecordMetadata, RecordType, ValueType};

/// Fixed bytes per frame, excluding metadata and payload.
pub const ENTRY_HEADER_LENGTH: usize = 4 + 8 * 3 + 3 + 4 + 4;

/// Errors decoding or encoding a batch.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Batch truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: u8 },

    #[error("Metadata encoding failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Encode entries as one batch, assigning positions from `first_position`.
pub fn encode_batch(
    first_position: i64,
    source_position: i64,
    entries: &[LogAppendEntry],
) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(
        entries
            .iter()
            .map(LogAppendEntry::approximate_length)
            .sum::<usize>(),
    );

    for (offset, entry) in entries.iter().enumerate() {
        let metadata = if entry.metadata.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&entry.metadata)?
        };
        let frame_length = ENTRY_HEADER_LENGTH - 4 + metadata.len() + entry.payload.len();

        buf.put_u32_le(frame_length as u32);
        buf.put_i64_le(first_position + offset as i64);
        buf.put_i64_le(source_position);
        buf.put_i64_le(entry.key);
        buf.put_u8(entry.record_type.code());
        buf.put_u8(entry.value_type.code());
        buf.put_u8(entry.intent.code());
        buf.put_u32_le(metadata.len() as u32);
        buf.put_slice(&metadata);
        buf.put_u32_le(entry.payload.len() as u32);
        buf.put_slice(&entry.payload);
    }

    Ok(buf.freeze())
}

/// Decode every entry of a batch.
pub fn decode_batch(data: &Bytes) -> Result<Vec<LogEntry>, CodecError> {
    let mut buf = data.clone();
    let mut entries = Vec::new();

    while buf.has_remaining() {
        ensure(&buf, 4)?;
        let frame_length = buf.get_u32_le() as usize;
        ensure(&buf, frame_length)?;
        let mut frame = buf.split_to(frame_length);
        entries.push(decode_frame(&mut frame)?);
    }

    Ok(entries)
}

fn decode_frame(frame: &mut Bytes) -> Result<LogEntry, CodecError> {
    ensure(frame, ENTRY_HEADER_LENGTH - 8)?;
    let position = frame.get_i64_le();
    let source_position = frame.get_i64_le();
    let key = frame.get_i64_le();

    let record_type_code = frame.get_u8();
    let record_type = RecordType::from_code(record_type_code).ok_or(CodecError::UnknownCode {
        field: "record_type",
        code: record_type_code,
    })?;
    let value_type_code = frame.get_u8();
    let value_type = ValueType::from_code(value_type_code).ok_or(CodecError::UnknownCode {
        field: "value_type",
        code: value_type_code,
    })?;
    let intent_code = frame.get_u8();
    let intent = Intent::from_code(value_type, intent_code).ok_or(CodecError::UnknownCode {
        field: "intent",
        code: intent_code,
    })?;

    let metadata_length = frame.get_u32_le() as usize;
    ensure(frame, metadata_length + 4)?;
    let metadata = if metadata_length == 0 {
        RecordMetadata::default()
    } else {
        serde_json::from_slice(&frame.split_to(metadata_length))?
    };

    let payload_length = frame.get_u32_le() as usize;
    ensure(frame, payload_length)?;
    let payload = frame.split_to(payload_length);

    Ok(LogEntry {
        position,
        source_position,
        key,
        record_type,
        value_type,
        intent,
        metadata,
        payload,
    })
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}
