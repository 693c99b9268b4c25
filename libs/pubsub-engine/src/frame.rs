//! Frame codec: one message as a self-describing, checksummed record.
//!
//! ```text
//! [length:u32 LE][marker:u8][crc32:u32 LE][payload: protobuf Message]
//!       4B           1B          4B            length - 5 bytes
//! ```
//!
//! `length` counts everything after itself (marker + crc + payload).
//! The CRC-32 (IEEE) covers the payload only. Frames are written
//! back-to-back; end of segment is end of file.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{BrokerError, Result};
use crate::message::Message;

pub const LENGTH_FIELD_LEN: usize = 4;
/// Length field + marker + checksum.
pub const HEADER_LEN: usize = LENGTH_FIELD_LEN + 1 + 4;
/// Current (and only) format version.
pub const FORMAT_MARKER: u8 = 0;
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Encodes `message` into a standalone frame.
pub fn encode(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    FrameCodec.encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes the frame at the start of `buf`.
///
/// Returns the message and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold a whole frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    if buf.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length < HEADER_LEN - LENGTH_FIELD_LEN {
        return Err(BrokerError::CorruptFrame(format!(
            "length field {length} shorter than frame header"
        )));
    }
    let payload_len = length - (HEADER_LEN - LENGTH_FIELD_LEN);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(BrokerError::CorruptFrame(format!(
            "length field announces {payload_len} byte payload, limit is {MAX_PAYLOAD_LEN}"
        )));
    }
    let frame_len = LENGTH_FIELD_LEN + length;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let marker = buf[LENGTH_FIELD_LEN];
    if marker != FORMAT_MARKER {
        return Err(BrokerError::CorruptFrame(format!("unknown format marker {marker}")));
    }
    let stored = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let payload = &buf[HEADER_LEN..frame_len];
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(BrokerError::CorruptFrame(format!(
            "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let message = Message::decode(payload)
        .map_err(|e| BrokerError::CorruptFrame(format!("payload: {e}")))?;
    Ok(Some((message, frame_len)))
}

/// [`Encoder`]/[`Decoder`] pair over the frame format.
///
/// `decode` yields `Ok(None)` both for a partial header and for a header
/// whose body has not fully arrived; a tailing reader waits in both cases.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Encoder<&Message> for FrameCodec {
    type Error = BrokerError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let payload_len = message.encoded_len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(BrokerError::InvalidArgument(format!(
                "message of {payload_len} bytes exceeds limit of {MAX_PAYLOAD_LEN}"
            )));
        }

        dst.reserve(HEADER_LEN + payload_len);
        dst.put_u32_le((payload_len + HEADER_LEN - LENGTH_FIELD_LEN) as u32);
        dst.put_u8(FORMAT_MARKER);
        let crc_at = dst.len();
        dst.put_u32_le(0);
        let payload_at = dst.len();
        message
            .encode(dst)
            .map_err(|e| BrokerError::InvalidArgument(format!("encode message: {e}")))?;
        let crc = crc32fast::hash(&dst[payload_at..]);
        dst[crc_at..payload_at].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match decode(src)? {
            Some((message, consumed)) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// At the end of a sealed segment leftover bytes are a torn frame.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match Decoder::decode(self, src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(BrokerError::CorruptFrame(format!(
                "truncated frame: {} trailing bytes",
                src.len()
            ))),
        }
    }
}
