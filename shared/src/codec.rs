//! Wire codec
//!
//! Every message travels as one self-describing frame:
//!
//! ```text
//! +-------------+--------------------+-------------------+
//! | kind: u16   | payload_len: u32   | payload           |
//! +-------------+--------------------+-------------------+
//! ```
//!
//! Both header fields are little-endian. The payload is the bincode encoding
//! of the message struct (fixed-width little-endian integers, strings and
//! sequences prefixed with a `u64` length). Because the header carries the
//! payload length, a frame of an unknown kind can be stepped over without
//! understanding it.

use crate::catalog::MessageCatalog;
use crate::error::CodecError;
use crate::messages::Message;

pub const HEADER_LEN: usize = 6;

/// Largest payload a frame may announce. Stream reassembly refuses to
/// buffer past it.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: u16,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn read(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::IncompleteHeader {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let tag = u16::from_le_bytes([bytes[0], bytes[1]]);
        let payload_length = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        Ok(Self {
            tag,
            payload_length,
        })
    }

    /// Header plus payload
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_length as usize
    }
}

/// Append one frame for an already encoded payload
pub fn write_frame(tag: u16, payload: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let payload_length =
        u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge(payload.len()))?;
    out.reserve(HEADER_LEN + payload.len());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&payload_length.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Encode a message as a single frame
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = message.encode_payload()?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    write_frame(message.kind().tag(), &payload, &mut out)?;
    Ok(out)
}

/// Decode the frame at the start of `bytes`.
///
/// Bytes past the end of the frame are ignored. On `UnknownMessageKind` or a
/// malformed payload the frame length is still known; see [`FrameReader`]
/// for stepping over it.
pub fn decode(catalog: &MessageCatalog, bytes: &[u8]) -> Result<(u16, Message), CodecError> {
    let header = FrameHeader::read(bytes)?;
    let payload = payload_of(&header, bytes)?;
    let message = catalog.decode_payload(header.tag, payload)?;
    Ok((header.tag, message))
}

fn payload_of<'b>(header: &FrameHeader, bytes: &'b [u8]) -> Result<&'b [u8], CodecError> {
    let end = header.frame_len();
    if bytes.len() < end {
        return Err(CodecError::TruncatedPayload {
            expected: header.payload_length as usize,
            available: bytes.len() - HEADER_LEN,
        });
    }
    Ok(&bytes[HEADER_LEN..end])
}

/// Iterates over the frames packed into one buffer.
///
/// Recoverable errors are yielded and the reader moves past the offending
/// frame. A truncated frame is yielded once and ends the iteration, since
/// nothing after it can be located.
pub struct FrameReader<'a> {
    catalog: &'a MessageCatalog,
    bytes: &'a [u8],
    position: usize,
    done: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(catalog: &'a MessageCatalog, bytes: &'a [u8]) -> Self {
        Self {
            catalog,
            bytes,
            position: 0,
            done: false,
        }
    }

    /// Offset of the next unread frame
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<(u16, Message), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.bytes.len() {
            return None;
        }
        let rest = &self.bytes[self.position..];
        let header = match FrameHeader::read(rest) {
            Ok(header) => header,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if let Err(e) = payload_of(&header, rest) {
            self.done = true;
            return Some(Err(e));
        }
        self.position += header.frame_len();
        Some(decode(self.catalog, &rest[..header.frame_len()]))
    }
}

/// Reassembles frames from a byte stream that may split or coalesce them
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    max_payload: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_PAYLOAD_LEN)
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that rejects frames announcing more than `max_payload` bytes
    pub fn with_limit(max_payload: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Remove and return the next complete frame, header included.
    ///
    /// `Ok(None)` means the next frame has not fully arrived. A header
    /// announcing more than the limit is an error; the stream cannot be
    /// trusted past it.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let Ok(header) = FrameHeader::read(&self.bytes) else {
            return Ok(None);
        };
        let announced = header.payload_length as usize;
        if announced > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                announced,
                limit: self.max_payload,
            });
        }
        let len = header.frame_len();
        if self.bytes.len() < len {
            return Ok(None);
        }
        Ok(Some(self.bytes.drain(..len).collect()))
    }

    /// Bytes of a frame that has not fully arrived yet
    pub fn buffered(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Split a datagram into whole frames.
///
/// Datagrams never carry partial frames, so leftover bytes are reported as
/// the truncation error they are.
pub fn split_datagram(bytes: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let header = FrameHeader::read(rest)?;
        payload_of(&header, rest)?;
        let (frame, tail) = rest.split_at(header.frame_len());
        frames.push(frame);
        rest = tail;
    }
    Ok(frames)
}
