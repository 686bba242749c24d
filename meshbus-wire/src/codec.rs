//! Multipart framing.
//!
//! Every frame on the wire is `[flags u8][len u32 LE][body]`. Flag bit 0
//! (MORE) chains frames into a multipart message; flag bit 1 (COMMAND) marks
//! a single-frame control message (dealer identity announcements, subscriber
//! prefix updates). Bits 2-7 are reserved and must be zero.
//!
//! Decoding is stateful and incremental: the read pump feeds raw chunks into
//! [`FrameDecoder`], which yields complete frames as they materialize.
//! `Ok(None)` means more bytes are needed; errors are protocol violations
//! that sever the offending connection only.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// MORE flag: another frame of the same message follows.
pub const FLAG_MORE: u8 = 0x01;
/// COMMAND flag: control frame, never part of a multipart message.
pub const FLAG_COMMAND: u8 = 0x02;

const RESERVED_MASK: u8 = !(FLAG_MORE | FLAG_COMMAND);
const HEADER_LEN: usize = 5;

/// Upper bound on a single frame body. Oversized frames indicate a corrupt
/// or hostile peer and close the connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// First byte of a subscriber control body: add a prefix subscription.
pub const SUB_SUBSCRIBE: u8 = 0x01;
/// First byte of a subscriber control body: drop a prefix subscription.
pub const SUB_UNSUBSCRIBE: u8 = 0x00;

/// A decoded wire frame.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub flags: u8,
    pub body: Bytes,
}

impl WireFrame {
    #[inline]
    pub const fn more(&self) -> bool {
        (self.flags & FLAG_MORE) != 0
    }

    #[inline]
    pub const fn is_command(&self) -> bool {
        (self.flags & FLAG_COMMAND) != 0
    }
}

/// Something a connection produced at the message level.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A complete multipart message.
    Message(Vec<Bytes>),
    /// A control frame body.
    Command(Bytes),
}

/// Encode a multipart message into one contiguous buffer.
#[must_use]
pub fn encode_message(parts: &[Bytes]) -> Bytes {
    let body_len: usize = parts.iter().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(body_len + parts.len() * HEADER_LEN);
    for (i, part) in parts.iter().enumerate() {
        let flags = if i + 1 < parts.len() { FLAG_MORE } else { 0 };
        out.put_u8(flags);
        out.put_u32_le(part.len() as u32);
        out.put_slice(part);
    }
    out.freeze()
}

/// Encode a single control frame.
#[must_use]
pub fn encode_command(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + HEADER_LEN);
    out.put_u8(FLAG_COMMAND);
    out.put_u32_le(body.len() as u32);
    out.put_slice(body);
    out.freeze()
}

/// Encode a subscriber prefix update (see [`SUB_SUBSCRIBE`]).
#[must_use]
pub fn encode_subscription(subscribe: bool, prefix: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(prefix.len() + 1);
    body.put_u8(if subscribe { SUB_SUBSCRIBE } else { SUB_UNSUBSCRIBE });
    body.put_slice(prefix);
    encode_command(&body)
}

/// Stateful frame decoder.
///
/// Buffers partial input across `feed` calls; `next_frame` pops one complete
/// frame at a time.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    staging: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            staging: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.staging.extend_from_slice(chunk);
    }

    /// Pop the next complete frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` → frame decoded
    /// - `Ok(None)` → need more data
    /// - `Err` → protocol violation
    pub fn next_frame(&mut self) -> Result<Option<WireFrame>> {
        if self.staging.len() < HEADER_LEN {
            return Ok(None);
        }

        let flags = self.staging[0];
        if (flags & RESERVED_MASK) != 0 {
            return Err(WireError::ReservedBits);
        }

        let len = u32::from_le_bytes([
            self.staging[1],
            self.staging[2],
            self.staging[3],
            self.staging[4],
        ]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_LEN,
            });
        }

        if self.staging.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.staging.advance(HEADER_LEN);
        let body = self.staging.split_to(len).freeze();
        Ok(Some(WireFrame { flags, body }))
    }
}

/// Collects data frames into multipart messages; control frames pass
/// straight through, even mid-message.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    parts: Vec<Bytes>,
}

impl MessageAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; yields an [`Inbound`] when a message or command is
    /// complete.
    pub fn push(&mut self, frame: WireFrame) -> Option<Inbound> {
        if frame.is_command() {
            return Some(Inbound::Command(frame.body));
        }
        let more = frame.more();
        self.parts.push(frame.body);
        if more {
            None
        } else {
            Some(Inbound::Message(std::mem::take(&mut self.parts)))
        }
    }
}
