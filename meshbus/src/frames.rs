//! Command and event frame layouts.
//!
//! Layouts at the application boundary (the wire layer handles transport
//! framing and identity prepending):
//!
//! - request, router side:  `[identity][empty][topic u64 LE][correlation u64 LE][payload]`
//! - request, dealer side:  `[empty][topic][correlation][payload]`
//! - response, router side: `[identity][empty][correlation][payload]`
//! - response, dealer side: `[empty][correlation][payload]`
//! - event:                 `[utf8 topic][payload]`
//!
//! Every integer read is bounds-checked and frame counts are validated;
//! malformed messages surface as errors for the caller to log and drop.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MeshError, Result};

const REQUEST_FRAMES: usize = 5;
const RESPONSE_FRAMES: usize = 4;

/// Build the dealer-side request message.
#[must_use]
pub fn request(topic: u64, correlation_id: u64, payload: Bytes) -> Vec<Bytes> {
    vec![
        Bytes::new(),
        u64_frame(topic),
        u64_frame(correlation_id),
        payload,
    ]
}

/// Build the router-side response message.
#[must_use]
pub fn response(identity: Bytes, correlation_id: u64, payload: Bytes) -> Vec<Bytes> {
    vec![identity, Bytes::new(), u64_frame(correlation_id), payload]
}

/// A parsed command request, as seen by the server.
#[derive(Debug)]
pub struct Request {
    pub identity: Bytes,
    pub topic: u64,
    pub correlation_id: u64,
    pub payload: Bytes,
}

/// Parse a router-side request message (5 frames).
pub fn parse_request(parts: &[Bytes]) -> Result<Request> {
    if parts.len() != REQUEST_FRAMES {
        return Err(malformed(format!(
            "request must have {REQUEST_FRAMES} frames, got {}",
            parts.len()
        )));
    }
    if !parts[1].is_empty() {
        return Err(malformed("request delimiter frame not empty"));
    }
    Ok(Request {
        identity: parts[0].clone(),
        topic: read_u64_le(&parts[2])?,
        correlation_id: read_u64_le(&parts[3])?,
        payload: parts[4].clone(),
    })
}

/// Parse a dealer-side response message (`[empty][correlation][payload]`).
pub fn parse_reply(parts: &[Bytes]) -> Result<(u64, Bytes)> {
    if parts.len() != RESPONSE_FRAMES - 1 {
        return Err(malformed(format!(
            "reply must have {} frames, got {}",
            RESPONSE_FRAMES - 1,
            parts.len()
        )));
    }
    if !parts[0].is_empty() {
        return Err(malformed("reply delimiter frame not empty"));
    }
    Ok((read_u64_le(&parts[1])?, parts[2].clone()))
}

/// Build an event message.
#[must_use]
pub fn event(topic: &'static str, payload: Bytes) -> Vec<Bytes> {
    vec![Bytes::from_static(topic.as_bytes()), payload]
}

/// Parse an inbound event message.
pub fn parse_event(parts: &[Bytes]) -> Result<(String, Bytes)> {
    if parts.len() != 2 {
        return Err(malformed(format!(
            "event must have 2 frames, got {}",
            parts.len()
        )));
    }
    let topic = std::str::from_utf8(&parts[0])
        .map_err(|_| malformed("event topic is not utf-8"))?
        .to_owned();
    Ok((topic, parts[1].clone()))
}

fn u64_frame(value: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(value);
    buf.freeze()
}

fn read_u64_le(frame: &Bytes) -> Result<u64> {
    let bytes: [u8; 8] = frame
        .as_ref()
        .try_into()
        .map_err(|_| malformed(format!("expected 8-byte integer frame, got {}", frame.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

fn malformed(msg: impl Into<String>) -> MeshError {
    MeshError::Serialization(msg.into())
}
