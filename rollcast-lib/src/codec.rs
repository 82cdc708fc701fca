//! Message framing: length-prefixed MessagePack frames on stream channels
//! (TCP control, IPC), one MessagePack message per datagram on UDP.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::Message;

/// Negotiation and IPC payloads are small; anything bigger is corruption.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

pub fn encode_frame(msg: &Message) -> Result<Bytes> {
    let body = rmp_serde::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        bail!("outgoing frame too large: {} bytes", body.len());
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

pub fn encode_datagram(msg: &Message) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec(msg)?))
}

/// An empty datagram is not a message: it is the UDP connect intro and the
/// UI wake sentinel.
pub fn decode_datagram(payload: &[u8]) -> Result<Option<Message>> {
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(rmp_serde::from_slice(payload)?))
}

/// Incremental stream decoder; keeps partial frames across reads.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read target for the socket (`read_buf` into this).
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drain at most one complete frame from the buffer.
    pub fn decode(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buf[..HEADER_LEN].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            bail!("incoming frame too large: {len} bytes");
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len);
        Ok(Some(rmp_serde::from_slice(&body)?))
    }
}
