//! Length-prefixed frame assembly.
//!
//! Every frame is a big-endian `u32` payload length followed by the payload
//! (one tag byte plus body, see `proto`). The decoder is incremental so a
//! nonblocking transport can feed it partial reads and resume mid-frame.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length cannot be zero")]
    ZeroLength,
    #[error("frame of {got_bytes} bytes exceeds limit {max_frame_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::ZeroLength);
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental frame reassembly over an unframed byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            max_frame_bytes,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 {
            return Err(FrameError::ZeroLength);
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        let _ = self.buf.split_to(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(length).freeze()))
    }

    /// True when bytes of an incomplete frame are buffered; EOF here means
    /// the peer died mid-frame.
    pub fn mid_frame(&self) -> bool {
        !self.buf.is_empty()
    }
}
