//! Length-prefixed CBOR framing for byte-stream worker channels.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{WdbError, WdbResult};
use std::io::Cursor;

/// Largest payload accepted from a peer (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> WdbResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(WdbError::Codec(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> WdbResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete CBOR-decoded messages.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> WdbResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while let Some(len) = self.next_frame_len()? {
            let payload = &self.buffer[4..4 + len];
            let msg: T = cbor_decode(payload)?;
            messages.push(msg);

            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Length of the next frame if it is fully buffered.
    fn next_frame_len(&self) -> WdbResult<Option<usize>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;

        if len > MAX_FRAME_LEN {
            return Err(WdbError::Codec(format!(
                "incoming frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        Ok(Some(len))
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
