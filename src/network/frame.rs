// Length-prefixed framing.
//
// Each frame is `len: u32 BE || payload` where `len` excludes itself. The
// decoder is stateful across TCP reads: partial frames stay buffered until
// the rest arrives. A declared length above the cap is a wire error and the
// connection is closed.

use crate::error::{KvError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on a declared frame length, preventing memory exhaustion
/// from a hostile or broken peer.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Pull one complete payload out of `buf`, or `None` if more bytes are
    /// needed. Call in a loop: one socket read may carry several frames.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        if len > self.max_frame {
            return Err(KvError::Wire(format!(
                "declared frame length {} exceeds cap {}",
                len, self.max_frame
            )));
        }
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }
        buf.advance(4);
        Ok(Some(buf.split_to(len).freeze()))
    }

    pub fn encode(&self, payload: &[u8], out: &mut BytesMut) {
        out.reserve(4 + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
    }
}
