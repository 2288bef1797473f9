//! SLIP framing
//!
//! Every three-wire packet travels on the wire as a SLIP frame:
//!
//! ```plain
//! +------+--------------------------------+------+
//! | 0xC0 | escaped header/payload/CRC     | 0xC0 |
//! +------+--------------------------------+------+
//! ```
//!
//! `0xC0` inside a frame is sent as `0xDB 0xDC` and `0xDB` as `0xDB 0xDD`.
//! Any other byte following `0xDB` is a corrupted escape and the whole frame
//! is rejected.
//!
//! The decoder is resilient to line noise: bytes before the first delimiter
//! are dropped, back-to-back delimiters are treated as an empty frame and
//! skipped, and a closing delimiter is kept so it can open the next frame if
//! the peer's own opening delimiter was lost.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::MAX_FRAME_SIZE;
use super::ProtocolError;

/// Frame delimiter
pub const SLIP_END: u8 = 0xC0;
/// Escape byte
pub const SLIP_ESC: u8 = 0xDB;
/// Escaped form of [`SLIP_END`]
pub const SLIP_ESC_END: u8 = 0xDC;
/// Escaped form of [`SLIP_ESC`]
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Worst case: every byte escaped plus both delimiters
const MAX_ENCODED_FRAME: usize = MAX_FRAME_SIZE * 2 + 2;

/// Codec turning raw frame contents into SLIP frames and back
#[derive(Debug, Clone, Copy, Default)]
pub struct SlipCodec;

impl SlipCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for SlipCodec {
    type Item = Vec<u8>;
    type Error = ProtocolError;

    /// Extract the next frame. A corrupted frame is consumed and reported as
    /// an error; callers driving the codec by hand keep decoding afterwards.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(start) = src.iter().position(|&b| b == SLIP_END) else {
                src.clear();
                return Ok(None);
            };
            src.advance(start);

            let Some(end) = src[1..].iter().position(|&b| b == SLIP_END).map(|p| p + 1) else {
                if src.len() > MAX_ENCODED_FRAME {
                    let dropped = src.len();
                    src.clear();
                    return Err(ProtocolError::Framing(format!(
                        "no closing delimiter within {} bytes",
                        dropped
                    )));
                }
                return Ok(None);
            };

            if end == 1 {
                src.advance(1);
                continue;
            }

            let frame = src.split_to(end);
            return unescape(&frame[1..]).map(Some);
        }
    }
}

impl<'a> Encoder<&'a [u8]> for SlipCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_u8(SLIP_END);
        for &byte in item {
            match byte {
                SLIP_END => dst.put_slice(&[SLIP_ESC, SLIP_ESC_END]),
                SLIP_ESC => dst.put_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
                other => dst.put_u8(other),
            }
        }
        dst.put_u8(SLIP_END);
        Ok(())
    }
}

/// Encode one frame into a fresh buffer
pub fn encode_frame(contents: &[u8]) -> Vec<u8> {
    let mut dst = BytesMut::with_capacity(contents.len() + 2);
    // Encoding into a BytesMut cannot fail
    let _ = SlipCodec.encode(contents, &mut dst);
    dst.to_vec()
}

fn unescape(escaped: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();
    while let Some(&byte) = bytes.next() {
        if byte != SLIP_ESC {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(&SLIP_ESC_END) => out.push(SLIP_END),
            Some(&SLIP_ESC_ESC) => out.push(SLIP_ESC),
            Some(&other) => {
                return Err(ProtocolError::Framing(format!(
                    "invalid escape sequence 0xdb {:#04x}",
                    other
                )))
            }
            None => {
                return Err(ProtocolError::Framing(
                    "frame ends inside an escape sequence".to_string(),
                ))
            }
        }
    }
    Ok(out)
}
