//! Frame codec for the long-lived peer stream.
//!
//! Wire format, per envelope: nullable-string `data_type`, nullable-string
//! `flavor`, one compression byte, 4-byte big-endian payload length, payload
//! bytes. Nullable strings carry a leading marker byte (1 = null, 0 =
//! present) followed by a u16 big-endian byte length and UTF-8 bytes, so
//! null and empty are distinguishable. Envelopes follow each other on the
//! stream with no preamble between them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::{ProtocolError, MAX_PAYLOAD_BYTES};

const MARKER_PRESENT: u8 = 0;
const MARKER_NULL: u8 = 1;

/// Codec for framing [`Envelope`] values over a byte stream.
pub struct EnvelopeCodec;

/// Forward-only reader over the unconsumed buffer. Nothing is consumed from
/// the source until a whole envelope has been parsed.
struct Cursor<'a> {
    buf: &'a BytesMut,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a BytesMut) -> Self {
        Self { buf, pos: 0 }
    }

    /// Take `n` bytes, or `None` if the buffer is still short.
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < self.pos + n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn take_u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn take_u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn take_i32(&mut self) -> Option<i32> {
        self.take(4).map(|s| i32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    /// Nullable string: marker byte, then u16 length + UTF-8 bytes when present.
    /// `Ok(None)` inside `Some` means a wire-level null.
    fn take_string(&mut self) -> Option<Result<Option<String>, ProtocolError>> {
        let marker = self.take_u8()?;
        match marker {
            MARKER_NULL => Some(Ok(None)),
            MARKER_PRESENT => {
                let len = self.take_u16()? as usize;
                let bytes = self.take(len)?;
                match std::str::from_utf8(bytes) {
                    Ok(s) => Some(Ok(Some(s.to_owned()))),
                    Err(e) => Some(Err(ProtocolError::Corrupt(format!("invalid utf-8 in string: {e}")))),
                }
            }
            other => Some(Err(ProtocolError::Corrupt(format!(
                "bad string marker: {other:#04x}"
            )))),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cur = Cursor::new(src);

        let data_type = match cur.take_string() {
            None => return Ok(None),
            Some(Err(e)) => return Err(e),
            Some(Ok(None)) => return Err(ProtocolError::Corrupt("null data_type".into())),
            Some(Ok(Some(s))) => s,
        };
        let flavor = match cur.take_string() {
            None => return Ok(None),
            Some(Err(e)) => return Err(e),
            Some(Ok(f)) => f,
        };
        let compression = match cur.take_u8() {
            None => return Ok(None),
            Some(0) => 0,
            Some(other) => return Err(ProtocolError::UnsupportedCompression(other)),
        };
        let payload_len = match cur.take_i32() {
            None => return Ok(None),
            Some(n) if n < 0 => return Err(ProtocolError::NegativePayloadLength(n)),
            Some(n) => n as usize,
        };
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_BYTES,
            });
        }
        let payload = match cur.take(payload_len) {
            None => {
                // Header parsed; reserve for the rest of the payload.
                src.reserve(cur.pos + payload_len - src.len());
                return Ok(None);
            }
            Some(bytes) => Bytes::copy_from_slice(bytes),
        };

        let consumed = cur.pos;
        src.advance(consumed);
        Ok(Some(Envelope {
            data_type,
            flavor,
            compression,
            payload,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        if item.compression != 0 {
            return Err(ProtocolError::UnsupportedCompression(item.compression));
        }

        dst.reserve(item.data_type.len() + item.flavor.as_ref().map_or(0, |f| f.len()) + item.payload.len() + 12);
        put_string(dst, Some(&item.data_type))?;
        put_string(dst, item.flavor.as_deref())?;
        dst.put_u8(item.compression);
        dst.put_i32(item.payload.len() as i32);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

fn put_string(dst: &mut BytesMut, s: Option<&str>) -> Result<(), ProtocolError> {
    match s {
        None => dst.put_u8(MARKER_NULL),
        Some(s) => {
            if s.len() > u16::MAX as usize {
                return Err(ProtocolError::Corrupt(format!(
                    "string too long for wire: {} bytes",
                    s.len()
                )));
            }
            dst.put_u8(MARKER_PRESENT);
            dst.put_u16(s.len() as u16);
            dst.extend_from_slice(s.as_bytes());
        }
    }
    Ok(())
}
