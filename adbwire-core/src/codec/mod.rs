//! Wire codecs.
//!
//! The host protocol uses ASCII framing: every request and every textual
//! reply is four lowercase hex digits of length followed by that many bytes.
//! Replies are preceded by a 4-byte `OKAY` / `FAIL` status. The sync and
//! shell v2 sub-protocols use binary little-endian framing instead and live
//! in [`sync`] and [`shell`].

pub mod shell;
pub mod sync;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{AdbError, Result};

/// Largest body a single hex-length frame can carry.
pub const MAX_FRAME_LEN: usize = 0xffff;

/// Size of the hex length prefix.
pub const LEN_PREFIX: usize = 4;

// ── Status ───────────────────────────────────────────────────────

/// The 4-byte status word that precedes every server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Okay,
    Fail,
}

impl Status {
    pub const OKAY: &'static [u8; 4] = b"OKAY";
    pub const FAIL: &'static [u8; 4] = b"FAIL";

    /// Parse a status word. Anything but `OKAY`/`FAIL` is a protocol error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            b"OKAY" => Ok(Status::Okay),
            b"FAIL" => Ok(Status::Fail),
            other => Err(AdbError::protocol(format!(
                "expected OKAY or FAIL, got {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            Status::Okay => Self::OKAY,
            Status::Fail => Self::FAIL,
        }
    }
}

// ── Frame helpers ────────────────────────────────────────────────

/// Encode `body` as one hex-length frame.
pub fn encode_frame(body: &[u8]) -> Result<Bytes> {
    if body.len() > MAX_FRAME_LEN {
        return Err(AdbError::RequestTooLarge {
            size: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_slice(format!("{:04x}", body.len()).as_bytes());
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Encode a textual service request as one frame.
pub fn encode_request(text: &str) -> Result<Bytes> {
    encode_frame(text.as_bytes())
}

/// Decode one complete frame, returning the body. The input must contain
/// exactly one frame.
pub fn decode_frame(frame: &[u8]) -> Result<Bytes> {
    if frame.len() < LEN_PREFIX {
        return Err(AdbError::protocol("frame shorter than its length prefix"));
    }
    let len = parse_hex_len(&frame[..LEN_PREFIX])?;
    let body = &frame[LEN_PREFIX..];
    if body.len() != len {
        return Err(AdbError::protocol(format!(
            "frame declares {len} bytes but carries {}",
            body.len()
        )));
    }
    Ok(Bytes::copy_from_slice(body))
}

/// Parse a 4-digit hex length prefix.
pub fn parse_hex_len(prefix: &[u8]) -> Result<usize> {
    if prefix.len() != LEN_PREFIX || !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(AdbError::protocol(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(prefix)
        )));
    }
    // All four bytes are ASCII hex digits, so this cannot fail.
    let text = std::str::from_utf8(prefix).map_err(|e| AdbError::protocol(e.to_string()))?;
    Ok(usize::from_str_radix(text, 16)?)
}

// ── HexFrameCodec ────────────────────────────────────────────────

/// Streaming codec for hex-length frames.
///
/// Used for connections that keep receiving frames after the initial
/// status, such as `host:track-devices`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HexFrameCodec;

impl Decoder for HexFrameCodec {
    type Item = Bytes;
    type Error = AdbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = parse_hex_len(&src[..LEN_PREFIX])?;
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(AdbError::ConnectionClosed {
                partial: crate::error::PartialData::Bytes(src.split().to_vec()),
            }),
        }
    }
}

impl Encoder<&str> for HexFrameCodec {
    type Error = AdbError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_request(item)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_request_uses_lowercase_hex() {
        let frame = encode_request("host:version").unwrap();
        assert_eq!(&frame[..], b"000chost:version");

        let body = "x".repeat(0xab);
        let frame = encode_request(&body).unwrap();
        assert_eq!(&frame[..4], b"00ab");
    }

    #[test]
    fn encode_counts_utf8_bytes_not_chars() {
        let frame = encode_request("é").unwrap();
        assert_eq!(&frame[..4], b"0002");
    }

    #[test]
    fn frame_roundtrip_at_boundaries() {
        for len in [0usize, 1, 255, MAX_FRAME_LEN] {
            let body = vec![b'a'; len];
            let frame = encode_frame(&body).unwrap();
            assert_eq!(frame.len(), len + LEN_PREFIX);
            assert_eq!(&decode_frame(&frame).unwrap()[..], &body[..]);
        }
    }

    #[test]
    fn oversized_request_is_rejected() {
        let body = vec![b'a'; MAX_FRAME_LEN + 1];
        let err = encode_frame(&body).unwrap_err();
        assert!(matches!(err, AdbError::RequestTooLarge { size: 65536, .. }));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(Status::parse(b"OKAY").unwrap(), Status::Okay);
        assert_eq!(Status::parse(b"FAIL").unwrap(), Status::Fail);
        for bad in [&b"OKAZ"[..], b"okay", b"0000", b"\0\0\0\0"] {
            assert!(matches!(Status::parse(bad), Err(AdbError::Protocol(_))));
        }
    }

    #[test]
    fn hex_len_rejects_garbage() {
        assert_eq!(parse_hex_len(b"0029").unwrap(), 0x29);
        assert_eq!(parse_hex_len(b"FFFF").unwrap(), 0xffff);
        assert!(parse_hex_len(b"00g1").is_err());
        assert!(parse_hex_len(b"+001").is_err());
        assert!(parse_hex_len(b"001").is_err());
    }

    #[test]
    fn decode_frame_rejects_length_mismatch() {
        assert!(decode_frame(b"0005abc").is_err());
        assert!(decode_frame(b"0002abc").is_err());
        assert!(decode_frame(b"00").is_err());
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let mut codec = HexFrameCodec;
        let mut buf = BytesMut::from(&b"000demulator-"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"5554");
        buf.extend_from_slice(b"0000");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"emulator-5554");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_eof_mid_frame_is_connection_closed() {
        let mut codec = HexFrameCodec;
        let mut buf = BytesMut::from(&b"0010abc"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, AdbError::ConnectionClosed { .. }));
    }
}
