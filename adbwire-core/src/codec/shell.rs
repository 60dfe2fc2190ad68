//! Shell stream codec.
//!
//! # Wire Format
//!
//! v1 (`shell:` / `shell,raw:`) has no framing at all: whatever the device
//! writes is interleaved stdout/stderr, and whatever the client writes is
//! stdin.
//!
//! v2 (`shell,v2,...`) wraps every chunk in a 5-byte header:
//!
//! ```text
//! ┌─────────┬────────────────┬────────────────────┐
//! │ id (u8) │ length (u32 LE)│ payload (length B) │
//! └─────────┴────────────────┴────────────────────┘
//!   0 stdin  1 stdout  2 stderr  3 exit (1-byte code)
//!   4 close-stdin  5 window-size-change
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{AdbError, Result};

/// Packet ids of the v2 shell protocol.
pub mod id {
    pub const STDIN: u8 = 0;
    pub const STDOUT: u8 = 1;
    pub const STDERR: u8 = 2;
    pub const EXIT: u8 = 3;
    pub const CLOSE_STDIN: u8 = 4;
    pub const WINDOW_SIZE_CHANGE: u8 = 5;
}

const V2_HEADER: usize = 5;

/// Upper bound on a single v2 payload.
pub const MAX_SHELL_PACKET: usize = 1 << 20;

/// Which shell protocol a stream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFraming {
    /// Raw, unframed bytes.
    V1,
    /// Packetised with separate stdout, stderr and exit code.
    V2,
}

/// One unit of shell traffic in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellPacket {
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(u8),
    /// Half-close stdin on the device (v2 only).
    CloseStdin,
    /// Terminal resize (v2 only).
    WindowSize {
        rows: u16,
        cols: u16,
        x_pixels: u16,
        y_pixels: u16,
    },
}

/// Codec for a connection that has entered shell mode.
#[derive(Debug, Clone, Copy)]
pub struct ShellCodec {
    framing: ShellFraming,
}

impl ShellCodec {
    pub fn new(framing: ShellFraming) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> ShellFraming {
        self.framing
    }
}

impl Decoder for ShellCodec {
    type Item = ShellPacket;
    type Error = AdbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.framing {
            ShellFraming::V1 => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(ShellPacket::Stdout(src.split().freeze())))
                }
            }
            ShellFraming::V2 => loop {
                if src.len() < V2_HEADER {
                    return Ok(None);
                }
                let kind = src[0];
                let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
                if len > MAX_SHELL_PACKET {
                    return Err(AdbError::protocol(format!(
                        "shell packet of {len} bytes exceeds {MAX_SHELL_PACKET}"
                    )));
                }
                if src.len() < V2_HEADER + len {
                    src.reserve(V2_HEADER + len - src.len());
                    return Ok(None);
                }
                src.advance(V2_HEADER);
                let payload = src.split_to(len).freeze();

                let packet = match kind {
                    id::EXIT => {
                        if payload.len() != 1 {
                            return Err(AdbError::protocol(format!(
                                "exit packet carries {} bytes, expected 1",
                                payload.len()
                            )));
                        }
                        ShellPacket::Exit(payload[0])
                    }
                    id::STDIN | id::STDOUT | id::STDERR if payload.is_empty() => continue,
                    id::STDIN => ShellPacket::Stdin(payload),
                    id::STDOUT => ShellPacket::Stdout(payload),
                    id::STDERR => ShellPacket::Stderr(payload),
                    other => {
                        return Err(AdbError::protocol(format!(
                            "unknown shell packet id {other}"
                        )));
                    }
                };
                return Ok(Some(packet));
            },
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(AdbError::ConnectionClosed {
                partial: crate::error::PartialData::Bytes(src.split().to_vec()),
            }),
        }
    }
}

fn put_v2(dst: &mut BytesMut, kind: u8, payload: &[u8]) {
    dst.reserve(V2_HEADER + payload.len());
    dst.put_u8(kind);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
}

impl Encoder<ShellPacket> for ShellCodec {
    type Error = AdbError;

    fn encode(&mut self, item: ShellPacket, dst: &mut BytesMut) -> Result<()> {
        match (self.framing, item) {
            (ShellFraming::V1, ShellPacket::Stdin(data)) => {
                dst.extend_from_slice(&data);
                Ok(())
            }
            (ShellFraming::V1, other) => Err(AdbError::protocol(format!(
                "cannot send {other:?} over a v1 shell"
            ))),
            (ShellFraming::V2, ShellPacket::Stdin(data)) => {
                if data.len() > MAX_SHELL_PACKET {
                    return Err(AdbError::RequestTooLarge {
                        size: data.len(),
                        max: MAX_SHELL_PACKET,
                    });
                }
                put_v2(dst, id::STDIN, &data);
                Ok(())
            }
            (ShellFraming::V2, ShellPacket::CloseStdin) => {
                put_v2(dst, id::CLOSE_STDIN, &[]);
                Ok(())
            }
            (
                ShellFraming::V2,
                ShellPacket::WindowSize {
                    rows,
                    cols,
                    x_pixels,
                    y_pixels,
                },
            ) => {
                let spec = format!("{rows}x{cols},{x_pixels}x{y_pixels}");
                put_v2(dst, id::WINDOW_SIZE_CHANGE, spec.as_bytes());
                Ok(())
            }
            (ShellFraming::V2, other) => Err(AdbError::protocol(format!(
                "{other:?} is device-to-host only"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_packet(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_v2(&mut buf, kind, payload);
        buf.to_vec()
    }

    #[test]
    fn v2_demultiplexes_interleaved_output() {
        let mut codec = ShellCodec::new(ShellFraming::V2);
        let mut buf = BytesMut::new();
        let script: [(u8, &[u8]); 5] = [(1, b"a"), (2, b"b"), (1, b"c"), (2, b"d"), (3, b"\0")];
        for (kind, payload) in script {
            buf.extend_from_slice(&v2_packet(kind, payload));
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit = None;
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            match packet {
                ShellPacket::Stdout(b) => stdout.extend_from_slice(&b),
                ShellPacket::Stderr(b) => stderr.extend_from_slice(&b),
                ShellPacket::Exit(code) => exit = Some(code),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(stdout, b"ac");
        assert_eq!(stderr, b"bd");
        assert_eq!(exit, Some(0));
    }

    #[test]
    fn v2_skips_empty_packets() {
        let mut codec = ShellCodec::new(ShellFraming::V2);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&v2_packet(1, b""));
        buf.extend_from_slice(&v2_packet(2, b"x"));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ShellPacket::Stderr(Bytes::from_static(b"x")))
        );
    }

    #[test]
    fn v2_waits_for_full_payload() {
        let mut codec = ShellCodec::new(ShellFraming::V2);
        let full = v2_packet(1, b"hello");
        let mut buf = BytesMut::from(&full[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[7..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ShellPacket::Stdout(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn v2_rejects_bad_exit_and_unknown_id() {
        let mut codec = ShellCodec::new(ShellFraming::V2);
        let mut buf = BytesMut::from(&v2_packet(3, b"\0\0")[..]);
        assert!(matches!(codec.decode(&mut buf), Err(AdbError::Protocol(_))));

        let mut buf = BytesMut::from(&v2_packet(9, b"x")[..]);
        assert!(matches!(codec.decode(&mut buf), Err(AdbError::Protocol(_))));
    }

    #[test]
    fn v2_eof_mid_packet_is_connection_closed() {
        let mut codec = ShellCodec::new(ShellFraming::V2);
        let mut buf = BytesMut::from(&b"\x01\x05\x00\x00\x00ab"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(AdbError::ConnectionClosed { .. })
        ));
    }

    #[test]
    fn v1_passes_bytes_through() {
        let mut codec = ShellCodec::new(ShellFraming::V1);
        let mut buf = BytesMut::from(&b"\x01raw\x03"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ShellPacket::Stdout(Bytes::from_static(b"\x01raw\x03")))
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut out = BytesMut::new();
        codec
            .encode(ShellPacket::Stdin(Bytes::from_static(b"ls\n")), &mut out)
            .unwrap();
        assert_eq!(&out[..], b"ls\n");
        assert!(codec.encode(ShellPacket::CloseStdin, &mut out).is_err());
    }

    #[test]
    fn v2_encodes_control_packets() {
        let mut codec = ShellCodec::new(ShellFraming::V2);
        let mut out = BytesMut::new();
        codec
            .encode(
                ShellPacket::WindowSize {
                    rows: 24,
                    cols: 80,
                    x_pixels: 0,
                    y_pixels: 0,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(out[0], id::WINDOW_SIZE_CHANGE);
        assert_eq!(&out[5..], b"24x80,0x0");

        out.clear();
        codec.encode(ShellPacket::CloseStdin, &mut out).unwrap();
        assert_eq!(&out[..], &[id::CLOSE_STDIN, 0, 0, 0, 0]);
    }
}
