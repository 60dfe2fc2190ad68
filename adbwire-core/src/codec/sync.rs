//! Sync sub-protocol codec.
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────┬────────────────┬────────────────────┐
//! │ id (4 B) │ length (u32 LE)│ payload (length B) │
//! └──────────┴────────────────┴────────────────────┘
//! ```
//!
//! A few replies deviate from this shape and are handled explicitly:
//! - `STAT` carries `mode`, `size`, `mtime` (3 × u32 LE) and no length.
//! - `DENT` carries `mode`, `size`, `mtime`, `namelen` followed by the name.
//! - The `DONE` that ends a `LIST` is a full 20-byte `DENT`-shaped record,
//!   while the `DONE` that ends a `RECV` is 8 bytes.
//! - The `DONE` *request* sent after `SEND` data carries the mtime where the
//!   length would be.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{AdbError, Result};
use crate::types::{DirEntry, S_IFREG, SyncStat};

/// Largest `DATA` payload either side may send.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest remote path the device accepts.
pub const SYNC_PATH_MAX: usize = 1024;

/// Four-byte message ids.
pub mod id {
    pub const STAT: &[u8; 4] = b"STAT";
    pub const LIST: &[u8; 4] = b"LIST";
    pub const SEND: &[u8; 4] = b"SEND";
    pub const RECV: &[u8; 4] = b"RECV";
    pub const DATA: &[u8; 4] = b"DATA";
    pub const DONE: &[u8; 4] = b"DONE";
    pub const DENT: &[u8; 4] = b"DENT";
    pub const OKAY: &[u8; 4] = b"OKAY";
    pub const FAIL: &[u8; 4] = b"FAIL";
    pub const QUIT: &[u8; 4] = b"QUIT";
}

const HEADER: usize = 8;
const STAT_LEN: usize = 4 + 12;
const DENT_HEADER: usize = 4 + 16;

// ── Messages ─────────────────────────────────────────────────────

/// A message sent from the client to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Stat(String),
    List(String),
    /// Begin an upload. `mode` holds permission bits; the regular-file type
    /// bits are added on the wire.
    Send { path: String, mode: u32 },
    Recv(String),
    Data(Bytes),
    /// Finish an upload, stamping the file with `mtime`.
    Done(u32),
    Quit,
}

/// A message received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResponse {
    Stat(SyncStat),
    Dent(DirEntry),
    Data(Bytes),
    Done,
    Okay,
    Fail(String),
}

impl SyncResponse {
    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stat(_) => "STAT",
            Self::Dent(_) => "DENT",
            Self::Data(_) => "DATA",
            Self::Done => "DONE",
            Self::Okay => "OKAY",
            Self::Fail(_) => "FAIL",
        }
    }
}

// ── SyncCodec ────────────────────────────────────────────────────

/// Codec for a connection that has entered sync mode.
///
/// The codec remembers whether a `LIST` is in flight so it can consume the
/// long form of the terminating `DONE`.
#[derive(Debug, Clone, Default)]
pub struct SyncCodec {
    listing: bool,
}

impl SyncCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn put_path_request(dst: &mut BytesMut, id: &[u8; 4], path: &[u8]) -> Result<()> {
    if path.len() > SYNC_PATH_MAX {
        return Err(AdbError::RequestTooLarge {
            size: path.len(),
            max: SYNC_PATH_MAX,
        });
    }
    dst.reserve(HEADER + path.len());
    dst.put_slice(id);
    dst.put_u32_le(path.len() as u32);
    dst.put_slice(path);
    Ok(())
}

impl Encoder<SyncRequest> for SyncCodec {
    type Error = AdbError;

    fn encode(&mut self, item: SyncRequest, dst: &mut BytesMut) -> Result<()> {
        match item {
            SyncRequest::Stat(path) => put_path_request(dst, id::STAT, path.as_bytes()),
            SyncRequest::List(path) => {
                put_path_request(dst, id::LIST, path.as_bytes())?;
                self.listing = true;
                Ok(())
            }
            SyncRequest::Send { path, mode } => {
                let spec = format!("{path},{}", S_IFREG | (mode & 0o7777));
                put_path_request(dst, id::SEND, spec.as_bytes())
            }
            SyncRequest::Recv(path) => put_path_request(dst, id::RECV, path.as_bytes()),
            SyncRequest::Data(chunk) => {
                if chunk.len() > SYNC_DATA_MAX {
                    return Err(AdbError::RequestTooLarge {
                        size: chunk.len(),
                        max: SYNC_DATA_MAX,
                    });
                }
                dst.reserve(HEADER + chunk.len());
                dst.put_slice(id::DATA);
                dst.put_u32_le(chunk.len() as u32);
                dst.put_slice(&chunk);
                Ok(())
            }
            SyncRequest::Done(mtime) => {
                dst.put_slice(id::DONE);
                dst.put_u32_le(mtime);
                Ok(())
            }
            SyncRequest::Quit => {
                dst.put_slice(id::QUIT);
                dst.put_u32_le(0);
                Ok(())
            }
        }
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl Decoder for SyncCodec {
    type Item = SyncResponse;
    type Error = AdbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&src[..4]);

        match &tag {
            id::STAT => {
                if src.len() < STAT_LEN {
                    return Ok(None);
                }
                let stat = SyncStat {
                    mode: le_u32(src, 4),
                    size: le_u32(src, 8),
                    mtime: le_u32(src, 12),
                };
                src.advance(STAT_LEN);
                Ok(Some(SyncResponse::Stat(stat)))
            }
            id::DENT => {
                if src.len() < DENT_HEADER {
                    return Ok(None);
                }
                let name_len = le_u32(src, 16) as usize;
                if name_len > SYNC_PATH_MAX {
                    return Err(AdbError::protocol(format!(
                        "DENT name length {name_len} exceeds {SYNC_PATH_MAX}"
                    )));
                }
                if src.len() < DENT_HEADER + name_len {
                    src.reserve(DENT_HEADER + name_len - src.len());
                    return Ok(None);
                }
                let (mode, size, mtime) = (le_u32(src, 4), le_u32(src, 8), le_u32(src, 12));
                src.advance(DENT_HEADER);
                let name = String::from_utf8(src.split_to(name_len).to_vec())?;
                Ok(Some(SyncResponse::Dent(DirEntry {
                    name,
                    mode,
                    size,
                    mtime,
                })))
            }
            id::DONE => {
                let len = if self.listing { DENT_HEADER } else { HEADER };
                if src.len() < len {
                    return Ok(None);
                }
                src.advance(len);
                self.listing = false;
                Ok(Some(SyncResponse::Done))
            }
            id::OKAY => {
                if src.len() < HEADER {
                    return Ok(None);
                }
                src.advance(HEADER);
                Ok(Some(SyncResponse::Okay))
            }
            id::DATA | id::FAIL => {
                if src.len() < HEADER {
                    return Ok(None);
                }
                let len = le_u32(src, 4) as usize;
                if len > SYNC_DATA_MAX {
                    return Err(AdbError::protocol(format!(
                        "sync payload of {len} bytes exceeds {SYNC_DATA_MAX}"
                    )));
                }
                if src.len() < HEADER + len {
                    src.reserve(HEADER + len - src.len());
                    return Ok(None);
                }
                src.advance(HEADER);
                let payload = src.split_to(len).freeze();
                if &tag == id::DATA {
                    Ok(Some(SyncResponse::Data(payload)))
                } else {
                    self.listing = false;
                    Ok(Some(SyncResponse::Fail(
                        String::from_utf8_lossy(&payload).into_owned(),
                    )))
                }
            }
            other => Err(AdbError::protocol(format!(
                "unknown sync id {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(AdbError::ConnectionClosed {
                partial: crate::error::PartialData::Bytes(src.split().to_vec()),
            }),
        }
    }
}
