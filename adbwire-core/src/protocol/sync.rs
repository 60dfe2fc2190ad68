//! Sync (file transfer) engine.
//!
//! # Wire Protocol
//!
//! ```text
//! Client ──[STAT path]────────────────────────► Device
//! Device ──[STAT mode size mtime]─────────────► Client
//!
//! Client ──[LIST path]────────────────────────► Device
//! Device ──[DENT ...] × n, [DONE]─────────────► Client
//!
//! Client ──[SEND "path,mode"]─[DATA]×n─[DONE mtime]► Device
//! Device ──[OKAY] or [FAIL msg]───────────────► Client
//!
//! Client ──[RECV path]────────────────────────► Device
//! Device ──[DATA]×n, [DONE] or [FAIL msg]─────► Client
//! ```
//!
//! A session owns its connection and never returns to request mode. A
//! listing or download left unfinished leaves unread bytes on the socket,
//! so the session refuses further requests until it is dropped.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::stream::{self, Stream};
use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::client::AdbDevice;
use crate::codec::sync::{SYNC_DATA_MAX, SyncCodec, SyncRequest, SyncResponse};
use crate::error::{AdbError, Result};
use crate::network::AdbConnection;
use crate::network::connection::deadline;
use crate::request::DeviceRequest;
use crate::types::{DirEntry, SyncStat};

/// Seconds since the epoch, clamped into the 32-bit sync field.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs().min(u64::from(u32::MAX)) as u32)
}

fn unexpected(reply: &SyncResponse, during: &str) -> AdbError {
    AdbError::protocol(format!("unexpected {} reply during {during}", reply.name()))
}

// ── SyncSession ──────────────────────────────────────────────────

/// An open sync session on one device.
#[derive(Debug)]
pub struct SyncSession<S = TcpStream> {
    framed: Framed<S, SyncCodec>,
    read_timeout: Option<Duration>,
    /// Set while a request is outstanding; cleared on clean completion.
    dirty: bool,
}

impl<S> SyncSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take over a connection whose device has accepted `sync:`.
    pub fn new(conn: AdbConnection<S>) -> Self {
        let read_timeout = conn.read_timeout();
        Self {
            framed: conn.into_framed(SyncCodec::new()),
            read_timeout,
            dirty: false,
        }
    }

    /// `false` once a transfer was abandoned or failed mid-way.
    pub fn is_usable(&self) -> bool {
        !self.dirty
    }

    fn begin(&mut self, op: &str) -> Result<()> {
        if self.dirty {
            return Err(AdbError::protocol(format!(
                "cannot {op}: sync session was left mid-transfer"
            )));
        }
        self.dirty = true;
        Ok(())
    }

    async fn send(&mut self, request: SyncRequest) -> Result<()> {
        tracing::trace!(?request, "sync send");
        self.framed.send(request).await
    }

    async fn recv(&mut self) -> Result<SyncResponse> {
        let framed = &mut self.framed;
        let reply = deadline(self.read_timeout, async move {
            framed.next().await.transpose()
        })
        .await?;
        reply.ok_or_else(AdbError::closed)
    }

    // ── STAT ─────────────────────────────────────────────────────

    /// Stat a remote path. A missing file yields all-zero fields.
    pub async fn stat(&mut self, path: &str) -> Result<SyncStat> {
        self.begin("stat")?;
        self.send(SyncRequest::Stat(path.to_string())).await?;
        match self.recv().await? {
            SyncResponse::Stat(stat) => {
                self.dirty = false;
                tracing::debug!(path, ?stat, "stat");
                Ok(stat)
            }
            SyncResponse::Fail(msg) => Err(AdbError::Service(msg)),
            other => Err(unexpected(&other, "STAT")),
        }
    }

    /// `true` when `path` exists on the device.
    pub async fn exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.exists())
    }

    // ── LIST ─────────────────────────────────────────────────────

    /// Lazily list a remote directory. The stream ends at `DONE`; a `FAIL`
    /// ends it with an error.
    pub fn list<'a>(&'a mut self, path: &str) -> impl Stream<Item = Result<DirEntry>> + 'a {
        let pending = Some(path.to_string());
        stream::try_unfold((self, pending), |(session, pending)| async move {
            if let Some(path) = pending {
                session.begin("list")?;
                tracing::debug!(%path, "list");
                session.send(SyncRequest::List(path)).await?;
            }
            match session.recv().await? {
                SyncResponse::Dent(entry) => Ok(Some((entry, (session, None)))),
                SyncResponse::Done => {
                    session.dirty = false;
                    Ok(None)
                }
                SyncResponse::Fail(msg) => Err(AdbError::Service(msg)),
                other => Err(unexpected(&other, "LIST")),
            }
        })
    }

    /// Collect a full listing, dropping `.` and `..`.
    pub async fn list_all(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.list(path)
            .try_filter(|entry| futures::future::ready(!entry.is_dot()))
            .try_collect()
            .await
    }

    // ── SEND ─────────────────────────────────────────────────────

    /// Upload `source` to `path` with permission bits `mode`, stamping it
    /// with `mtime`. Returns the number of bytes sent.
    pub async fn push<R>(&mut self, mut source: R, path: &str, mode: u32, mtime: u32) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.begin("push")?;
        tracing::debug!(path, mode = format_args!("{mode:o}"), mtime, "push");
        self.send(SyncRequest::Send {
            path: path.to_string(),
            mode,
        })
        .await?;

        let mut buf = vec![0u8; SYNC_DATA_MAX];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf).await.map_err(AdbError::Io)?;
            if n == 0 {
                break;
            }
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            if let Err(e) = self.framed.feed(SyncRequest::Data(chunk)).await {
                return Err(self.failure_after_write_error(e).await);
            }
            total += n as u64;
        }
        if let Err(e) = self.send(SyncRequest::Done(mtime)).await {
            return Err(self.failure_after_write_error(e).await);
        }

        match self.recv().await? {
            SyncResponse::Okay => {
                self.dirty = false;
                tracing::debug!(path, bytes = total, "push complete");
                Ok(total)
            }
            SyncResponse::Fail(msg) => Err(AdbError::Service(msg)),
            other => Err(unexpected(&other, "SEND")),
        }
    }

    /// A device that rejects an upload answers `FAIL` and closes, which
    /// surfaces locally as a write error. Prefer the device's message.
    async fn failure_after_write_error(&mut self, error: AdbError) -> AdbError {
        match self.recv().await {
            Ok(SyncResponse::Fail(msg)) => AdbError::Service(msg),
            _ => error,
        }
    }

    /// Upload a byte slice with the current time as mtime.
    pub async fn push_bytes(&mut self, data: &[u8], path: &str, mode: u32) -> Result<u64> {
        self.push(data, path, mode, unix_now()).await
    }

    /// Upload everything `reader` yields with the current time as mtime.
    pub async fn push_from<R>(&mut self, reader: R, path: &str, mode: u32) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.push(reader, path, mode, unix_now()).await
    }

    /// Upload a local file. When `remote` is a directory the local file
    /// name is appended.
    pub async fn push_file(&mut self, local: &Path, remote: &str, mode: u32) -> Result<u64> {
        let mut target = remote.to_string();
        if self.stat(remote).await?.is_dir() {
            let name = local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| AdbError::protocol(format!("{} has no file name", local.display())))?;
            if !target.ends_with('/') {
                target.push('/');
            }
            target.push_str(name);
            tracing::debug!(%target, "remote is a directory");
        }
        let file = tokio::fs::File::open(local).await.map_err(AdbError::Io)?;
        self.push_from(file, &target, mode).await
    }

    // ── RECV ─────────────────────────────────────────────────────

    /// Lazily download `path`. The stream ends at `DONE`; a `FAIL` ends it
    /// with an error. Nothing already yielded is rolled back.
    pub fn pull<'a>(&'a mut self, path: &str) -> impl Stream<Item = Result<Bytes>> + 'a {
        let pending = Some(path.to_string());
        stream::try_unfold((self, pending), |(session, pending)| async move {
            if let Some(path) = pending {
                session.begin("pull")?;
                tracing::debug!(%path, "pull");
                session.send(SyncRequest::Recv(path)).await?;
            }
            match session.recv().await? {
                SyncResponse::Data(chunk) => Ok(Some((chunk, (session, None)))),
                SyncResponse::Done => {
                    session.dirty = false;
                    Ok(None)
                }
                SyncResponse::Fail(msg) => Err(AdbError::Service(msg)),
                other => Err(unexpected(&other, "RECV")),
            }
        })
    }

    /// Download `path` into `writer`, returning the byte count.
    pub async fn pull_to<W>(&mut self, path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunks = std::pin::pin!(self.pull(path));
        let mut total = 0u64;
        while let Some(chunk) = chunks.try_next().await? {
            writer.write_all(&chunk).await.map_err(AdbError::Io)?;
            total += chunk.len() as u64;
        }
        writer.flush().await.map_err(AdbError::Io)?;
        Ok(total)
    }

    /// Download `path` into memory.
    pub async fn read_bytes(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.pull_to(path, &mut out).await?;
        Ok(out)
    }

    /// Download `path` into a local file. A partially written file is left
    /// in place on failure.
    pub async fn pull_file(&mut self, remote: &str, local: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::create(local).await.map_err(AdbError::Io)?;
        self.pull_to(remote, &mut file).await
    }

    /// Download a remote directory tree into `local`, creating directories
    /// as needed. Entries that are neither files nor directories are
    /// skipped. Returns the number of bytes written.
    pub async fn pull_dir(&mut self, remote: &str, local: &Path) -> Result<u64> {
        let root = match remote.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        let mut pending = vec![(root, local.to_path_buf())];
        let mut total = 0u64;
        while let Some((dir, target)) = pending.pop() {
            tokio::fs::create_dir_all(&target)
                .await
                .map_err(AdbError::Io)?;
            for entry in self.list_all(&dir).await? {
                if entry.name.contains('/') {
                    tracing::warn!(name = %entry.name, "skipping entry with a path separator");
                    continue;
                }
                let remote_child = if dir.ends_with('/') {
                    format!("{dir}{}", entry.name)
                } else {
                    format!("{dir}/{}", entry.name)
                };
                let local_child = target.join(&entry.name);
                let stat = entry.stat();
                if stat.is_dir() {
                    pending.push((remote_child, local_child));
                } else if stat.is_file() {
                    total += self.pull_file(&remote_child, &local_child).await?;
                } else {
                    tracing::debug!(path = %remote_child, mode = format_args!("{:o}", entry.mode), "skipping special file");
                }
            }
        }
        tracing::debug!(remote, bytes = total, "directory pulled");
        Ok(total)
    }

    /// Download `remote` to `local`, recursing when it is a directory.
    pub async fn pull_path(&mut self, remote: &str, local: &Path) -> Result<u64> {
        if self.stat(remote).await?.is_dir() {
            self.pull_dir(remote, local).await
        } else {
            self.pull_file(remote, local).await
        }
    }

    // ── QUIT ─────────────────────────────────────────────────────

    /// End the session politely and close the socket.
    pub async fn quit(mut self) -> Result<()> {
        if !self.dirty {
            self.send(SyncRequest::Quit).await?;
        }
        self.framed.close().await
    }
}

// ── Device entry point ───────────────────────────────────────────

impl AdbDevice {
    /// Open a sync session on this device.
    pub async fn sync(&self) -> Result<SyncSession> {
        let mut conn = self
            .client
            .open_device_request(&self.selector, &DeviceRequest::Sync)
            .await?;
        conn.state_mut().enter_sync()?;
        Ok(SyncSession::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio_test::io::Builder;
    use tokio_util::codec::Encoder;

    fn wire(requests: Vec<SyncRequest>) -> Vec<u8> {
        let mut codec = SyncCodec::new();
        let mut buf = BytesMut::new();
        for request in requests {
            codec.encode(request, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn session(mock: tokio_test::io::Mock) -> SyncSession<tokio_test::io::Mock> {
        SyncSession::new(AdbConnection::new(mock, None))
    }

    #[tokio::test]
    async fn stat_missing_file_is_zeroed() {
        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::Stat("/nope".into())]))
            .read(b"STAT\0\0\0\0\0\0\0\0\0\0\0\0")
            .build();
        let mut sync = session(mock);
        let stat = sync.stat("/nope").await.unwrap();
        assert!(!stat.exists());
        assert!(sync.is_usable());
    }

    #[tokio::test]
    async fn list_yields_entries_until_done() {
        let mut reply = BytesMut::new();
        for name in [&b"."[..], b"..", b"hosts"] {
            reply.put_slice(b"DENT");
            reply.put_u32_le(0o100644);
            reply.put_u32_le(10);
            reply.put_u32_le(1);
            reply.put_u32_le(name.len() as u32);
            reply.put_slice(name);
        }
        reply.put_slice(b"DONE");
        reply.put_bytes(0, 16);

        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::List("/etc".into())]))
            .read(&reply)
            .build();
        let mut sync = session(mock);
        let entries = sync.list_all("/etc").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hosts");
        assert!(sync.is_usable());
    }

    #[tokio::test]
    async fn push_chunks_at_64k() {
        let data = vec![7u8; SYNC_DATA_MAX + 1];
        let expected = wire(vec![
            SyncRequest::Send {
                path: "/data/local/tmp/blob".into(),
                mode: 0o644,
            },
            SyncRequest::Data(Bytes::copy_from_slice(&data[..SYNC_DATA_MAX])),
            SyncRequest::Data(Bytes::copy_from_slice(&data[SYNC_DATA_MAX..])),
            SyncRequest::Done(1234),
        ]);
        let mock = Builder::new()
            .write(&expected)
            .read(b"OKAY\0\0\0\0")
            .build();
        let mut sync = session(mock);
        let sent = sync
            .push(&data[..], "/data/local/tmp/blob", 0o644, 1234)
            .await
            .unwrap();
        assert_eq!(sent, data.len() as u64);
    }

    #[tokio::test]
    async fn push_fail_carries_device_message() {
        let expected = wire(vec![
            SyncRequest::Send {
                path: "/system/x".into(),
                mode: 0o644,
            },
            SyncRequest::Done(1),
        ]);
        let mock = Builder::new()
            .write(&expected)
            .read(b"FAIL\x11\0\0\0Read-only file sy")
            .build();
        let mut sync = session(mock);
        let err = sync.push(&b""[..], "/system/x", 0o644, 1).await.unwrap_err();
        assert_eq!(err.service_message(), Some("Read-only file sy"));
    }

    #[tokio::test]
    async fn pull_concatenates_data_records() {
        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::Recv("/sdcard/a.txt".into())]))
            .read(b"DATA\x03\0\0\0abc")
            .read(b"DATA\x02\0\0\0de")
            .read(b"DONE\0\0\0\0")
            .build();
        let mut sync = session(mock);
        assert_eq!(sync.read_bytes("/sdcard/a.txt").await.unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn pull_fail_mid_stream_keeps_partial_output() {
        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::Recv("/x".into())]))
            .read(b"DATA\x01\0\0\0a")
            .read(b"FAIL\x04\0\0\0gone")
            .build();
        let mut sync = session(mock);
        let mut out = Vec::new();
        let err = sync.pull_to("/x", &mut out).await.unwrap_err();
        assert_eq!(err.service_message(), Some("gone"));
        assert_eq!(out, b"a");
        assert!(!sync.is_usable());
    }

    #[tokio::test]
    async fn abandoned_pull_blocks_further_requests() {
        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::Recv("/big".into())]))
            .read(b"DATA\x01\0\0\0a")
            .build();
        let mut sync = session(mock);
        {
            let mut chunks = std::pin::pin!(sync.pull("/big"));
            assert_eq!(&chunks.next().await.unwrap().unwrap()[..], b"a");
        }
        assert!(matches!(
            sync.stat("/big").await,
            Err(AdbError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn quit_is_sent_on_clean_session() {
        let mock = Builder::new().write(b"QUIT\0\0\0\0").build();
        session(mock).quit().await.unwrap();
    }

    fn dent(reply: &mut BytesMut, name: &str, mode: u32, size: u32) {
        reply.put_slice(b"DENT");
        reply.put_u32_le(mode);
        reply.put_u32_le(size);
        reply.put_u32_le(1);
        reply.put_u32_le(name.len() as u32);
        reply.put_slice(name.as_bytes());
    }

    fn list_done(reply: &mut BytesMut) {
        reply.put_slice(b"DONE");
        reply.put_bytes(0, 16);
    }

    fn file_body(data: &[u8]) -> Vec<u8> {
        let mut reply = BytesMut::new();
        reply.put_slice(b"DATA");
        reply.put_u32_le(data.len() as u32);
        reply.put_slice(data);
        reply.put_slice(b"DONE\0\0\0\0");
        reply.to_vec()
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("adbwire-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn pull_path_walks_nested_directories() {
        let mut stat = BytesMut::new();
        stat.put_slice(b"STAT");
        stat.put_u32_le(0o040755);
        stat.put_u32_le(4096);
        stat.put_u32_le(1);

        let mut top = BytesMut::new();
        dent(&mut top, ".", 0o040755, 0);
        dent(&mut top, "..", 0o040755, 0);
        dent(&mut top, "a.txt", 0o100644, 3);
        dent(&mut top, "sub", 0o040755, 0);
        dent(&mut top, "fifo", 0o010644, 0);
        list_done(&mut top);

        let mut sub = BytesMut::new();
        dent(&mut sub, "b.txt", 0o100644, 2);
        list_done(&mut sub);

        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::Stat("/sdcard/d/".into())]))
            .read(&stat)
            .write(&wire(vec![SyncRequest::List("/sdcard/d".into())]))
            .read(&top)
            .write(&wire(vec![SyncRequest::Recv("/sdcard/d/a.txt".into())]))
            .read(&file_body(b"aaa"))
            .write(&wire(vec![SyncRequest::List("/sdcard/d/sub".into())]))
            .read(&sub)
            .write(&wire(vec![SyncRequest::Recv("/sdcard/d/sub/b.txt".into())]))
            .read(&file_body(b"bb"))
            .build();

        let local = scratch_dir("pull-tree");
        let mut sync = session(mock);
        let total = sync.pull_path("/sdcard/d/", &local).await.unwrap();
        assert_eq!(total, 5);
        assert!(sync.is_usable());
        assert_eq!(std::fs::read(local.join("a.txt")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(local.join("sub").join("b.txt")).unwrap(), b"bb");
        assert!(!local.join("fifo").exists());
        std::fs::remove_dir_all(&local).unwrap();
    }

    #[tokio::test]
    async fn pull_path_on_a_file_pulls_it() {
        let mut stat = BytesMut::new();
        stat.put_slice(b"STAT");
        stat.put_u32_le(0o100644);
        stat.put_u32_le(2);
        stat.put_u32_le(1);

        let mock = Builder::new()
            .write(&wire(vec![SyncRequest::Stat("/etc/hosts".into())]))
            .read(&stat)
            .write(&wire(vec![SyncRequest::Recv("/etc/hosts".into())]))
            .read(&file_body(b"hi"))
            .build();

        let local = scratch_dir("pull-file");
        std::fs::create_dir_all(&local).unwrap();
        let target = local.join("hosts");
        let mut sync = session(mock);
        assert_eq!(sync.pull_path("/etc/hosts", &target).await.unwrap(), 2);
        assert_eq!(std::fs::read(&target).unwrap(), b"hi");
        std::fs::remove_dir_all(&local).unwrap();
    }
}
