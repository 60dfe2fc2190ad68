//! A single framed connection to the ADB server.
//!
//! One connection carries at most one host request, or one device binding
//! followed by one device-local service. Reads loop until satisfied, so a
//! partially delivered status or frame is never mistaken for a complete one.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::{self, LEN_PREFIX, Status};
use crate::config::AdbConfig;
use crate::error::{AdbError, PartialData, Result};
use crate::state::ConnectionState;

/// Run `fut` under an optional deadline.
pub(crate) async fn deadline<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| AdbError::Timeout(d))?,
        None => fut.await,
    }
}

/// A socket to the ADB server plus its cursor state.
///
/// Generic over the transport so the same request logic runs against a
/// `TcpStream` in production and an in-memory mock in tests.
#[derive(Debug)]
pub struct AdbConnection<S = TcpStream> {
    stream: S,
    state: ConnectionState,
    read_timeout: Option<Duration>,
    transport_id: Option<u64>,
}

impl AdbConnection<TcpStream> {
    /// Connect to the server named by `config`, honouring its connect and
    /// read timeouts.
    pub async fn open(config: &AdbConfig) -> Result<Self> {
        let addr = config.address();
        let limit = config.connect_timeout();
        tracing::trace!(%addr, ?limit, "connecting to adb server");

        let stream = match limit {
            Some(d) => tokio::time::timeout(d, TcpStream::connect(&addr))
                .await
                .map_err(|_| AdbError::Timeout(d))?,
            None => TcpStream::connect(&addr).await,
        }
        .map_err(AdbError::Io)?;
        stream.set_nodelay(true).map_err(AdbError::Io)?;

        Ok(Self::new(stream, config.read_timeout()))
    }
}

impl<S> AdbConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream.
    pub fn new(stream: S, read_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            state: ConnectionState::Unbound,
            read_timeout,
            transport_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Transport id reported by a `tport` binding.
    pub fn transport_id(&self) -> Option<u64> {
        self.transport_id
    }

    pub(crate) fn set_transport_id(&mut self, id: u64) {
        self.transport_id = Some(id);
    }

    // ── Writing ──────────────────────────────────────────────────

    /// Send one service request as a single hex-length frame.
    pub async fn send_request(&mut self, text: &str) -> Result<()> {
        if !self.state.accepts_requests() {
            return Err(AdbError::protocol(format!(
                "cannot send {text:?}: connection is {}",
                self.state
            )));
        }
        let frame = codec::encode_request(text)?;
        tracing::debug!(request = text, state = %self.state, "sending request");
        self.write_all(&frame).await
    }

    /// Write raw bytes, e.g. after the connection became an opaque pipe.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let result = async {
            self.stream.write_all(data).await?;
            self.stream.flush().await?;
            Ok::<_, AdbError>(())
        }
        .await;
        self.poison_on_error(result)
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Read exactly `n` bytes.
    ///
    /// A close before `n` bytes arrive yields `ConnectionClosed` carrying the
    /// bytes that did arrive.
    pub async fn read_raw(&mut self, n: usize) -> Result<Bytes> {
        let limit = self.read_timeout;
        let stream = &mut self.stream;
        let result = deadline(limit, async move {
            let mut buf = BytesMut::zeroed(n);
            let mut filled = 0;
            while filled < n {
                let read = stream.read(&mut buf[filled..]).await?;
                if read == 0 {
                    buf.truncate(filled);
                    return Err(AdbError::ConnectionClosed {
                        partial: PartialData::Bytes(buf.to_vec()),
                    });
                }
                filled += read;
            }
            Ok::<_, AdbError>(buf.freeze())
        })
        .await;
        if let Ok(bytes) = &result {
            tracing::trace!(len = bytes.len(), "read raw bytes");
        }
        self.poison_on_error(result)
    }

    /// Read a 4-byte `OKAY` / `FAIL` status word.
    pub async fn read_status(&mut self) -> Result<Status> {
        let word = self.read_raw(4).await?;
        let status = Status::parse(&word);
        if status.is_err() {
            self.state.close();
        }
        let status = status?;
        tracing::debug!(?status, "status received");
        Ok(status)
    }

    /// Like [`read_status`](Self::read_status), but a clean close before the
    /// first byte yields `None`.
    pub async fn read_optional_status(&mut self) -> Result<Option<Status>> {
        match self.read_status().await {
            Ok(status) => Ok(Some(status)),
            Err(AdbError::ConnectionClosed { partial }) if partial.is_empty() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read a status and require `OKAY`. A `FAIL` is turned into
    /// [`AdbError::Service`] carrying the server's message; the connection
    /// is still consistent afterwards.
    pub async fn check_okay(&mut self) -> Result<()> {
        match self.read_status().await? {
            Status::Okay => Ok(()),
            Status::Fail => Err(self.read_failure().await),
        }
    }

    /// Read the message frame that follows a `FAIL`.
    pub(crate) async fn read_failure(&mut self) -> AdbError {
        match self.read_frame().await {
            Ok(body) => {
                let message = String::from_utf8_lossy(&body).into_owned();
                tracing::debug!(%message, "server answered FAIL");
                AdbError::Service(message)
            }
            Err(e) => e,
        }
    }

    /// Read one hex-length frame and return its body.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let prefix = self.read_raw(LEN_PREFIX).await?;
        let len = match codec::parse_hex_len(&prefix) {
            Ok(len) => len,
            Err(e) => {
                self.state.close();
                return Err(e);
            }
        };
        let body = self.read_raw(len).await?;
        tracing::trace!(len, "frame received");
        Ok(body)
    }

    /// Read one frame as UTF-8 text.
    pub async fn read_frame_string(&mut self) -> Result<String> {
        let body = self.read_frame().await?;
        Ok(String::from_utf8(body.to_vec())?)
    }

    /// Read an 8-byte little-endian integer (the `tport` transport id).
    pub async fn read_u64_le(&mut self) -> Result<u64> {
        let raw = self.read_raw(8).await?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read until the peer closes.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let limit = self.read_timeout;
        let stream = &mut self.stream;
        let result = deadline(limit, async move {
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await?;
            Ok::<_, AdbError>(out)
        })
        .await;
        self.poison_on_error(result)
    }

    // ── Hand-off ─────────────────────────────────────────────────

    /// Hand the socket to a sub-protocol codec.
    ///
    /// No bytes are buffered inside `AdbConnection`, so nothing is lost.
    pub fn into_framed<C>(self, codec: C) -> Framed<S, C> {
        Framed::new(self.stream, codec)
    }

    /// Give up the cursor and return the bare stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Shut down the write half and drop the socket.
    ///
    /// Errors are logged, not returned: the peer may already be gone.
    pub async fn close(mut self) {
        self.state.close();
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(error = %e, "shutdown after close");
        }
    }

    fn poison_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::trace!(error = %e, "connection poisoned");
            self.state.close();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn send_request_and_read_version_frame() {
        let mock = Builder::new()
            .write(b"000chost:version")
            .read(b"OKAY")
            .read(b"0004")
            .read(b"0029")
            .build();
        let mut conn = AdbConnection::new(mock, None);
        conn.send_request("host:version").await.unwrap();
        conn.check_okay().await.unwrap();
        let body = conn.read_frame_string().await.unwrap();
        assert_eq!(u32::from_str_radix(&body, 16).unwrap(), 41);
    }

    #[tokio::test]
    async fn reads_loop_over_short_chunks() {
        let mock = Builder::new().read(b"OK").read(b"A").read(b"Y").build();
        let mut conn = AdbConnection::new(mock, None);
        assert_eq!(conn.read_status().await.unwrap(), Status::Okay);
    }

    #[tokio::test]
    async fn fail_becomes_service_error() {
        let mock = Builder::new()
            .read(b"FAIL")
            .read(b"000edevice offline")
            .build();
        let mut conn = AdbConnection::new(mock, None);
        let err = conn.check_okay().await.unwrap_err();
        assert_eq!(err.service_message(), Some("device offline"));
        assert!(!conn.state().is_closed());
    }

    #[tokio::test]
    async fn garbage_status_is_protocol_error() {
        let mock = Builder::new().read(b"OKAZ").build();
        let mut conn = AdbConnection::new(mock, None);
        assert!(matches!(
            conn.read_status().await,
            Err(AdbError::Protocol(_))
        ));
        assert!(conn.state().is_closed());
    }

    #[tokio::test]
    async fn close_mid_frame_keeps_partial_bytes() {
        let mock = Builder::new().read(b"0008abc").build();
        let mut conn = AdbConnection::new(mock, None);
        match conn.read_frame().await {
            Err(AdbError::ConnectionClosed {
                partial: PartialData::Bytes(b),
            }) => assert_eq!(b, b"abc"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(conn.state().is_closed());
    }

    #[tokio::test]
    async fn clean_close_is_optional_status() {
        let mock = Builder::new().build();
        let mut conn = AdbConnection::new(mock, None);
        assert_eq!(conn.read_optional_status().await.unwrap(), None);
    }

    #[tokio::test]
    async fn requests_rejected_after_sub_protocol() {
        let mock = Builder::new().build();
        let mut conn = AdbConnection::new(mock, None);
        conn.state_mut().host_request().unwrap();
        assert!(conn.send_request("host:version").await.is_err());
    }

    #[tokio::test]
    async fn tport_transport_id_is_little_endian() {
        let mock = Builder::new()
            .read(b"OKAY")
            .read(&[7, 0, 0, 0, 0, 0, 0, 0])
            .build();
        let mut conn = AdbConnection::new(mock, None);
        conn.check_okay().await.unwrap();
        assert_eq!(conn.read_u64_le().await.unwrap(), 7);
    }
}
