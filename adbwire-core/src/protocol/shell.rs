//! Shell command execution.
//!
//! # Wire Protocol
//!
//! ```text
//! Client ──[shell:<cmd> | shell,raw:<cmd>]──────► Device     (v1)
//! Device ──[raw interleaved output ... close]───► Client
//!
//! Client ──[shell,v2,TERM=<term>,raw:<cmd>]─────► Device     (v2)
//! Device ──[1 stdout][2 stderr]...[3 exit]──────► Client
//! ```
//!
//! v1 has no exit status of its own. When capture is requested the command
//! is suffixed with `; echo EXIT:$?` and the last marker in the output is
//! split off and parsed.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::client::AdbDevice;
use crate::codec::shell::{ShellCodec, ShellFraming, ShellPacket};
use crate::error::{AdbError, Result};
use crate::network::AdbConnection;
use crate::network::connection::deadline;
use crate::request::{DeviceRequest, ShellService};
use crate::types::ShellResult;

/// Marker echoed after a v1 command to recover its exit status.
pub const EXIT_MARKER: &[u8] = b"EXIT:";

/// Device feature that enables the v2 shell protocol.
pub const FEATURE_SHELL_V2: &str = "shell_v2";

// ── Options ──────────────────────────────────────────────────────

/// Which shell protocol to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellProtocol {
    /// v2 when the device advertises `shell_v2`, otherwise legacy v1.
    #[default]
    Auto,
    /// `shell,raw:`.
    V1,
    /// `shell:`, for devices that predate shell service options.
    Legacy,
    /// `shell,v2,...` with separate stdout, stderr and exit code.
    V2,
}

/// Per-call shell settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellOptions {
    pub protocol: ShellProtocol,
    /// Append the exit-code sentinel to v1 commands.
    pub capture_exit: bool,
    /// Deadline for the whole command, on top of the per-read timeout.
    pub timeout: Option<Duration>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            protocol: ShellProtocol::Auto,
            capture_exit: true,
            timeout: None,
        }
    }
}

impl ShellOptions {
    pub fn with_protocol(mut self, protocol: ShellProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_capture_exit(mut self, capture: bool) -> Self {
        self.capture_exit = capture;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn framing_of(service: &ShellService) -> ShellFraming {
    match service {
        ShellService::V2 { .. } => ShellFraming::V2,
        ShellService::Legacy | ShellService::Raw => ShellFraming::V1,
    }
}

// ── Exit marker ──────────────────────────────────────────────────

/// Split the exit-code marker off v1 output.
///
/// Returns `Ok(None)` when no marker is present. Output after the last
/// marker must be a decimal exit code.
fn split_exit_marker(output: &mut Vec<u8>) -> Result<Option<u8>> {
    let Some(pos) = output
        .windows(EXIT_MARKER.len())
        .rposition(|w| w == EXIT_MARKER)
    else {
        return Ok(None);
    };
    let tail = String::from_utf8_lossy(&output[pos + EXIT_MARKER.len()..]).into_owned();
    let code = tail
        .trim()
        .parse::<u8>()
        .map_err(|_| AdbError::protocol(format!("invalid exit status {:?}", tail.trim())))?;
    output.truncate(pos);
    Ok(Some(code))
}

// ── One-shot execution ───────────────────────────────────────────

async fn collect_output<S>(
    framed: &mut Framed<S, ShellCodec>,
    read_timeout: Option<Duration>,
    result: &mut ShellResult,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framing = framed.codec().framing();
    loop {
        let next = deadline(read_timeout, async { framed.next().await.transpose() }).await?;
        match next {
            Some(ShellPacket::Stdout(chunk)) => result.stdout.extend_from_slice(&chunk),
            Some(ShellPacket::Stderr(chunk)) => result.stderr.extend_from_slice(&chunk),
            Some(ShellPacket::Exit(code)) => {
                result.exit_code = Some(code);
                return Ok(());
            }
            Some(other) => tracing::trace!(?other, "ignoring shell packet"),
            None if framing == ShellFraming::V1 => return Ok(()),
            None => return Err(AdbError::closed()),
        }
    }
}

/// Run `command` on a device-bound connection and collect its output.
///
/// With `capture_exit`, v1 commands get the exit-code sentinel appended.
/// A close before the exit status arrives yields
/// [`AdbError::ConnectionClosed`] carrying the partial [`ShellResult`].
pub async fn run_shell<S>(
    mut conn: AdbConnection<S>,
    command: &str,
    service: ShellService,
    capture_exit: bool,
) -> Result<ShellResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framing = framing_of(&service);
    let capture = capture_exit && framing == ShellFraming::V1;
    let wire_command = if capture {
        format!("{command}; echo EXIT:$?")
    } else {
        command.to_string()
    };

    let request = DeviceRequest::Shell {
        service,
        command: wire_command,
    };
    conn.send_request(&request.to_wire()).await?;
    conn.check_okay().await?;
    conn.state_mut().enter_shell()?;

    let read_timeout = conn.read_timeout();
    let mut framed = conn.into_framed(ShellCodec::new(framing));
    let mut result = ShellResult {
        command: command.to_string(),
        ..ShellResult::default()
    };

    if let Err(e) = collect_output(&mut framed, read_timeout, &mut result).await {
        return Err(e.with_shell_partial(result));
    }

    if capture {
        match split_exit_marker(&mut result.stdout)? {
            Some(code) => result.exit_code = Some(code),
            None => return Err(AdbError::closed().with_shell_partial(result)),
        }
    }
    tracing::debug!(
        command,
        exit_code = ?result.exit_code,
        stdout = result.stdout.len(),
        stderr = result.stderr.len(),
        "shell finished"
    );
    Ok(result)
}

// ── Interactive stream ───────────────────────────────────────────

/// A live shell connection.
///
/// Yields [`ShellPacket`]s from the device and accepts stdin or control
/// packets. v1 streams yield everything as `Stdout` and never an `Exit`.
/// Dropping the stream closes the socket, which is the only way to cancel
/// the remote command.
///
/// A v2 stream that closes before the exit packet yields one
/// [`AdbError::ConnectionClosed`] before ending.
#[derive(Debug)]
pub struct ShellStream<S = TcpStream> {
    framed: Framed<S, ShellCodec>,
    exited: bool,
    ended: bool,
}

impl<S> ShellStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a shell request on a device-bound connection and hand back the
    /// open stream.
    pub async fn open(mut conn: AdbConnection<S>, command: &str, service: ShellService) -> Result<Self> {
        let framing = framing_of(&service);
        let request = DeviceRequest::Shell {
            service,
            command: command.to_string(),
        };
        conn.send_request(&request.to_wire()).await?;
        conn.check_okay().await?;
        conn.state_mut().enter_shell()?;
        Ok(Self {
            framed: conn.into_framed(ShellCodec::new(framing)),
            exited: false,
            ended: false,
        })
    }

    pub fn framing(&self) -> ShellFraming {
        self.framed.codec().framing()
    }

    /// Write bytes to the remote stdin.
    pub async fn write_stdin(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.framed.send(ShellPacket::Stdin(data.into())).await
    }

    /// Signal end of input (v2 only).
    pub async fn close_stdin(&mut self) -> Result<()> {
        self.framed.send(ShellPacket::CloseStdin).await
    }

    /// Tell the remote terminal its new size (v2 only).
    pub async fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.framed
            .send(ShellPacket::WindowSize {
                rows,
                cols,
                x_pixels: 0,
                y_pixels: 0,
            })
            .await
    }

    /// Return the underlying socket.
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}

impl<S> Stream for ShellStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<ShellPacket>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        let item = match ready!(Pin::new(&mut this.framed).poll_next(cx)) {
            Some(Ok(ShellPacket::Exit(code))) => {
                this.exited = true;
                Some(Ok(ShellPacket::Exit(code)))
            }
            Some(Err(e)) => {
                this.ended = true;
                Some(Err(e))
            }
            None => {
                this.ended = true;
                if this.framed.codec().framing() == ShellFraming::V2 && !this.exited {
                    tracing::debug!("shell stream closed before exit status");
                    Some(Err(AdbError::closed()))
                } else {
                    None
                }
            }
            other => other,
        };
        Poll::Ready(item)
    }
}

impl<S> Sink<ShellPacket> for ShellStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = AdbError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.get_mut().framed).poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: ShellPacket) -> Result<()> {
        Pin::new(&mut self.get_mut().framed).start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.get_mut().framed).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.get_mut().framed).poll_close(cx)
    }
}

// ── Device entry points ──────────────────────────────────────────

impl AdbDevice {
    /// Turn a [`ShellProtocol`] into a concrete service, consulting the
    /// device's features for [`ShellProtocol::Auto`].
    pub async fn shell_service(&self, protocol: ShellProtocol) -> Result<ShellService> {
        let term = self.client.config().shell_term.clone();
        let service = match protocol {
            ShellProtocol::V1 => ShellService::Raw,
            ShellProtocol::Legacy => ShellService::Legacy,
            ShellProtocol::V2 => ShellService::V2 { term, pty: false },
            ShellProtocol::Auto => {
                if self.features().await?.contains(FEATURE_SHELL_V2) {
                    ShellService::V2 { term, pty: false }
                } else {
                    tracing::warn!(
                        device = %self.selector,
                        "device lacks shell_v2; falling back to v1 with exit marker"
                    );
                    ShellService::Legacy
                }
            }
        };
        Ok(service)
    }

    /// Run `command` with default options and collect its output.
    pub async fn shell(&self, command: &str) -> Result<ShellResult> {
        self.shell_with(command, ShellOptions::default()).await
    }

    /// Run `command` and collect its output.
    pub async fn shell_with(&self, command: &str, options: ShellOptions) -> Result<ShellResult> {
        let service = self.shell_service(options.protocol).await?;
        deadline(options.timeout, async {
            let conn = self.client.bind_device(&self.selector).await?;
            run_shell(conn, command, service, options.capture_exit).await
        })
        .await
    }

    /// Start `command` and hand back the live stream. An empty command
    /// opens a login shell, with a pty when speaking v2.
    pub async fn open_shell(&self, command: &str, protocol: ShellProtocol) -> Result<ShellStream> {
        let service = match self.shell_service(protocol).await? {
            ShellService::V2 { term, .. } => ShellService::V2 {
                term,
                pty: command.is_empty(),
            },
            other => other,
        };
        let conn = self.client.bind_device(&self.selector).await?;
        ShellStream::open(conn, command, service).await
    }
}
