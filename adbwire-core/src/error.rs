//! Domain-specific error types for the ADB host protocol.
//!
//! All fallible operations return `Result<T, AdbError>`.
//! A `FAIL` reply from the server is an ordinary [`AdbError::Service`] value,
//! not a panic, and wire-level failures are never swallowed or retried here.

use std::time::Duration;

use thiserror::Error;

use crate::types::ShellResult;

/// Alias for `Result<T, adbwire_core::AdbError>`.
pub type Result<T> = std::result::Result<T, AdbError>;

/// The canonical error type for the ADB client engine.
#[derive(Debug, Error)]
pub enum AdbError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Malformed status, length, opcode or payload. Indicates a bug or an
    /// incompatible server and is never worth retrying.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request body does not fit in a single hex-length frame.
    #[error("request too large: {size} bytes (max {max})")]
    RequestTooLarge { size: usize, max: usize },

    // ── Service Errors ───────────────────────────────────────────
    /// The server answered `FAIL`; the message is preserved verbatim.
    #[error("adb server: {0}")]
    Service(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The peer closed the socket mid-operation. Whatever was read before
    /// the close is attached.
    #[error("connection closed by peer{}", .partial.describe())]
    ConnectionClosed { partial: PartialData },

    /// No data within the caller's deadline. The connection that timed out
    /// has already been dropped.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The TCP/IO layer reported an error other than closure or timeout.
    #[error("connection error: {0}")]
    Io(#[source] std::io::Error),

    // ── Device Selection ─────────────────────────────────────────
    /// No device in state `device` is visible to the server.
    #[error("no device connected")]
    NoDevice,

    /// More than one device is visible and no serial was given.
    #[error("more than one device connected ({0}), specify a serial")]
    MultipleDevices(usize),

    // ── Configuration ────────────────────────────────────────────
    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Data read before a connection was lost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PartialData {
    /// Nothing had been read yet.
    #[default]
    None,
    /// Raw bytes of an incomplete frame or record.
    Bytes(Vec<u8>),
    /// Shell output captured before the exit marker arrived.
    Shell(Box<ShellResult>),
}

impl PartialData {
    fn describe(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Bytes(b) => format!(" after {} bytes", b.len()),
            Self::Shell(r) => format!(
                " (partial shell output: {} stdout bytes, {} stderr bytes)",
                r.stdout.len(),
                r.stderr.len()
            ),
        }
    }

    /// Returns `true` when nothing had been read.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Shell(r) => r.stdout.is_empty() && r.stderr.is_empty(),
        }
    }
}

impl AdbError {
    /// Shorthand for a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        AdbError::Protocol(msg.into())
    }

    /// A `ConnectionClosed` error with nothing attached.
    pub fn closed() -> Self {
        AdbError::ConnectionClosed {
            partial: PartialData::None,
        }
    }

    /// Returns `true` for the protocol kind: malformed wire data and
    /// requests too large to frame.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            AdbError::Protocol(_) | AdbError::RequestTooLarge { .. }
        )
    }

    /// Returns `true` for kinds where a caller-level retry may succeed.
    ///
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdbError::Timeout(_) | AdbError::ConnectionClosed { .. }
        )
    }

    /// The server's message when this is a `FAIL` reply.
    pub fn service_message(&self) -> Option<&str> {
        match self {
            AdbError::Service(msg) => Some(msg),
            _ => None,
        }
    }

    /// Attach partial shell output to a `ConnectionClosed` error.
    pub(crate) fn with_shell_partial(self, partial: ShellResult) -> Self {
        match self {
            AdbError::ConnectionClosed { .. } => AdbError::ConnectionClosed {
                partial: PartialData::Shell(Box::new(partial)),
            },
            other => other,
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<std::io::Error> for AdbError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => AdbError::closed(),
            ErrorKind::TimedOut => AdbError::Timeout(Duration::ZERO),
            _ => AdbError::Io(e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AdbError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AdbError::Timeout(Duration::ZERO)
    }
}

impl From<std::string::FromUtf8Error> for AdbError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        AdbError::Protocol(format!("invalid utf-8: {e}"))
    }
}

impl From<std::num::ParseIntError> for AdbError {
    fn from(e: std::num::ParseIntError) -> Self {
        AdbError::Protocol(format!("invalid number: {e}"))
    }
}
