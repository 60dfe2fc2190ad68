//! Connection cursor state machine.
//!
//! Every socket to the ADB server starts unbound, may issue host requests,
//! may bind to exactly one device, and then enters at most one
//! sub-protocol. There is no way back: switching to another sub-protocol
//! needs a fresh connection. Transitions are validated and return `Result`
//! instead of panicking.

use std::fmt;

use crate::error::{AdbError, Result};

// ── ConnectionState ──────────────────────────────────────────────

/// Where a connection is in its single-use lifecycle.
///
/// ```text
///  Unbound ──► HostBound ──► DeviceBound ──► SyncMode
///     │            │              │      └──► ShellMode
///     │            │              └─────────► Raw
///     └────────────┴──────────────┴─────────► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Socket open, nothing sent yet.
    #[default]
    Unbound,

    /// A host service has been requested and acknowledged. Streaming host
    /// services such as `track-devices` stay here.
    HostBound,

    /// The server switched the connection to a device transport.
    DeviceBound,

    /// The device accepted `sync:`.
    SyncMode,

    /// The device accepted a `shell` service.
    ShellMode,

    /// The device accepted any other local service and the socket is now an
    /// opaque byte pipe.
    Raw,

    /// Closed, timed out or failed mid-protocol. Never reused.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unbound => "unbound",
            Self::HostBound => "host-bound",
            Self::DeviceBound => "device-bound",
            Self::SyncMode => "sync-mode",
            Self::ShellMode => "shell-mode",
            Self::Raw => "raw",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    /// Returns `true` while another request may still be written.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, Self::Unbound | Self::DeviceBound)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    fn violation(&self, action: &str) -> AdbError {
        AdbError::protocol(format!("cannot {action}: connection is {self}"))
    }

    // ── Transitions ──────────────────────────────────────────────

    /// A host service acknowledged `OKAY`.
    ///
    /// Valid from: `Unbound`.
    pub fn host_request(&mut self) -> Result<()> {
        match self {
            Self::Unbound => {
                *self = Self::HostBound;
                Ok(())
            }
            _ => Err(self.violation("issue a host request")),
        }
    }

    /// A `host:transport*` request acknowledged `OKAY`.
    ///
    /// Valid from: `Unbound`.
    pub fn bind_device(&mut self) -> Result<()> {
        match self {
            Self::Unbound => {
                *self = Self::DeviceBound;
                Ok(())
            }
            _ => Err(self.violation("bind a device")),
        }
    }

    /// The device accepted `sync:`.
    ///
    /// Valid from: `DeviceBound`.
    pub fn enter_sync(&mut self) -> Result<()> {
        self.enter_device_service(Self::SyncMode, "enter sync mode")
    }

    /// The device accepted a shell service.
    ///
    /// Valid from: `DeviceBound`.
    pub fn enter_shell(&mut self) -> Result<()> {
        self.enter_device_service(Self::ShellMode, "enter shell mode")
    }

    /// The device accepted some other local service.
    ///
    /// Valid from: `DeviceBound`.
    pub fn enter_raw(&mut self) -> Result<()> {
        self.enter_device_service(Self::Raw, "open a device service")
    }

    fn enter_device_service(&mut self, next: Self, action: &str) -> Result<()> {
        match self {
            Self::DeviceBound => {
                *self = next;
                Ok(())
            }
            _ => Err(self.violation(action)),
        }
    }

    /// Move to `Closed` regardless of the current state.
    pub fn close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_request_lifecycle() {
        let mut state = ConnectionState::default();
        assert!(state.accepts_requests());
        state.host_request().unwrap();
        assert_eq!(state, ConnectionState::HostBound);
        assert!(!state.accepts_requests());
        state.close();
        assert!(state.is_closed());
    }

    #[test]
    fn device_sync_lifecycle() {
        let mut state = ConnectionState::Unbound;
        state.bind_device().unwrap();
        assert!(state.accepts_requests());
        state.enter_sync().unwrap();
        assert_eq!(state, ConnectionState::SyncMode);
    }

    #[test]
    fn sub_protocols_are_exclusive() {
        let mut state = ConnectionState::Unbound;
        state.bind_device().unwrap();
        state.enter_shell().unwrap();
        assert!(state.enter_sync().is_err());
        assert!(state.enter_raw().is_err());
        assert!(state.bind_device().is_err());
    }

    #[test]
    fn device_service_requires_binding() {
        let mut state = ConnectionState::Unbound;
        assert!(state.enter_sync().is_err());
        state.host_request().unwrap();
        assert!(state.enter_shell().is_err());
        assert!(state.bind_device().is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let mut state = ConnectionState::DeviceBound;
        state.close();
        assert!(state.host_request().is_err());
        assert!(state.bind_device().is_err());
        assert!(state.enter_sync().is_err());
        assert!(!state.accepts_requests());
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionState::Unbound.to_string(), "unbound");
        assert_eq!(ConnectionState::DeviceBound.to_string(), "device-bound");
        assert_eq!(ConnectionState::SyncMode.to_string(), "sync-mode");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
