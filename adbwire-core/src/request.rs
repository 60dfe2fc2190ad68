//! Typed service requests.
//!
//! Every request the engine can send is a variant of [`HostRequest`] (sent
//! on a fresh, unbound connection) or [`DeviceRequest`] (sent on a
//! connection already bound to one device). Each variant knows its wire
//! text and the shape of the reply that follows the first status.

use std::fmt;

use crate::types::{DeviceSelector, Endpoint};

// ── Response shapes ──────────────────────────────────────────────

/// What follows the first `OKAY` of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Nothing; the first `OKAY` is the whole answer.
    Status,
    /// One hex-length frame.
    Frame,
    /// An 8-byte little-endian transport id (`tport`).
    TransportId,
    /// A second `OKAY`/`FAIL` that reports completion (`wait-for`, reverse
    /// rule changes).
    TwoStatus,
    /// Forward-rule changes: an optional second status and, for `tcp:0`,
    /// a frame with the allocated port.
    Forward { allocates_port: bool },
    /// The connection stays open and the service streams data.
    Stream,
}

// ── Host requests ────────────────────────────────────────────────

/// Transport filter for `wait-for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTransport {
    #[default]
    Any,
    Usb,
    Local,
}

impl WaitTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Usb => "usb",
            Self::Local => "local",
        }
    }
}

/// Target state for `wait-for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitState {
    #[default]
    Device,
    Recovery,
    Rescue,
    Sideload,
    Bootloader,
    /// Wait until the device goes away.
    Disconnect,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Recovery => "recovery",
            Self::Rescue => "rescue",
            Self::Sideload => "sideload",
            Self::Bootloader => "bootloader",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Per-device queries answered by the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceQuery {
    State,
    SerialNo,
    DevPath,
    Features,
}

impl DeviceQuery {
    fn service(&self) -> &'static str {
        match self {
            Self::State => "get-state",
            Self::SerialNo => "get-serialno",
            Self::DevPath => "get-devpath",
            Self::Features => "features",
        }
    }
}

/// A request handled by the ADB server on an unbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    Version,
    Kill,
    Devices {
        long: bool,
    },
    TrackDevices {
        long: bool,
    },
    Connect(String),
    Disconnect(String),
    /// `host:transport:<serial>`.
    Transport(String),
    /// `host:transport-id:<id>`.
    TransportId(u64),
    /// `host:tport:serial:<serial>` or `host:tport:transport-id:<id>`.
    Tport(DeviceSelector),
    WaitFor {
        serial: Option<String>,
        transport: WaitTransport,
        state: WaitState,
    },
    ListForward {
        serial: Option<String>,
    },
    Forward {
        serial: String,
        local: Endpoint,
        remote: Endpoint,
        norebind: bool,
    },
    KillForward {
        serial: String,
        local: Endpoint,
    },
    KillForwardAll {
        serial: String,
    },
    Query {
        selector: DeviceSelector,
        query: DeviceQuery,
    },
}

fn device_prefix(selector: &DeviceSelector) -> String {
    match selector {
        DeviceSelector::Serial(serial) => format!("host-serial:{serial}"),
        DeviceSelector::TransportId(id) => format!("host-transport-id:{id}"),
    }
}

impl HostRequest {
    /// The request text carried in the hex-length frame.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Version => "host:version".into(),
            Self::Kill => "host:kill".into(),
            Self::Devices { long: false } => "host:devices".into(),
            Self::Devices { long: true } => "host:devices-l".into(),
            Self::TrackDevices { long: false } => "host:track-devices".into(),
            Self::TrackDevices { long: true } => "host:track-devices-l".into(),
            Self::Connect(addr) => format!("host:connect:{addr}"),
            Self::Disconnect(addr) => format!("host:disconnect:{addr}"),
            Self::Transport(serial) => format!("host:transport:{serial}"),
            Self::TransportId(id) => format!("host:transport-id:{id}"),
            Self::Tport(DeviceSelector::Serial(serial)) => format!("host:tport:serial:{serial}"),
            Self::Tport(DeviceSelector::TransportId(id)) => {
                format!("host:tport:transport-id:{id}")
            }
            Self::WaitFor {
                serial,
                transport,
                state,
            } => {
                let prefix = match serial {
                    Some(serial) => format!("host-serial:{serial}"),
                    None => "host".into(),
                };
                format!(
                    "{prefix}:wait-for-{}-{}",
                    transport.as_str(),
                    state.as_str()
                )
            }
            Self::ListForward { serial: None } => "host:list-forward".into(),
            Self::ListForward {
                serial: Some(serial),
            } => format!("host-serial:{serial}:list-forward"),
            Self::Forward {
                serial,
                local,
                remote,
                norebind,
            } => {
                let norebind = if *norebind { "norebind:" } else { "" };
                format!("host-serial:{serial}:forward:{norebind}{local};{remote}")
            }
            Self::KillForward { serial, local } => {
                format!("host-serial:{serial}:killforward:{local}")
            }
            Self::KillForwardAll { serial } => format!("host-serial:{serial}:killforward-all"),
            Self::Query { selector, query } => {
                format!("{}:{}", device_prefix(selector), query.service())
            }
        }
    }

    /// What the server sends after the first `OKAY`.
    pub fn response_shape(&self) -> ResponseShape {
        match self {
            Self::Kill | Self::Transport(_) | Self::TransportId(_) => ResponseShape::Status,
            Self::Version
            | Self::Devices { .. }
            | Self::Connect(_)
            | Self::Disconnect(_)
            | Self::ListForward { .. }
            | Self::Query { .. } => ResponseShape::Frame,
            Self::Tport(_) => ResponseShape::TransportId,
            Self::WaitFor { .. } => ResponseShape::TwoStatus,
            Self::Forward { local, .. } => ResponseShape::Forward {
                allocates_port: local.is_ephemeral_tcp(),
            },
            Self::KillForward { .. } | Self::KillForwardAll { .. } => ResponseShape::Forward {
                allocates_port: false,
            },
            Self::TrackDevices { .. } => ResponseShape::Stream,
        }
    }

    /// Returns `true` for requests that switch the connection to a device.
    pub fn binds_device(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::TransportId(_) | Self::Tport(_)
        )
    }
}

impl fmt::Display for HostRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

// ── Device requests ──────────────────────────────────────────────

/// Which shell service variant to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellService {
    /// `shell:<cmd>`, the pre-`raw` form understood by every device.
    Legacy,
    /// `shell,raw:<cmd>`.
    Raw,
    /// `shell,v2,TERM=<term>,raw:<cmd>`, or `pty:` instead of `raw:` for an
    /// interactive terminal.
    V2 { term: String, pty: bool },
}

/// A request sent on a connection already bound to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    Shell {
        service: ShellService,
        command: String,
    },
    Sync,
    ReverseForward {
        remote: Endpoint,
        local: Endpoint,
        norebind: bool,
    },
    ReverseList,
    ReverseKill(Endpoint),
    ReverseKillAll,
    /// Open a socket on the device, e.g. `tcp:8080`.
    Open(Endpoint),
}

impl DeviceRequest {
    /// The request text carried in the hex-length frame.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Shell { service, command } => match service {
                ShellService::Legacy => format!("shell:{command}"),
                ShellService::Raw => format!("shell,raw:{command}"),
                ShellService::V2 { term, pty } => {
                    let kind = if *pty { "pty" } else { "raw" };
                    format!("shell,v2,TERM={term},{kind}:{command}")
                }
            },
            Self::Sync => "sync:".into(),
            Self::ReverseForward {
                remote,
                local,
                norebind,
            } => {
                let norebind = if *norebind { "norebind:" } else { "" };
                format!("reverse:forward:{norebind}{remote};{local}")
            }
            Self::ReverseList => "reverse:list-forward".into(),
            Self::ReverseKill(remote) => format!("reverse:killforward:{remote}"),
            Self::ReverseKillAll => "reverse:killforward-all".into(),
            Self::Open(endpoint) => endpoint.to_string(),
        }
    }

    /// What the device sends after the first `OKAY`.
    pub fn response_shape(&self) -> ResponseShape {
        match self {
            Self::Shell { .. } | Self::Sync | Self::Open(_) => ResponseShape::Stream,
            Self::ReverseList => ResponseShape::Frame,
            Self::ReverseForward { remote, .. } => {
                if remote.is_ephemeral_tcp() {
                    ResponseShape::Forward {
                        allocates_port: true,
                    }
                } else {
                    ResponseShape::TwoStatus
                }
            }
            Self::ReverseKill(_) | Self::ReverseKillAll => ResponseShape::TwoStatus,
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
