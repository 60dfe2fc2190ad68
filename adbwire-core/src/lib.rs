//! # adbwire-core
//!
//! Client-side engine for the Android Debug Bridge host protocol: it speaks
//! to a running ADB server over TCP and never to devices directly.
//!
//! This crate contains:
//! - **Codec**: hex-length request/reply frames, the binary sync protocol and
//!   the shell v1/v2 stream framing, as `tokio_util` codecs
//! - **Network**: `AdbConnection`, one request-scoped socket with its state
//! - **Client**: `AdbClient` host dispatcher and `AdbDevice` handles, with
//!   device selection and transport binding
//! - **Protocol**: `SyncSession` file transfer and shell execution
//! - **Forward**: forward and reverse port rules
//! - **Tracker**: `DeviceTracker` change feed built on `track-devices`
//! - **Config**: `AdbConfig`, from defaults, environment or TOML
//! - **Error**: `AdbError`, a typed `thiserror` hierarchy

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod forward;
pub mod network;
pub mod protocol;
pub mod request;
pub mod state;
pub mod tracker;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::{AdbClient, AdbDevice, Reply, TPORT_MIN_VERSION};
pub use codec::shell::{ShellCodec, ShellFraming, ShellPacket};
pub use codec::sync::{SyncCodec, SyncRequest, SyncResponse};
pub use codec::{HexFrameCodec, MAX_FRAME_LEN, Status};
pub use config::{AdbConfig, TransportMode};
pub use error::{AdbError, PartialData, Result};
pub use network::AdbConnection;
pub use protocol::{ShellOptions, ShellProtocol, ShellStream, SyncSession, run_shell};
pub use request::{
    DeviceQuery, DeviceRequest, HostRequest, ResponseShape, ShellService, WaitState,
    WaitTransport,
};
pub use state::ConnectionState;
pub use tracker::{DeviceTracker, Snapshot, TrackerHandle, diff_snapshots};
pub use types::{
    DeviceRecord, DeviceSelector, DeviceState, DirEntry, Endpoint, ForwardRule, ReverseRule,
    ShellResult, SyncStat, TrackEvent,
};
