//! Host dispatcher.
//!
//! [`AdbClient`] owns nothing but an immutable [`AdbConfig`]. Every call
//! opens its own connection, drives one request to completion and closes
//! it, so a client can be cloned freely and used from many tasks at once.
//!
//! ```text
//! unbound ──(host request)──► reply, close
//!    │
//!    └──(host:transport*)──► device-bound ──(device request)──► sub-protocol
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::codec::Status;
use crate::config::{AdbConfig, TransportMode};
use crate::error::{AdbError, Result};
use crate::network::AdbConnection;
use crate::network::connection::deadline;
use crate::request::{
    DeviceQuery, DeviceRequest, HostRequest, ResponseShape, WaitState, WaitTransport,
};
use crate::types::{DeviceRecord, DeviceSelector, DeviceState};

/// Lowest server version that understands `host:tport:`.
pub const TPORT_MIN_VERSION: u32 = 41;

// ── Replies ──────────────────────────────────────────────────────

/// The parsed answer to a request, shaped by its [`ResponseShape`].
#[derive(Debug)]
pub enum Reply {
    /// Nothing beyond `OKAY`.
    Okay,
    /// The body of a reply frame.
    Text(String),
    /// The transport id of a `tport` binding.
    TransportId(u64),
    /// The connection is handed over for streaming.
    Stream(AdbConnection),
}

impl Reply {
    /// The frame text, or an empty string for replies without one.
    pub fn into_text(self) -> String {
        match self {
            Reply::Text(text) => text,
            _ => String::new(),
        }
    }
}

/// Read whatever follows the first `OKAY` for a non-streaming shape.
///
/// Returns `None` for [`ResponseShape::Stream`], leaving the connection
/// untouched.
pub(crate) async fn read_reply<S>(
    conn: &mut AdbConnection<S>,
    shape: ResponseShape,
) -> Result<Option<Reply>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let reply = match shape {
        ResponseShape::Status => Reply::Okay,
        ResponseShape::Frame => Reply::Text(conn.read_frame_string().await?),
        ResponseShape::TransportId => Reply::TransportId(conn.read_u64_le().await?),
        ResponseShape::TwoStatus => {
            conn.check_okay().await?;
            Reply::Okay
        }
        ResponseShape::Forward { allocates_port } => match conn.read_optional_status().await? {
            // Older servers answer with a single status and close.
            None => Reply::Okay,
            Some(Status::Fail) => return Err(conn.read_failure().await),
            Some(Status::Okay) if allocates_port => Reply::Text(conn.read_frame_string().await?),
            Some(Status::Okay) => Reply::Okay,
        },
        ResponseShape::Stream => return Ok(None),
    };
    Ok(Some(reply))
}

// ── AdbClient ────────────────────────────────────────────────────

/// Entry point for talking to an ADB server.
#[derive(Debug, Clone, Default)]
pub struct AdbClient {
    config: Arc<AdbConfig>,
}

impl AdbClient {
    pub fn new(config: AdbConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// A client configured from `ANDROID_ADB_SERVER_*` / `ANDROID_SERIAL`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(AdbConfig::from_env()?))
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    /// Open a fresh, unbound connection.
    pub async fn connect_server(&self) -> Result<AdbConnection> {
        AdbConnection::open(&self.config).await
    }

    /// Send one host request on a fresh connection and read its reply.
    ///
    /// Non-streaming replies close the connection before returning.
    pub async fn open_host_request(&self, request: &HostRequest) -> Result<Reply> {
        let mut conn = self.connect_server().await?;
        conn.send_request(&request.to_wire()).await?;
        conn.check_okay().await?;
        if request.binds_device() {
            conn.state_mut().bind_device()?;
        } else {
            conn.state_mut().host_request()?;
        }

        match read_reply(&mut conn, request.response_shape()).await? {
            Some(reply) => {
                conn.close().await;
                Ok(reply)
            }
            None => Ok(Reply::Stream(conn)),
        }
    }

    async fn host_text(&self, request: HostRequest) -> Result<String> {
        Ok(self.open_host_request(&request).await?.into_text())
    }

    // ── Server ───────────────────────────────────────────────────

    /// Server protocol version (`41` for `1.0.41`).
    pub async fn server_version(&self) -> Result<u32> {
        let text = self.host_text(HostRequest::Version).await?;
        u32::from_str_radix(text.trim(), 16)
            .map_err(|e| AdbError::protocol(format!("invalid version {text:?}: {e}")))
    }

    /// Ask the server to exit.
    pub async fn kill(&self) -> Result<()> {
        let mut conn = self.connect_server().await?;
        conn.send_request(&HostRequest::Kill.to_wire()).await?;
        // The server may exit before its OKAY is flushed.
        match conn.read_optional_status().await? {
            Some(Status::Fail) => Err(conn.read_failure().await),
            _ => Ok(()),
        }
    }

    // ── Devices ──────────────────────────────────────────────────

    /// `host:devices`.
    pub async fn devices(&self) -> Result<Vec<DeviceRecord>> {
        let text = self.host_text(HostRequest::Devices { long: false }).await?;
        Ok(DeviceRecord::parse_listing(&text, false))
    }

    /// `host:devices-l`, including transport ids and descriptive tags.
    pub async fn devices_long(&self) -> Result<Vec<DeviceRecord>> {
        let text = self.host_text(HostRequest::Devices { long: true }).await?;
        Ok(DeviceRecord::parse_listing(&text, true))
    }

    /// `host:connect:<addr>`; returns the server's message, which may
    /// describe a failure even though the request itself succeeded.
    pub async fn connect(&self, addr: &str) -> Result<String> {
        self.host_text(HostRequest::Connect(addr.to_string())).await
    }

    /// `host:disconnect:<addr>`. Unless `strict`, a `FAIL` yields `None`.
    pub async fn disconnect(&self, addr: &str, strict: bool) -> Result<Option<String>> {
        match self.host_text(HostRequest::Disconnect(addr.to_string())).await {
            Ok(text) => Ok(Some(text)),
            Err(AdbError::Service(msg)) if !strict => {
                tracing::warn!(addr, %msg, "disconnect failed; ignoring");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Block until a device reaches `state`.
    ///
    /// The server acknowledges the request with one `OKAY` and sends a second
    /// once the condition holds. When `timeout` elapses the connection is
    /// dropped and [`AdbError::Timeout`] is returned.
    pub async fn wait_for(
        &self,
        serial: Option<&str>,
        transport: WaitTransport,
        state: WaitState,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let request = HostRequest::WaitFor {
            serial: serial.map(str::to_string),
            transport,
            state,
        };
        tracing::debug!(request = %request, ?timeout, "waiting for device");
        deadline(timeout, async {
            match self.open_host_request(&request).await? {
                Reply::Okay => Ok(()),
                other => Err(AdbError::protocol(format!(
                    "unexpected wait-for reply {other:?}"
                ))),
            }
        })
        .await
    }

    /// A per-device query answered by the server.
    pub async fn query(&self, selector: &DeviceSelector, query: DeviceQuery) -> Result<String> {
        let text = self
            .host_text(HostRequest::Query {
                selector: selector.clone(),
                query,
            })
            .await?;
        Ok(text.trim().to_string())
    }

    /// Feature flags the device and server both support.
    pub async fn features(&self, selector: &DeviceSelector) -> Result<BTreeSet<String>> {
        let text = self.query(selector, DeviceQuery::Features).await?;
        Ok(text
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect())
    }

    // ── Device selection & binding ───────────────────────────────

    /// Resolve the device to use when the caller did not name one.
    ///
    /// The configured default serial wins; otherwise exactly one device in
    /// state `device` must be visible.
    pub async fn select_device(&self) -> Result<DeviceSelector> {
        if let Some(serial) = &self.config.default_serial {
            return Ok(DeviceSelector::Serial(serial.clone()));
        }
        let mut online: Vec<DeviceRecord> = self
            .devices()
            .await?
            .into_iter()
            .filter(|d| d.state.is_online())
            .collect();
        match online.len() {
            0 => Err(AdbError::NoDevice),
            1 => {
                let record = online.remove(0);
                tracing::debug!(serial = %record.serial, "selected only online device");
                Ok(DeviceSelector::Serial(record.serial))
            }
            n => Err(AdbError::MultipleDevices(n)),
        }
    }

    async fn use_tport(&self) -> Result<bool> {
        match self.config.transport_mode {
            TransportMode::Transport => Ok(false),
            TransportMode::Tport => Ok(true),
            TransportMode::Auto => {
                let version = self.server_version().await?;
                tracing::trace!(version, "server version for transport choice");
                Ok(version >= TPORT_MIN_VERSION)
            }
        }
    }

    /// Open a connection bound to one device.
    pub async fn bind_device(&self, selector: &DeviceSelector) -> Result<AdbConnection> {
        let request = if self.use_tport().await? {
            HostRequest::Tport(selector.clone())
        } else {
            match selector {
                DeviceSelector::Serial(serial) => HostRequest::Transport(serial.clone()),
                DeviceSelector::TransportId(id) => HostRequest::TransportId(*id),
            }
        };

        let mut conn = self.connect_server().await?;
        conn.send_request(&request.to_wire()).await?;
        conn.check_okay().await?;
        if let Some(Reply::TransportId(id)) =
            read_reply(&mut conn, request.response_shape()).await?
        {
            tracing::debug!(transport_id = id, %selector, "bound via tport");
            conn.set_transport_id(id);
        }
        conn.state_mut().bind_device()?;
        Ok(conn)
    }

    /// Bind to a device and issue one device-local request, returning the
    /// connection right after the device's `OKAY`.
    pub(crate) async fn open_device_request(
        &self,
        selector: &DeviceSelector,
        request: &DeviceRequest,
    ) -> Result<AdbConnection> {
        let mut conn = self.bind_device(selector).await?;
        conn.send_request(&request.to_wire()).await?;
        conn.check_okay().await?;
        Ok(conn)
    }

    /// Issue a non-streaming device request and return its reply.
    pub(crate) async fn device_request(
        &self,
        selector: &DeviceSelector,
        request: &DeviceRequest,
    ) -> Result<Reply> {
        let mut conn = self.open_device_request(selector, request).await?;
        conn.state_mut().enter_raw()?;
        let reply = read_reply(&mut conn, request.response_shape())
            .await?
            .unwrap_or(Reply::Okay);
        conn.close().await;
        Ok(reply)
    }

    /// A handle for one device.
    pub fn device(&self, selector: impl Into<DeviceSelector>) -> AdbDevice {
        AdbDevice {
            client: self.clone(),
            selector: selector.into(),
        }
    }

    /// A handle for the device chosen by [`select_device`](Self::select_device).
    pub async fn default_device(&self) -> Result<AdbDevice> {
        let selector = self.select_device().await?;
        Ok(self.device(selector))
    }
}

// ── AdbDevice ────────────────────────────────────────────────────

/// A device addressed by serial or transport id.
///
/// Cheap to clone. Shell, sync and port-rule operations live in their own
/// modules as further `impl AdbDevice` blocks.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    pub(crate) client: AdbClient,
    pub(crate) selector: DeviceSelector,
}

impl AdbDevice {
    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    /// The serial, when the device was selected by one.
    pub fn serial(&self) -> Option<&str> {
        match &self.selector {
            DeviceSelector::Serial(serial) => Some(serial),
            DeviceSelector::TransportId(_) => None,
        }
    }

    /// The serial to use in `host-serial:` requests, resolved through
    /// `get-serialno` for transport-id handles.
    pub async fn resolve_serial(&self) -> Result<String> {
        match &self.selector {
            DeviceSelector::Serial(serial) => Ok(serial.clone()),
            DeviceSelector::TransportId(_) => self.get_serialno().await,
        }
    }

    pub async fn get_state(&self) -> Result<DeviceState> {
        let text = self.client.query(&self.selector, DeviceQuery::State).await?;
        Ok(DeviceState::parse(&text))
    }

    pub async fn get_serialno(&self) -> Result<String> {
        self.client.query(&self.selector, DeviceQuery::SerialNo).await
    }

    pub async fn get_devpath(&self) -> Result<String> {
        self.client.query(&self.selector, DeviceQuery::DevPath).await
    }

    pub async fn features(&self) -> Result<BTreeSet<String>> {
        self.client.features(&self.selector).await
    }

    /// Open a socket to `endpoint` on the device and return the raw stream.
    pub async fn open_connection(&self, endpoint: &crate::types::Endpoint) -> Result<TcpStream> {
        let request = DeviceRequest::Open(endpoint.clone());
        let mut conn = self
            .client
            .open_device_request(&self.selector, &request)
            .await?;
        conn.state_mut().enter_raw()?;
        tracing::debug!(%endpoint, device = %self.selector, "device socket opened");
        Ok(conn.into_inner())
    }
}
