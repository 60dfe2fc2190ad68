//! Values produced and consumed by the engine: device records, sync stat
//! results, shell results, port-rule endpoints and tracker events.
//!
//! These are transient query results. Nothing here is cached across calls.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AdbError;

// ── DeviceState ──────────────────────────────────────────────────

/// Connection state of a device as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceState {
    /// Online and usable.
    Device,
    Offline,
    Unauthorized,
    Authorizing,
    Connecting,
    Bootloader,
    Recovery,
    Rescue,
    Sideload,
    Host,
    /// The server lacks USB permissions for the device.
    NoPermissions,
    /// Not visible at all. Never sent by the server; used by callers that
    /// need an explicit marker for a vanished device.
    Absent,
    /// Any state string this crate does not know about.
    Unknown(String),
}

impl DeviceState {
    /// The state string as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Device => "device",
            Self::Offline => "offline",
            Self::Unauthorized => "unauthorized",
            Self::Authorizing => "authorizing",
            Self::Connecting => "connecting",
            Self::Bootloader => "bootloader",
            Self::Recovery => "recovery",
            Self::Rescue => "rescue",
            Self::Sideload => "sideload",
            Self::Host => "host",
            Self::NoPermissions => "no permissions",
            Self::Absent => "absent",
            Self::Unknown(s) => s,
        }
    }

    /// Parse a state string. Unknown strings are preserved, never rejected.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "authorizing" => Self::Authorizing,
            "connecting" => Self::Connecting,
            "bootloader" => Self::Bootloader,
            "recovery" => Self::Recovery,
            "rescue" => Self::Rescue,
            "sideload" => Self::Sideload,
            "host" => Self::Host,
            "absent" => Self::Absent,
            other if other.starts_with("no permissions") => Self::NoPermissions,
            other => {
                tracing::warn!(state = other, "unknown device state");
                Self::Unknown(other.to_string())
            }
        }
    }

    /// Returns `true` for the only state in which services can be opened.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Device)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── DeviceRecord ─────────────────────────────────────────────────

/// One line of a device listing or tracker snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub serial: String,
    pub state: DeviceState,
    /// Server transport id, present in long listings.
    pub transport_id: Option<u64>,
    /// Extra `key:value` columns of a long listing (`product`, `model`,
    /// `device`, `usb`, ...). Empty for short listings.
    pub tags: BTreeMap<String, String>,
}

impl DeviceRecord {
    /// Parse one `"<serial>\t<state>"` line. Returns `None` for blank or
    /// malformed lines.
    pub fn parse_short(line: &str) -> Option<Self> {
        let line = line.trim();
        let (serial, state) = line.split_once('\t')?;
        let serial = serial.trim();
        if serial.is_empty() {
            return None;
        }
        Some(Self {
            serial: serial.to_string(),
            state: DeviceState::parse(state),
            transport_id: None,
            tags: BTreeMap::new(),
        })
    }

    /// Parse one line of `devices-l` output:
    /// `"<serial>   <state> product:x model:y device:z transport_id:3"`.
    ///
    /// The state may contain spaces (`no permissions (...)`), so tags are
    /// collected from the end of the line while tokens look like `key:value`.
    pub fn parse_long(line: &str) -> Option<Self> {
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return None;
        }
        let serial = tokens.remove(0).to_string();

        let mut tags = BTreeMap::new();
        while tokens.len() > 1 {
            let Some(last) = tokens.last() else { break };
            let Some((key, value)) = last.split_once(':') else {
                break;
            };
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            tags.insert(key.to_string(), value.to_string());
            tokens.pop();
        }

        let transport_id = tags.get("transport_id").and_then(|v| v.parse().ok());
        Some(Self {
            serial,
            state: DeviceState::parse(&tokens.join(" ")),
            transport_id,
            tags,
        })
    }

    /// Parse a full listing, skipping malformed lines.
    pub fn parse_listing(text: &str, long: bool) -> Vec<Self> {
        text.lines()
            .filter_map(|line| {
                if long {
                    Self::parse_long(line)
                } else {
                    Self::parse_short(line)
                }
            })
            .collect()
    }
}

// ── Device selection ─────────────────────────────────────────────

/// How a connection is bound to one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    Serial(String),
    TransportId(u64),
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(s) => write!(f, "serial {s}"),
            Self::TransportId(id) => write!(f, "transport id {id}"),
        }
    }
}

impl From<&str> for DeviceSelector {
    fn from(s: &str) -> Self {
        Self::Serial(s.to_string())
    }
}

impl From<String> for DeviceSelector {
    fn from(s: String) -> Self {
        Self::Serial(s)
    }
}

// ── Sync results ─────────────────────────────────────────────────

/// POSIX file-type mask and type bits used in sync mode fields.
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

/// Reply to a sync `STAT` request.
///
/// A missing file is reported as all-zero fields, not as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStat {
    /// POSIX mode bits (type + permissions).
    pub mode: u32,
    pub size: u32,
    /// Modification time, unix seconds.
    pub mtime: u32,
}

impl SyncStat {
    /// `false` when the server reported all-zero fields.
    pub fn exists(&self) -> bool {
        self.mode != 0 || self.size != 0 || self.mtime != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Permission bits only.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// One `DENT` record of a sync `LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl DirEntry {
    pub fn stat(&self) -> SyncStat {
        SyncStat {
            mode: self.mode,
            size: self.size,
            mtime: self.mtime,
        }
    }

    /// `.` and `..` entries.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

// ── Shell results ────────────────────────────────────────────────

/// Outcome of a completed shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellResult {
    /// The command as given by the caller, without any sentinel suffix.
    pub command: String,
    /// `None` only for v1 runs without exit-code capture.
    pub exit_code: Option<u8>,
    pub stdout: Vec<u8>,
    /// Always empty for v1, whose stderr is interleaved into stdout.
    pub stderr: Vec<u8>,
}

impl ShellResult {
    /// `true` when the command reported exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Lossy UTF-8 view of stdout.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Lossy UTF-8 view of stderr.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

// ── Endpoints ────────────────────────────────────────────────────

/// A typed socket spec used by forward/reverse rules and device
/// connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `tcp:<port>`; port 0 asks the server to allocate one.
    Tcp(u16),
    LocalAbstract(String),
    LocalReserved(String),
    LocalFilesystem(String),
    /// `dev:<path>`, a character device on the remote side.
    Dev(String),
    /// `jdwp:<pid>`, only meaningful as a forward remote.
    Jdwp(u32),
}

impl Endpoint {
    /// Returns `true` for `tcp:0`.
    pub fn is_ephemeral_tcp(&self) -> bool {
        matches!(self, Self::Tcp(0))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "tcp:{port}"),
            Self::LocalAbstract(name) => write!(f, "localabstract:{name}"),
            Self::LocalReserved(name) => write!(f, "localreserved:{name}"),
            Self::LocalFilesystem(path) => write!(f, "localfilesystem:{path}"),
            Self::Dev(path) => write!(f, "dev:{path}"),
            Self::Jdwp(pid) => write!(f, "jdwp:{pid}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = AdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| AdbError::protocol(format!("invalid endpoint: {s:?}")))?;
        let endpoint = match kind {
            "tcp" => Self::Tcp(rest.parse()?),
            "localabstract" => Self::LocalAbstract(rest.to_string()),
            "localreserved" => Self::LocalReserved(rest.to_string()),
            "localfilesystem" => Self::LocalFilesystem(rest.to_string()),
            "dev" => Self::Dev(rest.to_string()),
            "jdwp" => Self::Jdwp(rest.parse()?),
            _ => return Err(AdbError::protocol(format!("unknown endpoint kind: {kind:?}"))),
        };
        Ok(endpoint)
    }
}

// ── Port rules ───────────────────────────────────────────────────

/// A host-side listener tunneled to a device endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub serial: String,
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// A device-side listener tunneled to a host endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseRule {
    /// Transport name the device reports (e.g. `UsbFfs`, `host-19`).
    pub serial: String,
    pub remote: Endpoint,
    pub local: Endpoint,
}

/// Parse `<serial> <a> <b>` lines, skipping lines that do not have exactly
/// three fields or whose endpoints do not parse.
pub(crate) fn parse_rule_lines(text: &str) -> Vec<(String, Endpoint, Endpoint)> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let [serial, a, b] = parts.as_slice() else {
                return None;
            };
            match (a.parse::<Endpoint>(), b.parse::<Endpoint>()) {
                (Ok(a), Ok(b)) => Some((serial.to_string(), a, b)),
                _ => {
                    tracing::warn!(line, "skipping unparsable rule line");
                    None
                }
            }
        })
        .collect()
}

// ── Tracker events ───────────────────────────────────────────────

/// A presence or state change derived from two successive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackEvent {
    pub serial: String,
    /// State in the previous snapshot; `None` for a newly seen device.
    pub old_state: Option<DeviceState>,
    /// State in the current snapshot; `None` for a vanished device.
    pub new_state: Option<DeviceState>,
    /// `false` when the device vanished.
    pub present: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_short_line() {
        let rec = DeviceRecord::parse_short("emulator-5554\tdevice").unwrap();
        assert_eq!(rec.serial, "emulator-5554");
        assert_eq!(rec.state, DeviceState::Device);
        assert!(rec.transport_id.is_none());

        assert!(DeviceRecord::parse_short("").is_none());
        assert!(DeviceRecord::parse_short("garbage").is_none());
    }

    #[test]
    fn parse_long_line_with_tags() {
        let line = "R58M123ABC             device usb:1-1 product:a51 model:SM_A515F device:a51 transport_id:7";
        let rec = DeviceRecord::parse_long(line).unwrap();
        assert_eq!(rec.serial, "R58M123ABC");
        assert_eq!(rec.state, DeviceState::Device);
        assert_eq!(rec.transport_id, Some(7));
        assert_eq!(rec.tags.get("model").map(String::as_str), Some("SM_A515F"));
        assert_eq!(rec.tags.len(), 5);
    }

    #[test]
    fn parse_long_line_with_spaced_state() {
        let line = "0123456789ABCDEF       no permissions (missing udev rules?); see [http://developer.android.com/tools/device.html] usb:1-4 transport_id:2";
        let rec = DeviceRecord::parse_long(line).unwrap();
        assert_eq!(rec.state, DeviceState::NoPermissions);
        assert_eq!(rec.transport_id, Some(2));
    }

    #[test]
    fn unknown_state_is_preserved() {
        let state = DeviceState::parse("fastbootd");
        assert_eq!(state, DeviceState::Unknown("fastbootd".into()));
        assert_eq!(state.to_string(), "fastbootd");
    }

    #[test]
    fn endpoint_parse_and_display() {
        let cases = [
            "tcp:8080",
            "localabstract:chrome_devtools_remote",
            "localreserved:foo",
            "localfilesystem:/data/local/tmp/sock",
            "dev:/dev/ttyS0",
            "jdwp:1234",
        ];
        for case in cases {
            let ep: Endpoint = case.parse().unwrap();
            assert_eq!(ep.to_string(), case);
        }
        assert!("udp:53".parse::<Endpoint>().is_err());
        assert!("tcp:notaport".parse::<Endpoint>().is_err());
        assert!("tcp:0".parse::<Endpoint>().unwrap().is_ephemeral_tcp());
    }

    #[test]
    fn rule_lines_skip_malformed() {
        let text = "emulator-5554 tcp:1234 tcp:4321\nbroken line\nx tcp:1 localabstract:foo\n";
        let rules = parse_rule_lines(text);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].1, Endpoint::Tcp(1234));
        assert_eq!(rules[1].2, Endpoint::LocalAbstract("foo".into()));
    }

    #[test]
    fn sync_stat_classification() {
        let missing = SyncStat::default();
        assert!(!missing.exists());

        let dir = SyncStat {
            mode: S_IFDIR | 0o755,
            size: 4096,
            mtime: 1,
        };
        assert!(dir.exists());
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert_eq!(dir.permissions(), 0o755);
    }
}
