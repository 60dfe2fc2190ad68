//! Device tracker.
//!
//! After `host:track-devices` is accepted the server pushes one frame per
//! change, each holding a complete snapshot of the device list. The tracker
//! diffs successive snapshots into [`TrackEvent`]s.
//!
//! # Wire Protocol
//!
//! ```text
//! ──► 0012host:track-devices
//! ◄── OKAY
//! ◄── 0012emulator-5554\tdevice\n      snapshot 1
//! ◄── 0000                             snapshot 2 (no devices)
//! ◄── ...                              until the socket closes
//! ```
//!
//! The feed never ends on its own: a server close is reported as
//! [`AdbError::ConnectionClosed`].

use std::collections::{BTreeMap, VecDeque};

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::client::{AdbClient, Reply};
use crate::codec::HexFrameCodec;
use crate::error::{AdbError, Result};
use crate::network::AdbConnection;
use crate::request::HostRequest;
use crate::types::{DeviceRecord, DeviceState, TrackEvent};

/// Serial → state view of one snapshot.
pub type Snapshot = BTreeMap<String, DeviceState>;

/// Diff two snapshots.
///
/// Vanished devices come first, then new and changed devices; each group is
/// ordered by serial.
pub fn diff_snapshots(prev: &Snapshot, curr: &Snapshot) -> Vec<TrackEvent> {
    let removed = prev
        .iter()
        .filter(|(serial, _)| !curr.contains_key(*serial))
        .map(|(serial, state)| TrackEvent {
            serial: serial.clone(),
            old_state: Some(state.clone()),
            new_state: None,
            present: false,
        });

    let changed = curr.iter().filter_map(|(serial, state)| match prev.get(serial) {
        Some(old) if old == state => None,
        old => Some(TrackEvent {
            serial: serial.clone(),
            old_state: old.cloned(),
            new_state: Some(state.clone()),
            present: true,
        }),
    });

    removed.chain(changed).collect()
}

fn parse_snapshot(frame: &[u8], long: bool) -> Result<Snapshot> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| AdbError::protocol(format!("snapshot is not UTF-8: {e}")))?;
    Ok(DeviceRecord::parse_listing(text, long)
        .into_iter()
        .map(|record| (record.serial, record.state))
        .collect())
}

// ── DeviceTracker ────────────────────────────────────────────────

/// A live `track-devices` feed.
///
/// Dropping the tracker closes the connection.
#[derive(Debug)]
pub struct DeviceTracker<S = TcpStream> {
    framed: Framed<S, HexFrameCodec>,
    long: bool,
    known: Snapshot,
    pending: VecDeque<TrackEvent>,
}

impl<S> DeviceTracker<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Take over a connection whose `track-devices` request was accepted.
    pub fn new(conn: AdbConnection<S>, long: bool) -> Self {
        Self {
            framed: conn.into_framed(HexFrameCodec),
            long,
            known: Snapshot::new(),
            pending: VecDeque::new(),
        }
    }

    /// Devices as of the last snapshot received.
    pub fn known(&self) -> &Snapshot {
        &self.known
    }

    /// Wait for the next full snapshot and fold it into the known state.
    ///
    /// Events not yet returned by [`next_event`](Self::next_event) are
    /// queued behind those of earlier snapshots.
    pub async fn next_snapshot(&mut self) -> Result<Snapshot> {
        let frame = match self.framed.next().await {
            Some(frame) => frame?,
            None => return Err(AdbError::closed()),
        };
        let snapshot = parse_snapshot(&frame, self.long)?;
        tracing::trace!(devices = snapshot.len(), "snapshot received");

        let events = diff_snapshots(&self.known, &snapshot);
        self.pending.extend(events);
        self.known = snapshot.clone();
        Ok(snapshot)
    }

    /// The next presence or state change.
    pub async fn next_event(&mut self) -> Result<TrackEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            self.next_snapshot().await?;
        }
    }

    /// The feed as an unbounded stream. The first error ends it.
    pub fn into_stream(self) -> impl Stream<Item = Result<TrackEvent>> {
        stream::try_unfold(self, |mut tracker| async move {
            let event = tracker.next_event().await?;
            Ok(Some((event, tracker)))
        })
    }
}

impl<S> DeviceTracker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the feed on its own task, forwarding events over a channel of
    /// `buffer` slots.
    ///
    /// The task stops after the first error, when the receiver is dropped,
    /// or when the handle is cancelled.
    pub fn spawn(mut self, buffer: usize) -> TrackerHandle {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            tracing::info!(long = self.long, "device tracker started");
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("device tracker cancelled");
                        break;
                    }
                    next = self.next_event() => next,
                };
                let failed = next.is_err();
                if let Err(e) = &next {
                    tracing::info!(error = %e, "device tracker stopped");
                }
                if tx.send(next).await.is_err() {
                    tracing::info!("device tracker receiver dropped");
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        TrackerHandle {
            events: rx,
            cancel,
            task,
        }
    }
}

/// Handle to a tracker running on its own task.
#[derive(Debug)]
pub struct TrackerHandle {
    events: mpsc::Receiver<Result<TrackEvent>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TrackerHandle {
    /// The next event. `Ok(None)` once the tracker has been cancelled and
    /// every queued event was consumed.
    pub async fn recv(&mut self) -> Result<Option<TrackEvent>> {
        self.events.recv().await.transpose()
    }

    /// A token that stops the tracker when cancelled, usable from any task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the tracker and wait for its task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "device tracker task failed");
        }
    }
}

impl AdbClient {
    /// Start a `track-devices` feed; `long` uses `track-devices-l`.
    pub async fn track_devices(&self, long: bool) -> Result<DeviceTracker> {
        match self
            .open_host_request(&HostRequest::TrackDevices { long })
            .await?
        {
            Reply::Stream(conn) => {
                tracing::info!(long, "tracking devices");
                Ok(DeviceTracker::new(conn, long))
            }
            other => Err(AdbError::protocol(format!(
                "unexpected track-devices reply {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(entries: &[(&str, DeviceState)]) -> Snapshot {
        entries
            .iter()
            .map(|(serial, state)| (serial.to_string(), state.clone()))
            .collect()
    }

    fn frame(body: &str) -> Vec<u8> {
        let mut out = format!("{:04x}", body.len()).into_bytes();
        out.extend_from_slice(body.as_bytes());
        out
    }

    #[test]
    fn diff_reports_arrivals_changes_and_departures() {
        let s0 = Snapshot::new();
        let s1 = snap(&[("S1", DeviceState::Device)]);
        let s2 = snap(&[("S1", DeviceState::Device), ("S2", DeviceState::Device)]);
        let s3 = snap(&[("S2", DeviceState::Offline)]);

        assert_eq!(
            diff_snapshots(&s0, &s1),
            vec![TrackEvent {
                serial: "S1".into(),
                old_state: None,
                new_state: Some(DeviceState::Device),
                present: true,
            }]
        );
        assert_eq!(
            diff_snapshots(&s1, &s2),
            vec![TrackEvent {
                serial: "S2".into(),
                old_state: None,
                new_state: Some(DeviceState::Device),
                present: true,
            }]
        );
        assert_eq!(
            diff_snapshots(&s2, &s3),
            vec![
                TrackEvent {
                    serial: "S1".into(),
                    old_state: Some(DeviceState::Device),
                    new_state: None,
                    present: false,
                },
                TrackEvent {
                    serial: "S2".into(),
                    old_state: Some(DeviceState::Device),
                    new_state: Some(DeviceState::Offline),
                    present: true,
                },
            ]
        );
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let s = snap(&[("S1", DeviceState::Device)]);
        assert!(diff_snapshots(&s, &s).is_empty());
    }

    #[tokio::test]
    async fn tracker_diffs_pushed_frames() {
        let mock = tokio_test::io::Builder::new()
            .read(&frame("S1\tdevice\n"))
            .read(&frame("S1\tdevice\nS2\tdevice\n"))
            .read(&frame("S2\toffline\n"))
            .build();
        let mut tracker = DeviceTracker::new(AdbConnection::new(mock, None), false);

        let e = tracker.next_event().await.unwrap();
        assert_eq!((e.serial.as_str(), e.present), ("S1", true));
        let e = tracker.next_event().await.unwrap();
        assert_eq!((e.serial.as_str(), e.present), ("S2", true));
        let e = tracker.next_event().await.unwrap();
        assert_eq!((e.serial.as_str(), e.present), ("S1", false));
        let e = tracker.next_event().await.unwrap();
        assert_eq!(e.new_state, Some(DeviceState::Offline));

        assert_eq!(tracker.known().len(), 1);
        let err = tracker.next_event().await.unwrap_err();
        assert!(matches!(err, AdbError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn long_snapshots_are_parsed() {
        let body = "emulator-5554          device product:sdk model:sdk device:generic transport_id:1\n";
        let mock = tokio_test::io::Builder::new().read(&frame(body)).build();
        let mut tracker = DeviceTracker::new(AdbConnection::new(mock, None), true);

        let snapshot = tracker.next_snapshot().await.unwrap();
        assert_eq!(snapshot.get("emulator-5554"), Some(&DeviceState::Device));
    }

    #[tokio::test]
    async fn stream_ends_with_the_close_error() {
        let mock = tokio_test::io::Builder::new()
            .read(&frame("S1\tdevice\n"))
            .read(&frame(""))
            .build();
        let tracker = DeviceTracker::new(AdbConnection::new(mock, None), false);
        let items: Vec<Result<TrackEvent>> = tracker.into_stream().collect().await;

        assert_eq!(items.len(), 3);
        assert!(items[0].as_ref().unwrap().present);
        assert!(!items[1].as_ref().unwrap().present);
        assert!(items[2].is_err());
    }
}
