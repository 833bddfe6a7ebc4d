//! Bidirectional packet forwarding for one tunnel session
//!
//! A [`ForwardingSession`] owns an acquired interface, a connected transport
//! and a cipher. Starting it spawns two loops:
//! - egress: interface -> encrypt -> transport
//! - ingress: transport -> decrypt -> interface
//!
//! plus a driver task that waits for a stop request (or a loop exiting),
//! joins both loops, and only then releases the interface and closes the
//! transport. Every blocking call in the loops is raced against the
//! shutdown flag, so a stop never waits for traffic.

pub mod stats;

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::crypto::CipherCodec;
use crate::transport::Transport;
use crate::tunnel::{InterfaceInfo, TunInterface};

pub use stats::{SessionStats, StatsSnapshot};

/// Interface read buffer; large enough for any IP packet
const READ_BUFFER_LEN: usize = 65536;

/// Lifecycle of a forwarding session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a session stopped; the first recorded reason wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stopped on request
    Requested,
    /// The platform closed the interface
    InterfaceClosed,
    /// Reading from the interface failed
    InterfaceFailed(String),
    /// The remote side ended the stream
    StreamEnded,
    /// Sending or receiving frames failed
    TransportFailed(String),
    /// A forwarding task terminated abnormally
    TaskFailed(String),
}

impl StopReason {
    /// Whether this stop should be surfaced as a failure
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Requested)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "stopped on request"),
            Self::InterfaceClosed => write!(f, "interface closed by the platform"),
            Self::InterfaceFailed(e) => write!(f, "interface failed: {}", e),
            Self::StreamEnded => write!(f, "server closed the connection"),
            Self::TransportFailed(e) => write!(f, "transport failed: {}", e),
            Self::TaskFailed(e) => write!(f, "forwarding task failed: {}", e),
        }
    }
}

/// State visible to the loops, the driver and the owner
struct Shared {
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    reason: StdMutex<Option<StopReason>>,
    stats: Arc<SessionStats>,
}

impl Shared {
    /// Record `reason` and raise the shutdown flag; safe to call repeatedly
    fn request_stop(&self, reason: StopReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                tracing::debug!("Stop requested: {}", reason);
                *slot = Some(reason);
            }
        }
        self.state.send_if_modified(|state| match state {
            SessionState::Idle | SessionState::Starting | SessionState::Running => {
                *state = SessionState::Stopping;
                true
            }
            _ => false,
        });
        self.shutdown.send_replace(true);
    }

    fn reason(&self) -> Option<StopReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Resources handed to the session before it starts
struct Resources {
    interface: TunInterface,
    transport: Box<dyn Transport>,
    codec: CipherCodec,
}

enum Lifecycle {
    /// Not started; resources still owned here
    Pending(Resources),
    /// Driver task running
    Active(JoinHandle<()>),
    /// Driver joined, resources released
    Finished,
}

/// One running tunnel: interface, transport and cipher plus two loops
pub struct ForwardingSession {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    info: InterfaceInfo,
}

impl ForwardingSession {
    /// Take ownership of already-acquired resources; nothing runs until [`start`](Self::start)
    pub fn new(interface: TunInterface, transport: Box<dyn Transport>, codec: CipherCodec) -> Self {
        let info = interface.info().clone();
        let shared = Arc::new(Shared {
            state: watch::channel(SessionState::Idle).0,
            shutdown: watch::channel(false).0,
            reason: StdMutex::new(None),
            stats: Arc::new(SessionStats::new()),
        });

        Self {
            shared,
            lifecycle: Mutex::new(Lifecycle::Pending(Resources {
                interface,
                transport,
                codec,
            })),
            info,
        }
    }

    /// Launch both forwarding loops
    ///
    /// Returns once both loops are alive, with the session Running, or
    /// earlier if a stop raced the start. Calling it again is a no-op.
    pub async fn start(&self) {
        let (egress_alive, ingress_alive) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let resources = match std::mem::replace(&mut *lifecycle, Lifecycle::Finished) {
                Lifecycle::Pending(resources) => resources,
                other => {
                    *lifecycle = other;
                    tracing::debug!("Session already started");
                    return;
                }
            };

            self.shared.state.send_replace(SessionState::Starting);

            let interface = Arc::new(resources.interface);
            let transport: Arc<dyn Transport> = Arc::from(resources.transport);

            let (egress_tx, egress_rx) = oneshot::channel();
            let (ingress_tx, ingress_rx) = oneshot::channel();

            let egress = tokio::spawn(egress_loop(
                interface.clone(),
                transport.clone(),
                resources.codec.clone(),
                self.shared.clone(),
                egress_tx,
            ));
            let ingress = tokio::spawn(ingress_loop(
                interface.clone(),
                transport.clone(),
                resources.codec,
                self.shared.clone(),
                ingress_tx,
            ));
            let driver = tokio::spawn(drive(
                self.shared.clone(),
                egress,
                ingress,
                interface,
                transport,
            ));

            *lifecycle = Lifecycle::Active(driver);
            (egress_rx, ingress_rx)
        };

        if egress_alive.await.is_ok() && ingress_alive.await.is_ok() {
            let promoted = self.shared.state.send_if_modified(|state| {
                if *state == SessionState::Starting {
                    *state = SessionState::Running;
                    true
                } else {
                    false
                }
            });
            if promoted {
                tracing::info!("Session running on {}", self.info.name);
            }
        }
    }

    /// Signal both loops to stop without waiting for teardown
    pub fn request_stop(&self) {
        self.shared.request_stop(StopReason::Requested);
    }

    /// Stop the session and wait until its resources are released
    ///
    /// Idempotent: later calls return once the first stop has completed.
    pub async fn stop(&self) {
        self.shared.request_stop(StopReason::Requested);

        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Finished) {
            Lifecycle::Pending(resources) => {
                resources.interface.release().await;
                resources.transport.close().await;
                self.shared.state.send_replace(SessionState::Stopped);
            }
            Lifecycle::Active(driver) => {
                if let Err(e) = driver.await {
                    tracing::error!("Session driver failed: {}", e);
                    self.shared.state.send_replace(SessionState::Stopped);
                }
            }
            Lifecycle::Finished => {}
        }
    }

    /// Wait until the session reaches Stopped without requesting it
    pub async fn stopped(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Stopped).await;
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Reason recorded by the first stop request, if any
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.reason()
    }

    /// Traffic counters; readable at any time without affecting the loops
    pub fn stats(&self) -> Arc<SessionStats> {
        self.shared.stats.clone()
    }

    /// Attributes of the interface this session forwards for
    pub fn interface_info(&self) -> &InterfaceInfo {
        &self.info
    }
}

impl Drop for ForwardingSession {
    fn drop(&mut self) {
        // The driver still releases everything once the loops are joined
        self.shared.request_stop(StopReason::Requested);

        let lifecycle = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Finished);
        if let Lifecycle::Pending(resources) = lifecycle {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let shared = self.shared.clone();
                    handle.spawn(async move {
                        resources.interface.release().await;
                        resources.transport.close().await;
                        shared.state.send_replace(SessionState::Stopped);
                    });
                }
                Err(_) => tracing::warn!(
                    "Session on {} dropped outside a runtime before start",
                    self.info.name
                ),
            }
        }
    }
}

impl fmt::Debug for ForwardingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingSession")
            .field("interface", &self.info.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the shutdown flag is raised
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Wait for a stop, join both loops, then release resources exactly once
async fn drive(
    shared: Arc<Shared>,
    mut egress: JoinHandle<()>,
    mut ingress: JoinHandle<()>,
    interface: Arc<TunInterface>,
    transport: Arc<dyn Transport>,
) {
    let mut shutdown = shared.shutdown.subscribe();

    let (egress_done, ingress_done) = tokio::select! {
        _ = shutdown_requested(&mut shutdown) => (false, false),
        result = &mut egress => {
            on_loop_exit(&shared, "egress", result);
            (true, false)
        }
        result = &mut ingress => {
            on_loop_exit(&shared, "ingress", result);
            (false, true)
        }
    };

    if !egress_done {
        on_loop_exit(&shared, "egress", egress.await);
    }
    if !ingress_done {
        on_loop_exit(&shared, "ingress", ingress.await);
    }

    // Both loops are gone; nothing else touches the resources now
    interface.release().await;
    transport.close().await;

    shared.state.send_replace(SessionState::Stopped);
    match shared.reason() {
        Some(reason) if reason.is_failure() => tracing::warn!("Session stopped: {}", reason),
        Some(reason) => tracing::info!("Session stopped: {}", reason),
        None => tracing::info!("Session stopped"),
    }
}

fn on_loop_exit(shared: &Shared, direction: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => {
            tracing::debug!("{} loop exited", direction);
            shared.request_stop(StopReason::Requested);
        }
        Err(e) => {
            tracing::error!("{} loop terminated: {}", direction, e);
            shared.request_stop(StopReason::TaskFailed(format!("{} loop: {}", direction, e)));
        }
    }
}

/// interface -> encrypt -> transport
async fn egress_loop(
    interface: Arc<TunInterface>,
    transport: Arc<dyn Transport>,
    codec: CipherCodec,
    shared: Arc<Shared>,
    alive: oneshot::Sender<()>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    let _ = alive.send(());

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = interface.read(&mut buf) => result,
        };

        let len = match read {
            Ok(Some(len)) => len,
            Ok(None) => {
                shared.request_stop(StopReason::InterfaceClosed);
                break;
            }
            Err(e) => {
                tracing::error!("Interface read failed: {}", e);
                shared.request_stop(StopReason::InterfaceFailed(e.to_string()));
                break;
            }
        };

        let frame = match codec.encrypt(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping outbound packet: {}", e);
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = transport.send(&frame) => result,
        };

        match sent {
            Ok(()) => {
                shared.stats.record_egress(len);
                tracing::trace!("Sent {} byte packet as {} byte frame", len, frame.len());
            }
            Err(e) => {
                tracing::error!("Transport send failed: {}", e);
                shared.request_stop(StopReason::TransportFailed(e.to_string()));
                break;
            }
        }
    }
}

/// transport -> decrypt -> interface
async fn ingress_loop(
    interface: Arc<TunInterface>,
    transport: Arc<dyn Transport>,
    codec: CipherCodec,
    shared: Arc<Shared>,
    alive: oneshot::Sender<()>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let _ = alive.send(());

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = transport.receive() => result,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                shared.request_stop(StopReason::StreamEnded);
                break;
            }
            Err(e) => {
                tracing::error!("Transport receive failed: {}", e);
                shared.request_stop(StopReason::TransportFailed(e.to_string()));
                break;
            }
        };

        let packet = match codec.decrypt(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                shared.stats.record_dropped();
                tracing::debug!("Dropping {} byte frame: {}", frame.len(), e);
                continue;
            }
        };

        let written = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            result = interface.write(&packet) => result,
        };

        match written {
            Ok(()) => shared.stats.record_ingress(packet.len()),
            Err(e) => tracing::debug!("Interface dropped inbound packet: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{SessionConfig, TransportKind};
    use crate::testing::{FakeDevice, FakePlatform, FakeTransport};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        platform: FakePlatform,
        device: Arc<FakeDevice>,
        transport: Arc<FakeTransport>,
        codec: CipherCodec,
        session: ForwardingSession,
    }

    async fn harness() -> Harness {
        let config = SessionConfig::new("10.0.0.1", 51820, TransportKind::Datagram, "k");
        let platform = FakePlatform::new();
        let interface = TunInterface::acquire(&platform, &config).await.unwrap();
        let device = platform.device(0).unwrap();
        let transport = FakeTransport::standalone();
        let codec = CipherCodec::new("k").unwrap();
        let session = ForwardingSession::new(interface, Box::new(transport.clone()), codec.clone());

        Harness {
            platform,
            device,
            transport,
            codec,
            session,
        }
    }

    async fn wait_for_state(session: &ForwardingSession, target: SessionState) {
        let mut rx = session.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_reaches_running() {
        let h = harness().await;
        assert_eq!(h.session.state(), SessionState::Idle);

        h.session.start().await;
        assert_eq!(h.session.state(), SessionState::Running);

        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert_eq!(h.session.stop_reason(), Some(StopReason::Requested));
    }

    #[tokio::test]
    async fn test_egress_encrypts_packets() {
        let h = harness().await;
        h.session.start().await;

        h.device.inject(b"\x45\x00\x00\x14packet".to_vec());
        let frame = tokio::time::timeout(WAIT, h.transport.next_sent())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), 10 + CipherCodec::OVERHEAD);
        assert_eq!(h.codec.decrypt(&frame).unwrap(), b"\x45\x00\x00\x14packet");

        h.session.stop().await;
        assert_eq!(h.session.stats().snapshot().tx_packets, 1);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_dropped_and_session_continues() {
        let h = harness().await;
        h.session.start().await;

        h.transport.inject(vec![0xFF; 40]);
        h.transport.inject(h.codec.encrypt(b"valid").unwrap());

        let written = tokio::time::timeout(WAIT, h.device.next_written())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, b"valid");
        assert_eq!(h.session.state(), SessionState::Running);

        h.session.stop().await;
        assert_eq!(h.device.written(), vec![b"valid".to_vec()]);
        let stats = h.session.stats().snapshot();
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(stats.rx_packets, 1);
    }

    #[tokio::test]
    async fn test_send_failure_stops_session() {
        let h = harness().await;
        h.session.start().await;

        h.transport.set_fail_send(true);
        h.device.inject(b"packet".to_vec());

        wait_for_state(&h.session, SessionState::Stopped).await;
        assert!(matches!(
            h.session.stop_reason(),
            Some(StopReason::TransportFailed(_))
        ));
        assert_eq!(h.platform.counters().devices_closed(), 1);
        assert_eq!(h.transport.close_count(), 1);

        // Stopping after a fatal error changes nothing
        h.session.stop().await;
        assert_eq!(h.platform.counters().devices_closed(), 1);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_stops_session() {
        let h = harness().await;
        h.session.start().await;

        h.transport.end_stream();

        wait_for_state(&h.session, SessionState::Stopped).await;
        assert_eq!(h.session.stop_reason(), Some(StopReason::StreamEnded));
        assert_eq!(h.platform.counters().devices_closed(), 1);
    }

    #[tokio::test]
    async fn test_end_of_interface_stops_session() {
        let h = harness().await;
        h.session.start().await;

        h.device.finish();

        wait_for_state(&h.session, SessionState::Stopped).await;
        assert_eq!(h.session.stop_reason(), Some(StopReason::InterfaceClosed));
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let h = harness().await;
        h.session.start().await;

        h.session.stop().await;
        h.session.stop().await;

        assert_eq!(h.session.state(), SessionState::Stopped);
        assert_eq!(h.platform.counters().devices_closed(), 1);
        assert_eq!(h.transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_unblocks_idle_loops() {
        let h = harness().await;
        h.session.start().await;

        // Neither side has traffic; both loops are parked in blocking calls
        tokio::time::timeout(WAIT, h.session.stop())
            .await
            .expect("stop hung");
        assert!(h.device.written().is_empty());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_releases_resources() {
        let h = harness().await;

        h.session.stop().await;
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert_eq!(h.platform.counters().devices_closed(), 1);
        assert_eq!(h.transport.close_count(), 1);

        // Starting afterwards does nothing
        h.session.start().await;
        assert_eq!(h.session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_drop_before_start_releases_resources() {
        let Harness {
            platform,
            transport,
            session,
            ..
        } = harness().await;

        drop(session);

        tokio::time::timeout(WAIT, async {
            while transport.close_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("resources not released");
        assert_eq!(platform.counters().devices_closed(), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_no_io_after_stop() {
        let h = harness().await;
        h.session.start().await;
        h.session.stop().await;

        h.device.inject(b"late".to_vec());
        h.transport.inject(h.codec.encrypt(b"late").unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.transport.sent().is_empty());
        assert!(h.device.written().is_empty());
    }
}
