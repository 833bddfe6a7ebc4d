//! In-memory platform, device and transport fakes for tests
//!
//! Each fake counts open/close calls and can append to a shared
//! [`EventLog`], so tests can assert both "exactly once" and ordering
//! across sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{SessionConfig, TransportKind};
use crate::error::{InterfaceError, TransportError};
use crate::transport::{Connector, Transport};
use crate::tunnel::{InterfaceRequest, PacketDevice, Platform};

/// Ordered record of resource events shared between fakes
#[derive(Debug, Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Open/close tallies
#[derive(Debug, Default)]
pub(crate) struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl Counters {
    pub(crate) fn devices_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn devices_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn transports_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn transports_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Platform that hands out [`FakeDevice`]s
pub(crate) struct FakePlatform {
    applications: Vec<String>,
    requests: Mutex<Vec<InterfaceRequest>>,
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    deny_next: AtomicBool,
    counters: Arc<Counters>,
    log: EventLog,
}

impl FakePlatform {
    pub(crate) fn new() -> Self {
        Self::with_applications(&[])
    }

    pub(crate) fn with_applications(applications: &[&str]) -> Self {
        Self {
            applications: applications.iter().map(|s| s.to_string()).collect(),
            requests: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            deny_next: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
            log: EventLog::new(),
        }
    }

    pub(crate) fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    /// Make the next `establish` fail as if the platform refused
    pub(crate) fn deny_next(&self) {
        self.deny_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn last_request(&self) -> Option<InterfaceRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub(crate) fn device(&self, index: usize) -> Option<Arc<FakeDevice>> {
        self.devices.lock().unwrap().get(index).cloned()
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn establish(
        &self,
        request: InterfaceRequest,
    ) -> Result<Box<dyn PacketDevice>, InterfaceError> {
        self.requests.lock().unwrap().push(request);
        if self.deny_next.swap(false, Ordering::SeqCst) {
            return Err(InterfaceError::Denied {
                reason: "VPN owned by another application".to_string(),
            });
        }

        let index = {
            let mut devices = self.devices.lock().unwrap();
            let device = Arc::new(FakeDevice::new(
                devices.len(),
                self.counters.clone(),
                self.log.clone(),
            ));
            devices.push(device);
            devices.len() - 1
        };
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("open device {}", index));

        let device = self.device(index).ok_or_else(|| InterfaceError::CreateFailed {
            reason: "device vanished".to_string(),
        })?;
        Ok(Box::new(device))
    }

    fn installed_applications(&self) -> Vec<String> {
        self.applications.clone()
    }
}

/// Packet device fed from a channel, capturing everything written to it
pub(crate) struct FakeDevice {
    index: usize,
    name: String,
    inbound_tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Vec<u8>>>>,
    written_tx: mpsc::UnboundedSender<Vec<u8>>,
    written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    finished: AtomicBool,
    closed: AtomicBool,
    counters: Arc<Counters>,
    log: EventLog,
}

impl FakeDevice {
    fn new(index: usize, counters: Arc<Counters>, log: EventLog) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        Self {
            index,
            name: format!("tun{}", index),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written_tx,
            written_rx: tokio::sync::Mutex::new(written_rx),
            written: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters,
            log,
        }
    }

    /// Queue a packet as if the OS routed it into the tunnel
    pub(crate) fn inject(&self, packet: Vec<u8>) {
        let _ = self.inbound_tx.send(Some(packet));
    }

    /// Make `recv` report end of interface after queued packets
    pub(crate) fn finish(&self) {
        let _ = self.inbound_tx.send(None);
    }

    /// Wait for the next packet written to the device
    pub(crate) async fn next_written(&self) -> Option<Vec<u8>> {
        self.written_rx.lock().await.recv().await
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl PacketDevice for Arc<FakeDevice> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) || self.finished.load(Ordering::SeqCst) {
            return Ok(0);
        }
        match self.inbound_rx.lock().await.recv().await {
            Some(Some(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Some(None) | None => {
                self.finished.store(true, Ordering::SeqCst);
                Ok(0)
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "device closed",
            ));
        }
        self.written.lock().unwrap().push(packet.to_vec());
        let _ = self.written_tx.send(packet.to_vec());
        Ok(packet.len())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("close device {}", self.index));
    }
}

/// Connector that hands out [`FakeTransport`]s
pub(crate) struct FakeConnector {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    endpoints: Mutex<Vec<(String, TransportKind)>>,
    fail_next: AtomicBool,
    hang_next: AtomicBool,
    fail_send: AtomicBool,
    counters: Arc<Counters>,
    log: EventLog,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self {
            transports: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            hang_next: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
            log: EventLog::new(),
        }
    }

    pub(crate) fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    /// Make the next `connect` fail as a handshake failure
    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make the next `connect` never complete, like a stalled handshake
    pub(crate) fn hang_next(&self) {
        self.hang_next.store(true, Ordering::SeqCst);
    }

    /// Transports created from now on fail every send
    pub(crate) fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub(crate) fn transport(&self, index: usize) -> Option<Arc<FakeTransport>> {
        self.transports.lock().unwrap().get(index).cloned()
    }

    /// `(host:port, kind)` for every connect attempt
    pub(crate) fn endpoints(&self) -> Vec<(String, TransportKind)> {
        self.endpoints.lock().unwrap().clone()
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Transport>, TransportError> {
        let endpoint = config.server_endpoint();
        self.endpoints
            .lock()
            .unwrap()
            .push((endpoint.clone(), config.transport));

        if self.hang_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            self.log.push("connect transport failed");
            return Err(TransportError::HandshakeFailed {
                reason: "server rejected upgrade".to_string(),
            });
        }

        let transport = {
            let mut transports = self.transports.lock().unwrap();
            let transport = Arc::new(FakeTransport::new(
                transports.len(),
                endpoint.parse().ok(),
                self.counters.clone(),
                self.log.clone(),
            ));
            transport
                .fail_send
                .store(self.fail_send.load(Ordering::SeqCst), Ordering::SeqCst);
            transports.push(transport.clone());
            transport
        };
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("connect transport {}", transport.id));
        Ok(Box::new(transport))
    }
}

/// Transport fed from a channel, capturing every sent frame
pub(crate) struct FakeTransport {
    id: usize,
    peer: Option<SocketAddr>,
    inbound_tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Vec<u8>>>>,
    sent_tx: mpsc::UnboundedSender<Vec<u8>>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    fail_send: AtomicBool,
    ended: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
    counters: Arc<Counters>,
    log: EventLog,
}

impl FakeTransport {
    fn new(id: usize, peer: Option<SocketAddr>, counters: Arc<Counters>, log: EventLog) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            id,
            peer,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            sent: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            counters,
            log,
        }
    }

    /// A transport not tied to any connector
    pub(crate) fn standalone() -> Arc<Self> {
        Arc::new(Self::new(0, None, Arc::new(Counters::default()), EventLog::new()))
    }

    /// Where the connector pointed this transport
    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a frame as if it arrived from the server
    pub(crate) fn inject(&self, frame: Vec<u8>) {
        let _ = self.inbound_tx.send(Some(frame));
    }

    /// Make `receive` report end of stream after queued frames
    pub(crate) fn end_stream(&self) {
        let _ = self.inbound_tx.send(None);
    }

    pub(crate) fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Wait for the next frame sent to the server
    pub(crate) async fn next_sent(&self) -> Option<Vec<u8>> {
        self.sent_rx.lock().await.recv().await
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Arc<FakeTransport> {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                reason: "network unreachable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        let _ = self.sent_tx.send(frame.to_vec());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.ended.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.inbound_rx.lock().await.recv().await {
            Some(Some(frame)) => Ok(Some(frame)),
            Some(None) | None => {
                self.ended.store(true, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("close transport {}", self.id));
    }
}
