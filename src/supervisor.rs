//! Owner of the single active tunnel session
//!
//! [`SessionSupervisor::connect`] and [`SessionSupervisor::disconnect`] are
//! serialized by one lock, so a new session's resources are never acquired
//! before the previous session has been joined and released. Status and
//! counters are published separately and can be read while a connect is in
//! progress.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::{SessionConfig, TransportKind};
use crate::crypto::CipherCodec;
use crate::error::{InterfaceError, Result, VtunnelError};
use crate::session::{ForwardingSession, SessionState, StatsSnapshot, StopReason};
use crate::transport::Connector;
use crate::tunnel::{Platform, TunInterface};

/// Lifecycle notifications for observers such as the daemon's event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connecting { server: String },
    Connected { server: String, interface: String },
    Disconnected,
    Failed { reason: String },
}

/// Snapshot of the supervisor for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    /// `idle` when no session has been started
    pub state: SessionState,
    pub server: Option<String>,
    pub transport: Option<String>,
    pub interface: Option<String>,
    pub local_address: Option<String>,
    pub excluded_applications: Vec<String>,
    /// Seconds since the Unix epoch when the session came up
    pub connected_at: Option<u64>,
    /// Why the last connect or session failed
    pub last_error: Option<String>,
}

struct ActiveSession {
    session: Arc<ForwardingSession>,
    watcher: JoinHandle<()>,
}

/// Read side shared with status queries
#[derive(Default)]
struct Published {
    session: Option<Arc<ForwardingSession>>,
    server: Option<String>,
    transport: Option<TransportKind>,
    connecting: bool,
    connected_at: Option<u64>,
    last_error: Option<String>,
}

/// Serializes connect/disconnect and owns at most one [`ForwardingSession`]
pub struct SessionSupervisor {
    platform: Arc<dyn Platform>,
    connector: Arc<dyn Connector>,
    active: Mutex<Option<ActiveSession>>,
    published: StdMutex<Published>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionSupervisor {
    pub fn new(platform: Arc<dyn Platform>, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            platform,
            connector,
            active: Mutex::new(None),
            published: StdMutex::new(Published::default()),
            events,
        }
    }

    /// Replace any active session with a new one built from `config`
    ///
    /// On failure everything acquired so far is released and no session is
    /// recorded. The same holds if the returned future is dropped midway.
    pub async fn connect(&self, config: SessionConfig) -> Result<()> {
        config.validate()?;

        let mut active = self.active.lock().await;
        let attempt = ConnectAttempt::new(&self.published);

        if let Some(previous) = active.take() {
            tracing::info!("Replacing active session");
            self.teardown(previous).await;
            self.emit(SessionEvent::Disconnected);
        }

        let server = config.server_endpoint();
        self.publish(|p| {
            *p = Published {
                server: Some(server.clone()),
                transport: Some(config.transport),
                connecting: true,
                ..Published::default()
            }
        });
        self.emit(SessionEvent::Connecting {
            server: server.clone(),
        });

        let result = self.establish(&config).await;
        attempt.finish();

        match result {
            Ok(session) => {
                let interface = session.interface_info().name.clone();
                let watcher = tokio::spawn(watch_session(session.clone(), self.events.clone()));
                self.publish(|p| {
                    p.session = Some(session.clone());
                    p.connecting = false;
                    p.connected_at = Some(unix_now());
                });
                *active = Some(ActiveSession { session, watcher });

                tracing::info!("Connected to {} via {}", server, interface);
                self.emit(SessionEvent::Connected { server, interface });
                Ok(())
            }
            Err(e) => {
                tracing::error!("Connect to {} failed: {}", server, e);
                self.publish(|p| {
                    p.connecting = false;
                    p.last_error = Some(e.to_string());
                });
                self.emit(SessionEvent::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Build and start a session, undoing partial acquisition on error
    async fn establish(&self, config: &SessionConfig) -> Result<Arc<ForwardingSession>> {
        let codec = CipherCodec::new(&config.shared_key)?;
        let interface =
            AcquiredInterface(Some(TunInterface::acquire(self.platform.as_ref(), config).await?));

        let transport = match self.connector.connect(config).await {
            Ok(transport) => transport,
            Err(e) => {
                interface.release().await;
                return Err(VtunnelError::Transport(e));
            }
        };

        // From here the session owns the resources; dropping it stops them
        let session = Arc::new(ForwardingSession::new(interface.into_inner()?, transport, codec));
        session.start().await;
        Ok(session)
    }

    /// Stop the active session, if any, and wait for its teardown
    ///
    /// Returns whether a session was stopped.
    pub async fn disconnect(&self) -> bool {
        let mut active = self.active.lock().await;
        let Some(previous) = active.take() else {
            tracing::debug!("Disconnect with no active session");
            return false;
        };

        self.teardown(previous).await;
        self.emit(SessionEvent::Disconnected);
        tracing::info!("Disconnected");
        true
    }

    async fn teardown(&self, previous: ActiveSession) {
        // A requested stop is not a failure; silence the watcher first
        previous.watcher.abort();
        previous.session.stop().await;

        let reason = previous
            .session
            .stop_reason()
            .filter(|r| r.is_failure())
            .map(|r| r.to_string());
        self.publish(|p| {
            *p = Published {
                last_error: reason,
                ..Published::default()
            }
        });
    }

    /// Current state without waiting for an in-flight connect
    pub fn status(&self) -> SupervisorStatus {
        let published = self.published.lock().unwrap_or_else(|p| p.into_inner());

        let mut status = SupervisorStatus {
            state: SessionState::Idle,
            server: published.server.clone(),
            transport: published.transport.map(|t| t.to_string()),
            interface: None,
            local_address: None,
            excluded_applications: Vec::new(),
            connected_at: published.connected_at,
            last_error: published.last_error.clone(),
        };

        if published.connecting {
            status.state = SessionState::Starting;
        }
        if let Some(session) = &published.session {
            let info = session.interface_info();
            status.state = session.state();
            status.interface = Some(info.name.clone());
            status.local_address = Some(info.address.to_string());
            status.excluded_applications = info.disallowed_applications.iter().cloned().collect();
            if let Some(reason) = session.stop_reason().filter(|r| r.is_failure()) {
                status.last_error = Some(reason.to_string());
            }
        }
        status
    }

    /// Counters of the current session; never blocks the forwarding loops
    pub fn stats(&self) -> Option<StatsSnapshot> {
        let published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        published.session.as_ref().map(|s| s.stats().snapshot())
    }

    /// Wait until the current session has stopped and return why
    ///
    /// Returns at once for a session that already stopped, and `None` when
    /// there is no session.
    pub async fn session_ended(&self) -> Option<StopReason> {
        let session = {
            let published = self.published.lock().unwrap_or_else(|p| p.into_inner());
            published.session.clone()
        }?;
        session.stopped().await;
        session.stop_reason()
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, update: impl FnOnce(&mut Published)) {
        let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut published);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Clears the in-progress publication if a connect is abandoned
struct ConnectAttempt<'a> {
    published: &'a StdMutex<Published>,
    finished: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn new(published: &'a StdMutex<Published>) -> Self {
        Self {
            published,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!("Connect abandoned before completion");
        let mut published = self.published.lock().unwrap_or_else(|p| p.into_inner());
        *published = Published {
            last_error: Some("connect cancelled".to_string()),
            ..Published::default()
        };
    }
}

/// Interface held between acquisition and session construction
///
/// Released in the background if dropped while still held.
struct AcquiredInterface(Option<TunInterface>);

impl AcquiredInterface {
    async fn release(mut self) {
        if let Some(interface) = self.0.take() {
            interface.release().await;
        }
    }

    fn into_inner(mut self) -> Result<TunInterface> {
        self.0.take().ok_or_else(|| {
            VtunnelError::Interface(InterfaceError::CreateFailed {
                reason: "interface already released".to_string(),
            })
        })
    }
}

impl Drop for AcquiredInterface {
    fn drop(&mut self) {
        let Some(interface) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { interface.release().await });
            }
            Err(_) => tracing::warn!(
                "Interface {} abandoned outside a runtime",
                interface.info().name
            ),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Report a session that stops on its own
async fn watch_session(session: Arc<ForwardingSession>, events: broadcast::Sender<SessionEvent>) {
    session.stopped().await;
    if let Some(reason) = session.stop_reason().filter(|r| r.is_failure()) {
        tracing::warn!("Session ended: {}", reason);
        let _ = events.send(SessionEvent::Failed {
            reason: reason.to_string(),
        });
    }
}
