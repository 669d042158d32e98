//! Connection lifecycle management: one transport per session key, a driver
//! task per session that dials, pumps frames into the channel's sink,
//! classifies closes, and schedules capped exponential retries. Sessions are
//! fully independent; the keyed registry is the only shared structure.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::error::SyncError;
use crate::transport::{CloseReason, Connector, OutboundFrames, TransportEvent};

pub type SessionKey = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// No transport open; a retry timer is pending. `attempt` counts retries
    /// scheduled since the last successful open.
    Retrying { attempt: u32 },
    /// Retry budget exhausted; the session stays disconnected until disposed.
    Disconnected,
    /// Intentionally closed or terminally finished; never reconnects.
    Closed,
}

/// What a channel tells the lifecycle manager about one inbound frame. The
/// driver owns the error-slot policy: `Applied` clears it, `Failed` records,
/// `Ignored` (malformed or post-terminal frames) leaves it untouched.
#[derive(Debug)]
pub enum FrameDisposition {
    Applied,
    Ignored,
    Failed(SyncError),
}

/// Channel-side handler for one session's transport events. Calls arrive
/// strictly sequentially from the session's driver task.
pub trait FrameSink: Send + Sync + 'static {
    /// A transport opened; `outbound` pushes frames to the far end until the
    /// next `on_disconnected`.
    fn on_connected(&self, outbound: OutboundFrames);

    fn on_frame(&self, raw: &str) -> FrameDisposition;

    fn on_disconnected(&self, reason: &CloseReason);

    /// Sticky terminal signal. Once true the manager stops reconnecting and
    /// parks the session in `Closed`.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Per-session connection metadata shared with consumers: status watch plus
/// the last-error slot.
pub struct SessionState {
    status: watch::Sender<ConnectionStatus>,
    last_error: Mutex<Option<SyncError>>,
}

impl SessionState {
    fn new() -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Arc::new(Self {
            status,
            last_error: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.last_error.lock().clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let _ = self.status.send_replace(status);
    }

    fn record_error(&self, error: SyncError) {
        *self.last_error.lock() = Some(error);
    }

    fn clear_error(&self) {
        *self.last_error.lock() = None;
    }
}

struct SessionEntry {
    shutdown: watch::Sender<bool>,
    driver: JoinHandle<()>,
    state: Arc<SessionState>,
}

impl SessionEntry {
    /// Detach-then-close: flag the shutdown first so the driver stops
    /// dispatching events, then abort it; dropping the driver's transport
    /// pair closes the socket afterwards.
    fn teardown(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        self.driver.abort();
        self.state.set_status(ConnectionStatus::Closed);
        self.driver
    }
}

/// Owns every live session keyed by resource or tab id. Opening a key that
/// is already live supersedes the old session; disposing one key never
/// touches another.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Open (or supersede) the session under `key`.
    pub fn open(
        &self,
        key: impl Into<SessionKey>,
        endpoint: impl Into<String>,
        policy: BackoffPolicy,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<SessionState> {
        let key = key.into();
        let endpoint = endpoint.into();

        // Supersede, not merge: the old transport goes away before the new
        // one exists.
        let superseded = self.sessions.lock().remove(&key);
        if let Some(old) = superseded {
            debug!(%key, "superseding live session");
            old.teardown();
        }

        let state = SessionState::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = tokio::spawn(drive(
            self.connector.clone(),
            endpoint,
            policy,
            sink,
            state.clone(),
            shutdown_rx,
        ));

        self.sessions.lock().insert(
            key,
            SessionEntry {
                shutdown: shutdown_tx,
                driver,
                state: state.clone(),
            },
        );
        state
    }

    /// Intentional close: permanent for this session instance. Cancels any
    /// pending retry, detaches the event handling, closes the transport and
    /// removes the session.
    pub async fn dispose(&self, key: &str) {
        let entry = self.sessions.lock().remove(key);
        if let Some(entry) = entry {
            let driver = entry.teardown();
            let _ = driver.await;
            debug!(key, "session disposed");
        }
    }

    pub fn status(&self, key: &str) -> Option<ConnectionStatus> {
        self.sessions
            .lock()
            .get(key)
            .map(|entry| entry.state.status())
    }

    pub fn session_state(&self, key: &str) -> Option<Arc<SessionState>> {
        self.sessions.lock().get(key).map(|entry| entry.state.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    /// Tear down every session. Used on shutdown of the owning surface.
    pub async fn dispose_all(&self) {
        let drained: Vec<SessionEntry> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.teardown().await;
        }
    }
}

enum PumpOutcome {
    Shutdown,
    Closed(CloseReason),
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    sink: &dyn FrameSink,
    state: &SessionState,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpOutcome {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return PumpOutcome::Shutdown,
            event = events.recv() => event,
        };
        match event {
            Some(TransportEvent::Frame(raw)) => match sink.on_frame(&raw) {
                FrameDisposition::Applied => state.clear_error(),
                FrameDisposition::Ignored => {}
                FrameDisposition::Failed(error) => {
                    warn!(%error, "frame failed to apply");
                    state.record_error(error);
                }
            },
            Some(TransportEvent::Closed(reason)) => return PumpOutcome::Closed(reason),
            None => {
                return PumpOutcome::Closed(CloseReason::Abrupt(
                    "transport event stream ended".to_string(),
                ))
            }
        }
    }
}

async fn drive(
    connector: Arc<dyn Connector>,
    endpoint: String,
    policy: BackoffPolicy,
    sink: Arc<dyn FrameSink>,
    state: Arc<SessionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Retries scheduled since the last successful open. Resets to zero on a
    // successful dial and nowhere else.
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        state.set_status(ConnectionStatus::Connecting);
        let dialed = tokio::select! {
            _ = shutdown.changed() => break,
            dialed = connector.dial(&endpoint) => dialed,
        };
        match dialed {
            Ok(pair) => {
                attempt = 0;
                state.clear_error();
                state.set_status(ConnectionStatus::Connected);
                sink.on_connected(OutboundFrames::new(pair.outbound));
                match pump_events(pair.events, sink.as_ref(), &state, &mut shutdown).await {
                    PumpOutcome::Shutdown => break,
                    PumpOutcome::Closed(reason) => {
                        sink.on_disconnected(&reason);
                        match reason {
                            CloseReason::Clean => {
                                debug!(endpoint, "transport closed cleanly");
                                state.set_status(ConnectionStatus::Closed);
                                return;
                            }
                            CloseReason::Abrupt(detail) if sink.is_finished() => {
                                debug!(endpoint, detail, "socket lost after terminal signal");
                                state.set_status(ConnectionStatus::Closed);
                                return;
                            }
                            CloseReason::Abrupt(detail) => {
                                warn!(endpoint, detail, "transport lost");
                                state.record_error(SyncError::Transport(detail));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                debug!(endpoint, error = %err, "dial failed");
                state.record_error(SyncError::Transport(err.to_string()));
            }
        }
        if sink.is_finished() {
            state.set_status(ConnectionStatus::Closed);
            return;
        }
        if policy.exhausted(attempt) {
            warn!(endpoint, attempt, "retry budget exhausted; giving up");
            state.set_status(ConnectionStatus::Disconnected);
            return;
        }
        let delay = policy.delay(attempt);
        attempt += 1;
        state.set_status(ConnectionStatus::Retrying { attempt });
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    state.set_status(ConnectionStatus::Closed);
}
