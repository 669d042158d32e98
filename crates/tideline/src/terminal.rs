//! Byte-stream duplex channel for interactive terminal tabs. No snapshot:
//! decoded output bytes go straight to the tab's callbacks. Each tab owns an
//! independent session keyed by tab id; disposing one tab never touches
//! another tab's transport, timer or callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tideline_proto::TerminalFrame;
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::connection::{
    ConnectionManager, ConnectionStatus, FrameDisposition, FrameSink, SessionState,
};
use crate::error::TransportError;
use crate::transport::{CloseReason, OutboundFrames};

pub struct TerminalCallbacks {
    on_output: Box<dyn Fn(Vec<u8>) + Send + Sync>,
    on_exit: Box<dyn Fn() + Send + Sync>,
}

impl TerminalCallbacks {
    pub fn new(on_output: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Self {
        Self {
            on_output: Box::new(on_output),
            on_exit: Box::new(|| {}),
        }
    }

    pub fn with_on_exit(mut self, on_exit: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_exit = Box::new(on_exit);
        self
    }
}

struct TerminalSink {
    callbacks: TerminalCallbacks,
    outbound: Mutex<Option<OutboundFrames>>,
}

impl TerminalSink {
    fn send(&self, frame: &TerminalFrame) -> Result<(), TransportError> {
        let guard = self.outbound.lock();
        let outbound = guard.as_ref().ok_or(TransportError::NotConnected)?;
        outbound.send(frame.encode())
    }
}

impl FrameSink for TerminalSink {
    fn on_connected(&self, outbound: OutboundFrames) {
        *self.outbound.lock() = Some(outbound);
    }

    fn on_frame(&self, raw: &str) -> FrameDisposition {
        match TerminalFrame::decode(raw) {
            Ok(TerminalFrame::Output { data }) => {
                (self.callbacks.on_output)(data);
                FrameDisposition::Applied
            }
            // The remote process ended. That is information for the
            // consumer, not a signal to stop reconnecting; only the socket's
            // own lifecycle drives retries on this channel.
            Ok(TerminalFrame::Exit) => {
                (self.callbacks.on_exit)();
                FrameDisposition::Applied
            }
            Ok(TerminalFrame::Input { .. }) | Ok(TerminalFrame::Resize { .. }) => {
                warn!("dropping caller-bound frame echoed by server");
                FrameDisposition::Ignored
            }
            Err(err) => {
                warn!(%err, "dropping malformed terminal frame");
                FrameDisposition::Ignored
            }
        }
    }

    fn on_disconnected(&self, _reason: &CloseReason) {
        *self.outbound.lock() = None;
    }
}

/// Registry of live terminal tabs over one connection manager.
pub struct TerminalChannels {
    manager: Arc<ConnectionManager>,
    tabs: Mutex<HashMap<String, Arc<TerminalSink>>>,
    policy: BackoffPolicy,
}

impl TerminalChannels {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            tabs: Mutex::new(HashMap::new()),
            policy: BackoffPolicy::terminal(),
        }
    }

    /// Open (or supersede) the tab's session.
    pub fn open_tab(
        &self,
        tab_id: impl Into<String>,
        endpoint: impl Into<String>,
        callbacks: TerminalCallbacks,
    ) -> Arc<SessionState> {
        let tab_id = tab_id.into();
        let sink = Arc::new(TerminalSink {
            callbacks,
            outbound: Mutex::new(None),
        });
        self.tabs.lock().insert(tab_id.clone(), sink.clone());
        self.manager.open(tab_id, endpoint, self.policy, sink)
    }

    pub fn send_input(&self, tab_id: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let sink = self
            .tabs
            .lock()
            .get(tab_id)
            .cloned()
            .ok_or(TransportError::NotConnected)?;
        sink.send(&TerminalFrame::input(bytes))
    }

    pub fn resize(&self, tab_id: &str, cols: u16, rows: u16) -> Result<(), TransportError> {
        let sink = self
            .tabs
            .lock()
            .get(tab_id)
            .cloned()
            .ok_or(TransportError::NotConnected)?;
        sink.send(&TerminalFrame::Resize { cols, rows })
    }

    pub fn status(&self, tab_id: &str) -> Option<ConnectionStatus> {
        self.manager.status(tab_id)
    }

    pub async fn dispose_tab(&self, tab_id: &str) {
        self.tabs.lock().remove(tab_id);
        self.manager.dispose(tab_id).await;
    }

    pub async fn dispose_all(&self) {
        let tab_ids: Vec<String> = self.tabs.lock().keys().cloned().collect();
        for tab_id in tab_ids {
            self.dispose_tab(&tab_id).await;
        }
    }
}
