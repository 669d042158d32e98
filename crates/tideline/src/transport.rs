//! Transport seam: a `Connector` dials an endpoint and yields a pair of
//! channels, one for outbound text frames and one for inbound transport
//! events. The reconnect logic only ever sees `TransportEvent`s, so it can be
//! exercised with the mock connector instead of a live socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

use crate::error::TransportError;

/// Why a transport went away. `Clean` closes (caller-initiated, or a normal
/// close code from the far end) never trigger a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Clean,
    Abrupt(String),
}

impl CloseReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Clean)
    }
}

/// One inbound event on a live transport, consumed in delivery order.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(String),
    Closed(CloseReason),
}

/// Channels for one live transport. Dropping the pair tears the socket down:
/// the writer half sends a close frame once the outbound sender is gone, and
/// the reader half stops as soon as the event receiver is gone.
pub struct TransportPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Handle consumers use to push frames at the far end. Sending between
/// transports fails instead of buffering silently.
#[derive(Clone)]
pub struct OutboundFrames {
    tx: mpsc::UnboundedSender<String>,
}

impl OutboundFrames {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::ChannelClosed)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<TransportPair, TransportError>;
}

/// Production connector over tokio-tungstenite. Accepts http(s) endpoints and
/// swaps only the scheme to ws(s), preserving path and query.
#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn dial(&self, endpoint: &str) -> Result<TransportPair, TransportError> {
        let url = tideline_proto::ws_endpoint(endpoint);
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|err| TransportError::Dial(err.to_string()))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Writer half: forward queued frames; once the sender side is
        // dropped, say goodbye with a close frame.
        let send_task = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Reader half: translate socket messages into transport events.
        tokio::spawn(async move {
            let mut reason = CloseReason::Abrupt("connection reset".to_string());
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if events_tx.send(TransportEvent::Frame(text)).is_err() {
                            send_task.abort();
                            return;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if events_tx.send(TransportEvent::Frame(text)).is_err() {
                                send_task.abort();
                                return;
                            }
                        }
                        Err(_) => warn!("dropping non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        reason = classify_close(frame.as_ref());
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        reason = CloseReason::Abrupt(err.to_string());
                        break;
                    }
                }
            }
            let _ = events_tx.send(TransportEvent::Closed(reason));
            send_task.abort();
        });

        Ok(TransportPair {
            outbound: outbound_tx,
            events: events_rx,
        })
    }
}

fn classify_close(frame: Option<&CloseFrame<'_>>) -> CloseReason {
    match frame {
        None => CloseReason::Clean,
        Some(frame) if frame.code == CloseCode::Normal => CloseReason::Clean,
        Some(frame) => CloseReason::Abrupt(format!("close code {}", frame.code)),
    }
}

pub mod mock {
    //! In-memory connector for tests and non-network contexts. Scripted dial
    //! refusals plus a handle per accepted dial let tests play the server
    //! side of a session without a socket.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{CloseReason, Connector, TransportEvent, TransportPair};
    use crate::error::TransportError;
    use async_trait::async_trait;

    /// The server side of one accepted mock dial.
    pub struct MockRemote {
        pub endpoint: String,
        frames: mpsc::UnboundedSender<TransportEvent>,
        pub outbound: mpsc::UnboundedReceiver<String>,
    }

    impl MockRemote {
        /// Deliver a text frame to the client. Returns false once the client
        /// side has been torn down.
        pub fn send_text(&self, raw: impl Into<String>) -> bool {
            self.frames
                .send(TransportEvent::Frame(raw.into()))
                .is_ok()
        }

        pub fn close(&self, reason: CloseReason) {
            let _ = self.frames.send(TransportEvent::Closed(reason));
        }
    }

    #[derive(Default)]
    struct Script {
        refusals: VecDeque<()>,
        refuse_all: bool,
    }

    pub struct MockConnector {
        script: Mutex<Script>,
        remotes: mpsc::UnboundedSender<MockRemote>,
        dial_times: Mutex<Vec<Instant>>,
    }

    impl MockConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockRemote>) {
            let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: Mutex::new(Script::default()),
                remotes: remotes_tx,
                dial_times: Mutex::new(Vec::new()),
            });
            (connector, remotes_rx)
        }

        /// Refuse the next `n` dials with a transport error.
        pub fn refuse_next(&self, n: usize) {
            let mut script = self.script.lock();
            for _ in 0..n {
                script.refusals.push_back(());
            }
        }

        pub fn refuse_all(&self, refuse: bool) {
            self.script.lock().refuse_all = refuse;
        }

        pub fn dial_count(&self) -> usize {
            self.dial_times.lock().len()
        }

        pub fn dial_times(&self) -> Vec<Instant> {
            self.dial_times.lock().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn dial(&self, endpoint: &str) -> Result<TransportPair, TransportError> {
            self.dial_times.lock().push(Instant::now());
            let refused = {
                let mut script = self.script.lock();
                script.refuse_all || script.refusals.pop_front().is_some()
            };
            if refused {
                return Err(TransportError::Dial("mock refusal".to_string()));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let remote = MockRemote {
                endpoint: endpoint.to_string(),
                frames: events_tx,
                outbound: outbound_rx,
            };
            self.remotes
                .send(remote)
                .map_err(|_| TransportError::Dial("mock harness gone".to_string()))?;
            Ok(TransportPair {
                outbound: outbound_tx,
                events: events_rx,
            })
        }
    }
}
