//! Structured object channel: mirrors a collection/object resource by
//! composing the connection lifecycle manager with the patch engine. The
//! server sends a full snapshot, a `Ready` marker, then patch batches; a
//! terminal marker freezes the mirror even while the socket lingers.

use std::sync::Arc;

use parking_lot::Mutex;
use tideline_proto::StructuredEnvelope;
use tokio::sync::watch;
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::connection::{
    ConnectionManager, ConnectionStatus, FrameDisposition, FrameSink, SessionState,
};
use crate::error::SyncError;
use crate::patch::{BatchOutcome, PatchEngine};
use crate::snapshot::Entries;
use crate::subscribers::{SubscriberRegistry, Subscription};
use crate::transport::{CloseReason, OutboundFrames};

pub type FinishFn = Box<dyn Fn(&Entries) + Send + Sync>;
pub type InjectFn = Box<dyn FnOnce(&mut Entries) + Send>;

pub struct StructuredConfig {
    /// http(s) resource URL; only the scheme is swapped when dialing.
    pub endpoint: String,
    /// Seed snapshot, fixing the collection shape (list, map or single).
    pub seed: Entries,
    /// Optional hook to pre-populate synthetic entries (e.g. an optimistic
    /// local placeholder) before any server frame arrives.
    pub inject_initial_entry: Option<InjectFn>,
    /// Invoked once with the final entries when the stream finishes.
    pub on_finished: Option<FinishFn>,
    pub policy: BackoffPolicy,
}

impl StructuredConfig {
    pub fn new(endpoint: impl Into<String>, seed: Entries) -> Self {
        Self {
            endpoint: endpoint.into(),
            seed,
            inject_initial_entry: None,
            on_finished: None,
            policy: BackoffPolicy::structured(),
        }
    }

    pub fn with_injection(mut self, inject: impl FnOnce(&mut Entries) + Send + 'static) -> Self {
        self.inject_initial_entry = Some(Box::new(inject));
        self
    }

    pub fn with_on_finished(mut self, callback: impl Fn(&Entries) + Send + Sync + 'static) -> Self {
        self.on_finished = Some(Box::new(callback));
        self
    }
}

struct StructuredSink {
    engine: Mutex<PatchEngine>,
    registry: SubscriberRegistry,
    on_finished: Option<FinishFn>,
}

impl StructuredSink {
    /// Replay and registration both happen under the engine lock, so they
    /// cannot interleave with a commit on the driver task; a commit whose
    /// notification is still in flight is skipped by its version tag.
    fn subscribe(&self, callback: impl Fn(&Entries) + Send + Sync + 'static) -> Subscription {
        let engine = self.engine.lock();
        self.registry
            .subscribe(engine.entries(), engine.version(), callback)
    }
}

impl FrameSink for StructuredSink {
    fn on_connected(&self, _outbound: OutboundFrames) {
        // Receive-only: the mirror never originates operations.
    }

    fn on_frame(&self, raw: &str) -> FrameDisposition {
        let envelope = match StructuredEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "dropping malformed frame");
                return FrameDisposition::Ignored;
            }
        };
        match envelope {
            StructuredEnvelope::Ready(_) => {
                self.engine.lock().mark_ready();
                FrameDisposition::Applied
            }
            StructuredEnvelope::JsonPatch(ops) => {
                let mut engine = self.engine.lock();
                match engine.apply_batch(ops) {
                    Ok(BatchOutcome::Applied) => {
                        let entries = engine.entries().clone();
                        let version = engine.version();
                        drop(engine);
                        self.registry.notify(version, &entries);
                        FrameDisposition::Applied
                    }
                    Ok(BatchOutcome::IgnoredFinished) => FrameDisposition::Ignored,
                    Err(err) => FrameDisposition::Failed(SyncError::Patch(err)),
                }
            }
            envelope @ StructuredEnvelope::Finished(_) => {
                if !envelope.is_terminal() {
                    return FrameDisposition::Ignored;
                }
                let mut engine = self.engine.lock();
                if engine.is_finished() {
                    return FrameDisposition::Ignored;
                }
                let last = engine.mark_finished();
                drop(engine);
                if let Some(callback) = &self.on_finished {
                    callback(&last);
                }
                FrameDisposition::Applied
            }
        }
    }

    fn on_disconnected(&self, _reason: &CloseReason) {}

    fn is_finished(&self) -> bool {
        self.engine.lock().is_finished()
    }
}

/// A live mirror of one structured resource.
pub struct StructuredChannel {
    manager: Arc<ConnectionManager>,
    key: String,
    state: Arc<SessionState>,
    sink: Arc<StructuredSink>,
}

impl StructuredChannel {
    pub fn open(
        manager: Arc<ConnectionManager>,
        key: impl Into<String>,
        config: StructuredConfig,
    ) -> Self {
        let mut engine = PatchEngine::new(config.seed);
        if let Some(inject) = config.inject_initial_entry {
            inject(engine.entries_mut());
        }
        let sink = Arc::new(StructuredSink {
            engine: Mutex::new(engine),
            registry: SubscriberRegistry::new(),
            on_finished: config.on_finished,
        });
        let key = key.into();
        let state = manager.open(key.clone(), config.endpoint, config.policy, sink.clone());
        Self {
            manager,
            key,
            state,
            sink,
        }
    }

    /// Synchronously replays the current entries, then delivers every later
    /// commit exactly once until unsubscribed. A commit racing the
    /// subscription is seen either in the replay or as an update, never both
    /// and never neither.
    pub fn subscribe(&self, callback: impl Fn(&Entries) + Send + Sync + 'static) -> Subscription {
        self.sink.subscribe(callback)
    }

    pub fn entries(&self) -> Entries {
        self.sink.engine.lock().entries().clone()
    }

    /// True once the first full snapshot has been delivered, empty or not.
    pub fn is_initialized(&self) -> bool {
        self.sink.engine.lock().is_initialized()
    }

    pub fn is_finished(&self) -> bool {
        self.sink.engine.lock().is_finished()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.state.watch_status()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.state.last_error()
    }

    /// Permanent: closes the transport, cancels any pending retry, clears
    /// subscribers and discards the snapshot.
    pub async fn dispose(self) {
        self.manager.dispose(&self.key).await;
        self.sink.registry.clear();
    }
}
