use thiserror::Error;

/// Failure to establish or use a transport. Drives the retry policy; never
/// surfaced to consumers beyond a disconnected indicator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("not connected")]
    NotConnected,
    #[error("transport channel closed")]
    ChannelClosed,
}

/// A patch batch that could not be applied. The whole batch is discarded and
/// the prior snapshot retained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("invalid pointer {path:?}")]
    BadPointer { path: String },
    #[error("test failed at {path:?}")]
    TestFailed { path: String },
    #[error("missing value for {op} at {path:?}")]
    MissingValue { op: &'static str, path: String },
    #[error("missing from pointer for {op} at {path:?}")]
    MissingFrom { op: &'static str, path: String },
    #[error("collection shape mismatch at {path:?}: {detail}")]
    ShapeMismatch { path: String, detail: String },
}

/// What gets recorded in a session's error slot. Last error wins; the slot is
/// cleared by the next successfully applied frame or a fresh connect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("patch rejected: {0}")]
    Patch(#[from] PatchError),
}
