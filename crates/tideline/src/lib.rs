//! tideline keeps a locally-held mirror of server-authoritative state
//! synchronized over an unreliable, long-lived WebSocket, and multiplexes
//! interactive terminal byte streams with the same connection discipline:
//! exponential backoff, terminal-vs-transient close classification, and
//! strict per-session isolation.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod patch;
pub mod snapshot;
pub mod structured;
pub mod subscribers;
pub mod terminal;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionManager, ConnectionStatus, SessionState};
pub use error::{PatchError, SyncError, TransportError};
pub use snapshot::{Entries, Entry, Snapshot};
pub use structured::{StructuredChannel, StructuredConfig};
pub use subscribers::Subscription;
pub use terminal::{TerminalCallbacks, TerminalChannels};
pub use transport::{CloseReason, Connector, WebSocketConnector};

pub use tideline_proto::{OpKind, PatchOp, StructuredEnvelope, TerminalFrame};
