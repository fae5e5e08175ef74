//! Multi-session client management with a lazily fetched index of historical media.

use shared::domain::ConnectionState;

pub mod error;
mod event_bridge;
pub mod loopback;
pub mod media_index;
pub mod protocol_client;
mod registry;
mod session_handle;
pub mod storage_path;

pub use error::{AggregateFailure, SessionError, SessionResult};
pub use event_bridge::EventBridge;
pub use loopback::{LoopbackClient, LoopbackClientFactory};
pub use media_index::{MediaIndex, MediaItem};
pub use protocol_client::{ProtocolClient, ProtocolClientFactory, ProtocolEventHandler};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session_handle::{SessionHandle, SessionStatus};
pub use tokio_util::sync::CancellationToken;

/// Notifications published to callers of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A first-time pairing produced a code the user must confirm out of band.
    PairingCode { session: String, code: String },
    StateChanged {
        session: String,
        state: ConnectionState,
    },
    HistorySynced {
        session: String,
        records: usize,
        media_items: usize,
    },
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
