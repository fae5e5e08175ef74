use std::{path::Path, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use shared::protocol::{AttachmentDescriptor, HistoryAnchor, PairingEvent, ProtocolEvent};
use tokio::sync::mpsc;

/// Receives every asynchronous event a protocol client produces for one session.
///
/// Clients deliver events for a single session one at a time, in order.
#[async_trait]
pub trait ProtocolEventHandler: Send + Sync {
    async fn handle_event(&self, event: ProtocolEvent);
}

/// The wrapped messaging-protocol client for one session.
///
/// Authentication, encryption and framing all live behind this trait.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Whether a paired identity is already persisted for this client.
    async fn has_identity(&self) -> Result<bool>;
    /// Pairing codes for a first-time login. Must be requested before `open`.
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>>;
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn add_event_handler(&self, handler: Arc<dyn ProtocolEventHandler>);
    async fn download(&self, descriptor: &AttachmentDescriptor) -> Result<Vec<u8>>;
    async fn request_history_sync(&self, anchor: Option<&HistoryAnchor>, count: u32)
        -> Result<()>;
}

/// Builds an unconnected client bound to a session's storage path.
///
/// Creating the client is expected to create the storage resource at `storage_path`.
#[async_trait]
pub trait ProtocolClientFactory: Send + Sync {
    async fn create(&self, storage_path: &Path) -> Result<Arc<dyn ProtocolClient>>;
}
