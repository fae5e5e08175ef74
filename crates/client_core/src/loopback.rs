//! Offline protocol backend.
//!
//! Pairs automatically, persists its identity in a [`DeviceStore`] at the
//! session's storage path, and serves attachments whose descriptor carries the
//! payload inline. Useful for running the manager without network access.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use shared::protocol::{
    AttachmentDescriptor, HistoryAnchor, HistoryRecord, HistorySyncBatch, PairingEvent,
    ProtocolEvent,
};
use storage::DeviceStore;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::protocol_client::{ProtocolClient, ProtocolClientFactory, ProtocolEventHandler};

const PAIRING_CHANNEL_CAPACITY: usize = 8;

pub struct LoopbackClient {
    store: DeviceStore,
    history: Vec<HistoryRecord>,
    handlers: RwLock<Vec<Arc<dyn ProtocolEventHandler>>>,
    pairing: Mutex<Option<mpsc::Sender<PairingEvent>>>,
    open: AtomicBool,
}

impl LoopbackClient {
    pub fn new(store: DeviceStore) -> Self {
        Self::with_history(store, Vec::new())
    }

    /// History replayed to the session after every successful open.
    pub fn with_history(store: DeviceStore, history: Vec<HistoryRecord>) -> Self {
        Self {
            store,
            history,
            handlers: RwLock::new(Vec::new()),
            pairing: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Forgets the identity and reports a logout, as a remote unlink would.
    pub async fn log_out(&self) -> Result<()> {
        self.store.clear_identity().await?;
        self.open.store(false, Ordering::Release);
        self.dispatch(ProtocolEvent::LoggedOut).await;
        Ok(())
    }

    pub async fn deliver_history(&self, batch: HistorySyncBatch) {
        self.dispatch(ProtocolEvent::HistorySync(batch)).await;
    }

    async fn dispatch(&self, event: ProtocolEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.handle_event(event.clone()).await;
        }
    }

    async fn pair(&self) -> Result<()> {
        let sender = self.pairing.lock().await.take();
        let code = format!("loopback-{}", Uuid::new_v4());
        if let Some(sender) = &sender {
            let _ = sender.send(PairingEvent::Code(code.clone())).await;
        }
        self.store
            .save_identity(code.as_bytes())
            .await
            .context("failed to persist loopback identity")?;
        if let Some(sender) = &sender {
            let _ = sender.send(PairingEvent::Success).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn has_identity(&self) -> Result<bool> {
        self.store.has_identity().await
    }

    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>> {
        let (sender, receiver) = mpsc::channel(PAIRING_CHANNEL_CAPACITY);
        *self.pairing.lock().await = Some(sender);
        Ok(receiver)
    }

    async fn open(&self) -> Result<()> {
        if !self.store.has_identity().await? {
            self.pair().await?;
        }
        self.open.store(true, Ordering::Release);
        self.dispatch(ProtocolEvent::Connected).await;
        if !self.history.is_empty() {
            self.deliver_history(HistorySyncBatch::new(self.history.clone()))
                .await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.dispatch(ProtocolEvent::Disconnected).await;
        }
        Ok(())
    }

    fn add_event_handler(&self, handler: Arc<dyn ProtocolEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    async fn download(&self, descriptor: &AttachmentDescriptor) -> Result<Vec<u8>> {
        descriptor
            .reference_bytes()
            .context("loopback attachment reference is not valid base64")
    }

    async fn request_history_sync(
        &self,
        anchor: Option<&HistoryAnchor>,
        count: u32,
    ) -> Result<()> {
        if !self.is_open() {
            bail!("loopback client is not open");
        }

        let mut older: Vec<HistoryRecord> = self
            .history
            .iter()
            .filter(|record| anchor.map_or(true, |anchor| record.sent_at < anchor.sent_at))
            .cloned()
            .collect();
        older.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        older.truncate(count as usize);
        debug!(records = older.len(), "loopback: replaying requested history");
        self.deliver_history(HistorySyncBatch::new(older)).await;
        Ok(())
    }
}

/// Creates a [`LoopbackClient`] per session, each with its own device database.
#[derive(Default)]
pub struct LoopbackClientFactory {
    history: Vec<HistoryRecord>,
}

impl LoopbackClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: Vec<HistoryRecord>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl ProtocolClientFactory for LoopbackClientFactory {
    async fn create(&self, storage_path: &Path) -> Result<Arc<dyn ProtocolClient>> {
        let store = DeviceStore::open_path(storage_path).await?;
        Ok(Arc::new(LoopbackClient::with_history(
            store,
            self.history.clone(),
        )))
    }
}
