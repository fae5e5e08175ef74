use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::MediaKind,
    protocol::{
        AttachmentDescriptor, HistoryAnchor, HistoryRecord, PairingEvent, ProtocolEvent,
    },
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::protocol_client::{ProtocolClient, ProtocolClientFactory, ProtocolEventHandler};

/// Hand-driven protocol client that counts every collaborator call.
pub(crate) struct ScriptedClient {
    pub identity: AtomicBool,
    pub fail_open: Option<String>,
    pub hang_open: bool,
    pub pairing_script: Vec<PairingEvent>,
    pub keep_pairing_open: bool,
    /// Opens the transport without ever reporting Connected.
    pub quiet_open: bool,
    pub download_payload: Vec<u8>,
    pub fail_download: Option<String>,
    /// Scheduler yields inside each download, letting other fetches interleave.
    pub download_yields: usize,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub history_requests: AtomicUsize,
    pub connected: AtomicBool,
    pub handlers: StdMutex<Vec<Arc<dyn ProtocolEventHandler>>>,
    pub pairing_sender: Mutex<Option<mpsc::Sender<PairingEvent>>>,
    pub parked_pairing_sender: Mutex<Option<mpsc::Sender<PairingEvent>>>,
}

impl ScriptedClient {
    pub fn paired() -> Self {
        Self {
            identity: AtomicBool::new(true),
            fail_open: None,
            hang_open: false,
            pairing_script: Vec::new(),
            keep_pairing_open: false,
            quiet_open: false,
            download_payload: b"attachment-bytes".to_vec(),
            fail_download: None,
            download_yields: 0,
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            history_requests: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            handlers: StdMutex::new(Vec::new()),
            pairing_sender: Mutex::new(None),
            parked_pairing_sender: Mutex::new(None),
        }
    }

    pub fn unpaired(pairing_script: Vec<PairingEvent>) -> Self {
        let client = Self::paired();
        client.identity.store(false, Ordering::SeqCst);
        Self {
            pairing_script,
            ..client
        }
    }

    pub fn failing_open(reason: impl Into<String>) -> Self {
        Self {
            fail_open: Some(reason.into()),
            ..Self::paired()
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().expect("handlers").len()
    }

    pub async fn emit(&self, event: ProtocolEvent) {
        let handlers = self.handlers.lock().expect("handlers").clone();
        for handler in handlers {
            handler.handle_event(event.clone()).await;
        }
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    async fn has_identity(&self) -> Result<bool> {
        Ok(self.identity.load(Ordering::SeqCst))
    }

    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>> {
        let (sender, receiver) = mpsc::channel(16);
        *self.pairing_sender.lock().await = Some(sender);
        Ok(receiver)
    }

    async fn open(&self) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_open {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = &self.fail_open {
            return Err(anyhow!(reason.clone()));
        }

        if let Some(sender) = self.pairing_sender.lock().await.take() {
            for event in &self.pairing_script {
                if matches!(event, PairingEvent::Success) {
                    self.identity.store(true, Ordering::SeqCst);
                }
                sender.send(event.clone()).await.expect("pairing receiver");
            }
            if self.keep_pairing_open {
                *self.parked_pairing_sender.lock().await = Some(sender);
            }
            if !self.identity.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        if !self.quiet_open {
            self.emit(ProtocolEvent::Connected).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(ProtocolEvent::Disconnected).await;
        }
        Ok(())
    }

    fn add_event_handler(&self, handler: Arc<dyn ProtocolEventHandler>) {
        self.handlers.lock().expect("handlers").push(handler);
    }

    async fn download(&self, _descriptor: &AttachmentDescriptor) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_download {
            return Err(anyhow!(reason.clone()));
        }
        for _ in 0..self.download_yields {
            tokio::task::yield_now().await;
        }
        Ok(self.download_payload.clone())
    }

    async fn request_history_sync(
        &self,
        _anchor: Option<&HistoryAnchor>,
        _count: u32,
    ) -> Result<()> {
        self.history_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates scripted clients and the storage file each session expects.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    pub failing_sessions: HashSet<String>,
    pub fail_create: bool,
    /// Created clients open without reporting Connected.
    pub quiet_open: bool,
    /// Notified once the storage file of a create is on disk.
    pub create_started: Arc<Notify>,
    /// When set, each create waits for a notification before returning.
    pub release_create: Option<Arc<Notify>>,
    pub clients: StdMutex<Vec<(PathBuf, Arc<ScriptedClient>)>>,
}

impl ScriptedFactory {
    pub fn failing_for(sessions: &[&str]) -> Self {
        Self {
            failing_sessions: sessions.iter().map(|name| (*name).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn client_for(&self, session: &str) -> Arc<ScriptedClient> {
        let prefix = format!("session_{session}_");
        self.clients
            .lock()
            .expect("clients")
            .iter()
            .rev()
            .find(|(path, _)| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .map(|(_, client)| Arc::clone(client))
            .expect("client created for session")
    }

    pub fn created_count(&self) -> usize {
        self.clients.lock().expect("clients").len()
    }
}

#[async_trait]
impl ProtocolClientFactory for ScriptedFactory {
    async fn create(&self, storage_path: &Path) -> Result<Arc<dyn ProtocolClient>> {
        if self.fail_create {
            return Err(anyhow!("device store unavailable"));
        }
        tokio::fs::write(storage_path, b"").await?;
        self.create_started.notify_one();
        match &self.release_create {
            Some(release) => release.notified().await,
            None => tokio::task::yield_now().await,
        }

        let file_name = storage_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let fails = self
            .failing_sessions
            .iter()
            .any(|session| file_name.starts_with(&format!("session_{session}_")));
        let client = if fails {
            ScriptedClient::failing_open("transport refused")
        } else {
            ScriptedClient::paired()
        };
        let client = Arc::new(ScriptedClient {
            quiet_open: self.quiet_open,
            ..client
        });
        self.clients
            .lock()
            .expect("clients")
            .push((storage_path.to_path_buf(), Arc::clone(&client)));
        Ok(client)
    }
}

pub(crate) fn media_record(message_id: &str, conversation: &str, second: u32) -> HistoryRecord {
    HistoryRecord {
        message_id: message_id.into(),
        conversation_id: conversation.into(),
        sender_id: format!("{conversation}-sender").into(),
        sent_at: Utc
            .with_ymd_and_hms(2024, 5, 17, 9, 30, second)
            .single()
            .expect("timestamp"),
        caption: Some(format!("caption for {message_id}")),
        attachment: Some(
            AttachmentDescriptor::new(MediaKind::Image, message_id.as_bytes())
                .with_mime_type("image/png"),
        ),
    }
}

pub(crate) fn text_record(message_id: &str, conversation: &str, second: u32) -> HistoryRecord {
    HistoryRecord {
        attachment: None,
        caption: Some("just text".into()),
        ..media_record(message_id, conversation, second)
    }
}
