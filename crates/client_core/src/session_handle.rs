use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::anyhow;
use chrono::NaiveDateTime;
use shared::{
    domain::{ConnectionState, MessageId},
    protocol::{HistoryAnchor, PairingEvent},
};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{SessionError, SessionResult},
    event_bridge::EventBridge,
    media_index::MediaIndex,
    protocol_client::ProtocolClient,
    SessionEvent,
};

/// Point-in-time view of one session; may be stale by the time it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub storage_path: PathBuf,
}

/// One managed client connection and the media index fed by its history syncs.
pub struct SessionHandle {
    name: String,
    storage_path: PathBuf,
    created_at: NaiveDateTime,
    client: Arc<dyn ProtocolClient>,
    media: Arc<MediaIndex>,
    state: RwLock<ConnectionState>,
    bridge_attached: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name)
            .field("storage_path", &self.storage_path)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(
        name: impl Into<String>,
        storage_path: PathBuf,
        created_at: NaiveDateTime,
        client: Arc<dyn ProtocolClient>,
        media_dir: PathBuf,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let media = Arc::new(MediaIndex::new(media_dir, Arc::clone(&client)));
        Arc::new(Self {
            name: name.into(),
            storage_path,
            created_at,
            client,
            media,
            state: RwLock::new(ConnectionState::Registered),
            bridge_attached: AtomicBool::new(false),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    pub fn media_index(&self) -> &Arc<MediaIndex> {
        &self.media
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state().await;
        SessionStatus {
            name: self.name.clone(),
            state,
            connected: state.is_connected(),
            storage_path: self.storage_path.clone(),
        }
    }

    /// Opens the connection, pairing first if no identity is persisted.
    ///
    /// A reconnect returns as soon as the transport is open; the Connected event
    /// updates the state later. A pairing blocks until it succeeds, the pairing
    /// stream closes, or `cancel` fires.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> SessionResult<()> {
        let previous = self.begin_connect().await?;
        self.attach_event_bridge();

        let result = self.open_connection(cancel).await;
        if let Err(err) = &result {
            warn!(session = %self.name, error = %err, "session: connect failed");
            self.restore_after_failed_connect(previous).await;
        }
        result
    }

    pub async fn disconnect(&self) -> SessionResult<()> {
        {
            let mut state = self.state.write().await;
            if !state.is_connected() {
                return Err(SessionError::NotConnected {
                    name: self.name.clone(),
                    state: *state,
                });
            }
            *state = ConnectionState::Disconnected;
        }
        self.close_client().await
    }

    /// Closes the client before the registry drops this handle.
    ///
    /// Unlike [`Self::disconnect`] this also closes a session still waiting for
    /// its Connected event, so an opened transport is never leaked. Other states
    /// have nothing to close.
    pub(crate) async fn close_for_removal(&self) -> SessionResult<()> {
        {
            let mut state = self.state.write().await;
            if !matches!(
                *state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(());
            }
            *state = ConnectionState::Disconnected;
        }
        self.close_client().await
    }

    pub async fn fetch_media(
        &self,
        message_id: &MessageId,
        cancel: &CancellationToken,
    ) -> SessionResult<PathBuf> {
        self.media.fetch(message_id, cancel).await
    }

    /// Asks the client for older history; results arrive as history-sync events.
    pub async fn request_history_sync(
        &self,
        anchor: Option<&HistoryAnchor>,
        count: u32,
        cancel: &CancellationToken,
    ) -> SessionResult<()> {
        let state = self.state().await;
        if !state.is_connected() {
            return Err(SessionError::NotConnected {
                name: self.name.clone(),
                state,
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::cancelled(format!(
                "history sync request for session {}",
                self.name
            ))),
            result = self.client.request_history_sync(anchor, count) => result.map_err(|err| {
                SessionError::transport(
                    format!("failed to request history sync for session {}", self.name),
                    err,
                )
            }),
        }
    }

    /// Applies a state reported by the protocol client.
    ///
    /// `LoggedOut` is kept until a Connected event arrives after re-pairing.
    pub(crate) async fn apply_reported_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.write().await;
            let keep_logged_out = *state == ConnectionState::LoggedOut
                && next == ConnectionState::Disconnected;
            if keep_logged_out || *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            self.emit_state(next);
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn begin_connect(&self) -> SessionResult<ConnectionState> {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            if matches!(
                previous,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Err(SessionError::AlreadyConnected {
                    name: self.name.clone(),
                    state: previous,
                });
            }
            *state = ConnectionState::Connecting;
            previous
        };
        self.emit_state(ConnectionState::Connecting);
        Ok(previous)
    }

    async fn close_client(&self) -> SessionResult<()> {
        self.emit_state(ConnectionState::Disconnected);
        self.client.close().await.map_err(|err| {
            SessionError::transport(format!("failed to disconnect session {}", self.name), err)
        })?;
        info!(session = %self.name, "session: disconnected");
        Ok(())
    }

    async fn restore_after_failed_connect(&self, previous: ConnectionState) {
        let restored = {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connecting {
                *state = previous;
                true
            } else {
                false
            }
        };
        if restored {
            self.emit_state(previous);
        }
    }

    fn attach_event_bridge(self: &Arc<Self>) {
        if self.bridge_attached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.client
            .add_event_handler(Arc::new(EventBridge::new(Arc::downgrade(self))));
    }

    async fn open_connection(&self, cancel: &CancellationToken) -> SessionResult<()> {
        let has_identity = self.client.has_identity().await.map_err(|err| {
            SessionError::transport(
                format!("failed to read identity for session {}", self.name),
                err,
            )
        })?;

        if !has_identity {
            return self.pair(cancel).await;
        }

        self.open_transport(cancel, "failed to connect existing session")
            .await?;
        info!(session = %self.name, "session: transport opened");
        Ok(())
    }

    async fn pair(&self, cancel: &CancellationToken) -> SessionResult<()> {
        let mut pairing = self.client.pairing_events().await.map_err(|err| {
            SessionError::transport(
                format!("failed to start pairing for session {}", self.name),
                err,
            )
        })?;
        self.open_transport(cancel, "failed to connect session for pairing")
            .await?;
        info!(session = %self.name, "session: waiting for pairing");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.close_quietly().await;
                    return Err(SessionError::cancelled(format!("pairing of session {}", self.name)));
                }
                event = pairing.recv() => event,
            };

            match event {
                Some(PairingEvent::Code(code)) => {
                    info!(session = %self.name, "session: pairing code issued");
                    self.emit(SessionEvent::PairingCode {
                        session: self.name.clone(),
                        code,
                    });
                }
                Some(PairingEvent::Success) => {
                    info!(session = %self.name, "session: pairing succeeded");
                    return Ok(());
                }
                Some(PairingEvent::Timeout) => {
                    self.close_quietly().await;
                    return Err(SessionError::transport(
                        format!("pairing of session {} failed", self.name),
                        anyhow!("pairing timed out"),
                    ));
                }
                Some(PairingEvent::Error(reason)) => {
                    self.close_quietly().await;
                    return Err(SessionError::transport(
                        format!("pairing of session {} failed", self.name),
                        anyhow!(reason),
                    ));
                }
                None => return Ok(()),
            }
        }
    }

    async fn open_transport(
        &self,
        cancel: &CancellationToken,
        failure_context: &str,
    ) -> SessionResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.close_quietly().await;
                Err(SessionError::cancelled(format!("connect of session {}", self.name)))
            }
            result = self.client.open() => result.map_err(|err| {
                SessionError::transport(format!("{failure_context} {}", self.name), err)
            }),
        }
    }

    async fn close_quietly(&self) {
        if let Err(err) = self.client.close().await {
            warn!(session = %self.name, error = %err, "session: close after aborted connect failed");
        }
    }

    fn emit_state(&self, state: ConnectionState) {
        self.emit(SessionEvent::StateChanged {
            session: self.name.clone(),
            state,
        });
    }
}

#[cfg(test)]
#[path = "tests/session_handle_tests.rs"]
mod tests;
