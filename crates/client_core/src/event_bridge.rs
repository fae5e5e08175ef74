use std::sync::Weak;

use async_trait::async_trait;
use shared::{domain::ConnectionState, protocol::ProtocolEvent};
use tracing::{debug, info, warn};

use crate::{
    protocol_client::ProtocolEventHandler, session_handle::SessionHandle, SessionEvent,
};

/// Turns protocol events for one session into state changes and media index entries.
///
/// Holds the session weakly so a removed session is dropped even while its
/// client still has the bridge registered.
pub struct EventBridge {
    handle: Weak<SessionHandle>,
}

impl EventBridge {
    pub fn new(handle: Weak<SessionHandle>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ProtocolEventHandler for EventBridge {
    async fn handle_event(&self, event: ProtocolEvent) {
        let Some(handle) = self.handle.upgrade() else {
            debug!("session: event for a removed session ignored");
            return;
        };

        match event {
            ProtocolEvent::Connected => {
                handle
                    .apply_reported_state(ConnectionState::Connected)
                    .await;
                info!(session = %handle.name(), "session: connected");
            }
            ProtocolEvent::Disconnected => {
                handle
                    .apply_reported_state(ConnectionState::Disconnected)
                    .await;
                info!(session = %handle.name(), "session: connection closed by client");
            }
            ProtocolEvent::LoggedOut => {
                handle
                    .apply_reported_state(ConnectionState::LoggedOut)
                    .await;
                warn!(session = %handle.name(), "session: logged out; pairing required to reconnect");
            }
            ProtocolEvent::HistorySync(batch) => {
                let records = batch.records.len();
                let media_items = handle.media_index().ingest(&batch.records).await;
                info!(
                    session = %handle.name(),
                    records,
                    media_items,
                    "media: history sync processed; attachments will be fetched on demand"
                );
                handle.emit(SessionEvent::HistorySynced {
                    session: handle.name().to_owned(),
                    records,
                    media_items,
                });
            }
        }
    }
}
