use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MediaKind, MessageId, SenderId};

/// Opaque reference the protocol client needs to fetch an attachment later.
///
/// The core never interprets `reference_b64`; it is carried verbatim from the
/// sync record into the media index and back to the client on download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub reference_b64: String,
}

impl AttachmentDescriptor {
    pub fn new(kind: MediaKind, reference: &[u8]) -> Self {
        Self {
            kind,
            mime_type: None,
            size_bytes: None,
            reference_b64: STANDARD.encode(reference),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn reference_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.reference_b64)
    }
}

/// One message replayed by a historical sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: SenderId,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentDescriptor>,
}

impl HistoryRecord {
    pub fn is_media(&self) -> bool {
        self.attachment.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySyncBatch {
    pub records: Vec<HistoryRecord>,
}

impl HistorySyncBatch {
    pub fn new(records: Vec<HistoryRecord>) -> Self {
        Self { records }
    }
}

/// Last message the caller already knows about, used to page further back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryAnchor {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Connected,
    Disconnected,
    LoggedOut,
    HistorySync(HistorySyncBatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PairingEvent {
    Code(String),
    Success,
    Timeout,
    Error(String),
}
