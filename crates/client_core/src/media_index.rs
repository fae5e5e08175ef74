use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, MediaKind, MessageId, SenderId},
    protocol::{AttachmentDescriptor, HistoryRecord},
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{SessionError, SessionResult},
    protocol_client::ProtocolClient,
};

const SNAPSHOT_VERSION: u8 = 1;
const FILENAME_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Metadata for one historical attachment. Never carries the payload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: SenderId,
    pub timestamp: DateTime<Utc>,
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub attachment: AttachmentDescriptor,
    pub derived_filename: String,
}

impl MediaItem {
    /// Returns `None` for records that carry no attachment.
    pub fn from_record(record: &HistoryRecord) -> Option<Self> {
        let attachment = record.attachment.as_ref()?;
        let kind = attachment.kind;
        Some(Self {
            message_id: record.message_id.clone(),
            conversation_id: record.conversation_id.clone(),
            sender_id: record.sender_id.clone(),
            timestamp: record.sent_at,
            kind,
            mime_type: attachment
                .mime_type
                .clone()
                .unwrap_or_else(|| kind.default_mime_type().to_owned()),
            caption: record.caption.clone(),
            attachment: attachment.clone(),
            derived_filename: derived_filename(record.sent_at, &record.message_id, kind),
        })
    }
}

/// Stable on-disk name for a historical attachment.
///
/// Depends only on the send time and message id, so a re-delivered record maps
/// to the same file across restarts and re-syncs. Bytes of the id outside
/// `[A-Za-z0-9_-]` are written as `%XX`, which keeps distinct ids on distinct
/// files.
pub fn derived_filename(
    timestamp: DateTime<Utc>,
    message_id: &MessageId,
    kind: MediaKind,
) -> String {
    let mut encoded_id = String::with_capacity(message_id.as_str().len());
    for byte in message_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded_id.push(char::from(byte));
        } else {
            encoded_id.push_str(&format!("%{byte:02X}"));
        }
    }
    format!(
        "historical_{}_{}.{}",
        timestamp.format(FILENAME_TIMESTAMP_FORMAT),
        encoded_id,
        kind.file_extension()
    )
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u8,
    items: BTreeMap<&'a MessageId, &'a MediaItem>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u8,
    items: BTreeMap<MessageId, MediaItem>,
}

pub struct MediaIndex {
    media_dir: PathBuf,
    client: Arc<dyn ProtocolClient>,
    items: RwLock<HashMap<MessageId, MediaItem>>,
}

impl MediaIndex {
    pub fn new(media_dir: impl Into<PathBuf>, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            media_dir: media_dir.into(),
            client,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    pub fn media_path(&self, item: &MediaItem) -> PathBuf {
        self.media_dir.join(&item.derived_filename)
    }

    /// Records metadata for every media record in `records`; returns how many were recorded.
    ///
    /// The write lock is taken per upsert so readers are never blocked for a whole batch.
    pub async fn ingest(&self, records: &[HistoryRecord]) -> usize {
        let mut recorded = 0;
        for record in records {
            let Some(item) = MediaItem::from_record(record) else {
                continue;
            };
            debug!(
                message_id = %item.message_id,
                filename = %item.derived_filename,
                "media: recorded historical attachment"
            );
            self.items
                .write()
                .await
                .insert(item.message_id.clone(), item);
            recorded += 1;
        }
        recorded
    }

    pub async fn lookup(&self, message_id: &MessageId) -> Option<MediaItem> {
        self.items.read().await.get(message_id).cloned()
    }

    /// Snapshot copy ordered by send time, then message id.
    pub async fn list(&self) -> Vec<MediaItem> {
        let mut items: Vec<MediaItem> = self.items.read().await.values().cloned().collect();
        items.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        items
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn fetch(
        &self,
        message_id: &MessageId,
        cancel: &CancellationToken,
    ) -> SessionResult<PathBuf> {
        let item = self
            .lookup(message_id)
            .await
            .ok_or_else(|| SessionError::MediaNotFound {
                message_id: message_id.clone(),
            })?;
        self.fetch_item(&item, cancel).await
    }

    /// Downloads the attachment unless its file already exists.
    ///
    /// The file is written under a temporary name and renamed into place, so the
    /// existence check never observes a partial write.
    pub async fn fetch_item(
        &self,
        item: &MediaItem,
        cancel: &CancellationToken,
    ) -> SessionResult<PathBuf> {
        let target = self.media_path(item);
        if is_readable_file(&target).await {
            debug!(
                message_id = %item.message_id,
                path = %target.display(),
                "media: cache hit"
            );
            return Ok(target);
        }

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SessionError::cancelled(format!(
                    "fetch of media item {}",
                    item.message_id
                )));
            }
            result = self.client.download(&item.attachment) => result.map_err(|err| {
                SessionError::transport(
                    format!("failed to download media item {}", item.message_id),
                    err,
                )
            })?,
        };

        write_atomically(&target, &bytes).await?;
        info!(
            message_id = %item.message_id,
            path = %target.display(),
            size_bytes = bytes.len(),
            "media: downloaded historical attachment on demand"
        );
        Ok(target)
    }

    pub async fn serialize(&self) -> SessionResult<Vec<u8>> {
        let items = self.items.read().await;
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            items: items.iter().collect(),
        };
        serde_json::to_vec_pretty(&snapshot).map_err(|err| SessionError::CorruptSnapshot {
            reason: format!("failed to encode snapshot: {err}"),
        })
    }

    /// Replaces the whole table with the snapshot's contents; returns the new size.
    ///
    /// On any validation failure the current table is left untouched.
    pub async fn deserialize(&self, bytes: &[u8]) -> SessionResult<usize> {
        let snapshot: Snapshot =
            serde_json::from_slice(bytes).map_err(|err| SessionError::CorruptSnapshot {
                reason: err.to_string(),
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SessionError::CorruptSnapshot {
                reason: format!("unsupported snapshot version {}", snapshot.version),
            });
        }

        let mut table = HashMap::with_capacity(snapshot.items.len());
        for (key, item) in snapshot.items {
            if key != item.message_id {
                return Err(SessionError::CorruptSnapshot {
                    reason: format!(
                        "entry '{key}' holds item for message '{}'",
                        item.message_id
                    ),
                });
            }
            table.insert(key, item);
        }

        let loaded = table.len();
        *self.items.write().await = table;
        Ok(loaded)
    }

    pub async fn save_snapshot(&self, path: &Path) -> SessionResult<()> {
        let bytes = self.serialize().await?;
        write_atomically(path, &bytes).await?;
        info!(path = %path.display(), "media: saved snapshot");
        Ok(())
    }

    pub async fn load_snapshot(&self, path: &Path) -> SessionResult<usize> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| SessionError::io("failed to read media snapshot", path, err))?;
        let loaded = self.deserialize(&bytes).await?;
        info!(path = %path.display(), items = loaded, "media: loaded snapshot");
        Ok(loaded)
    }
}

async fn is_readable_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => tokio::fs::File::open(path).await.is_ok(),
        _ => false,
    }
}

pub(crate) async fn write_atomically(target: &Path, bytes: &[u8]) -> SessionResult<()> {
    let parent = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|err| SessionError::io("failed to create directory", parent, err))?;

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{file_name}.{}.part", Uuid::new_v4()));
    tokio::fs::write(&staging, bytes)
        .await
        .map_err(|err| SessionError::io("failed to write staging file", &staging, err))?;
    if let Err(err) = tokio::fs::rename(&staging, target).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(SessionError::io("failed to move file into place", target, err));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/media_index_tests.rs"]
mod tests;
