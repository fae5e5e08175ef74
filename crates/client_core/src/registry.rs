use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Duration, Local, NaiveDateTime, Timelike};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{aggregate, SessionError, SessionResult},
    protocol_client::ProtocolClientFactory,
    session_handle::{SessionHandle, SessionStatus},
    storage_path::{parse_storage_file_name, storage_path_for, validate_session_name},
    SessionEvent,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Directory holding every session's storage file.
    pub data_dir: PathBuf,
    /// Root for fetched media; each session gets its own subdirectory.
    pub media_dir: PathBuf,
}

impl RegistryConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            media_dir: data_dir.join("media"),
            data_dir,
        }
    }

    pub fn with_media_dir(mut self, media_dir: impl Into<PathBuf>) -> Self {
        self.media_dir = media_dir.into();
        self
    }
}

/// Directory of named sessions.
///
/// The membership map has its own lock, held only for lookups and mutations;
/// each session guards its own state. No lock here is held across network I/O.
pub struct SessionRegistry {
    config: RegistryConfig,
    factory: Arc<dyn ProtocolClientFactory>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    storage_paths: Mutex<StoragePaths>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Debug, Default)]
struct StoragePaths {
    /// Every path handed out by this registry; never reused.
    issued: HashSet<PathBuf>,
    /// Paths of registered sessions and of adds still in flight.
    claimed: HashSet<PathBuf>,
}

impl SessionRegistry {
    pub async fn new(
        config: RegistryConfig,
        factory: Arc<dyn ProtocolClientFactory>,
    ) -> SessionResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|err| {
                SessionError::io("failed to create data directory", &config.data_dir, err)
            })?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
            storage_paths: Mutex::new(StoragePaths::default()),
            events,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn add_session(&self, name: &str) -> SessionResult<Arc<SessionHandle>> {
        validate_session_name(name)?;
        if self.sessions.read().await.contains_key(name) {
            return Err(SessionError::AlreadyExists {
                name: name.to_owned(),
            });
        }

        let (storage_path, created_at) = self.allocate_storage_path(name).await;
        let client = match self.factory.create(&storage_path).await {
            Ok(client) => client,
            Err(err) => {
                self.release_storage_path(&storage_path).await;
                return Err(SessionError::transport(
                    format!("failed to create protocol client for session {name}"),
                    err,
                ));
            }
        };
        let handle = SessionHandle::new(
            name,
            storage_path,
            created_at,
            client,
            self.config.media_dir.join(name),
            self.events.clone(),
        );

        let inserted = match self.sessions.write().await.entry(name.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                true
            }
        };
        if !inserted {
            self.release_storage_path(handle.storage_path()).await;
            return Err(SessionError::AlreadyExists {
                name: name.to_owned(),
            });
        }

        info!(
            session = %name,
            storage_path = %handle.storage_path().display(),
            "session: added"
        );
        Ok(handle)
    }

    pub async fn get_session(&self, name: &str) -> SessionResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound {
                name: name.to_owned(),
            })
    }

    /// Closes the session's client (best effort) and drops it from the registry.
    ///
    /// A session still waiting for its connected event is closed too. The
    /// storage file stays on disk until [`Self::cleanup_storage`].
    pub async fn remove_session(&self, name: &str) -> SessionResult<()> {
        let handle = self.get_session(name).await?;
        if let Err(err) = handle.close_for_removal().await {
            warn!(
                session = %name,
                error = %err,
                "session: disconnect before removal failed; removing anyway"
            );
        }

        {
            let mut sessions = self.sessions.write().await;
            let still_registered = sessions
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &handle));
            if !still_registered {
                return Err(SessionError::SessionNotFound {
                    name: name.to_owned(),
                });
            }
            sessions.remove(name);
        }
        self.release_storage_path(handle.storage_path()).await;

        info!(session = %name, "session: removed");
        Ok(())
    }

    pub async fn connect_session(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<()> {
        self.get_session(name).await?.connect(cancel).await
    }

    pub async fn disconnect_session(&self, name: &str) -> SessionResult<()> {
        self.get_session(name).await?.disconnect().await
    }

    /// Connects every registered session concurrently.
    ///
    /// Sessions that connect stay connected even when siblings fail; the error
    /// lists every failed session.
    pub async fn connect_all(&self, cancel: &CancellationToken) -> SessionResult<()> {
        let tasks = self
            .snapshot_handles()
            .await
            .into_iter()
            .map(|handle| {
                let cancel = cancel.child_token();
                let name = handle.name().to_owned();
                let task = tokio::spawn(async move { handle.connect(&cancel).await });
                (name, task)
            })
            .collect();
        aggregate("connect", join_fan_out(tasks).await)
    }

    pub async fn disconnect_all(&self, cancel: &CancellationToken) -> SessionResult<()> {
        let tasks = self
            .snapshot_handles()
            .await
            .into_iter()
            .map(|handle| {
                let cancel = cancel.child_token();
                let name = handle.name().to_owned();
                let task = tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(SessionError::cancelled(format!(
                            "disconnect of session {}",
                            handle.name()
                        ))),
                        result = handle.disconnect() => result,
                    }
                });
                (name, task)
            })
            .collect();
        aggregate("disconnect", join_fan_out(tasks).await)
    }

    /// Registered names in lexical order.
    pub async fn list_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn status(&self, name: &str) -> SessionResult<SessionStatus> {
        Ok(self.get_session(name).await?.status().await)
    }

    /// Deletes storage files that follow the session naming convention and are
    /// not attached to a registered session. Returns how many were removed.
    ///
    /// Files claimed by an add that is still creating its client are kept.
    pub async fn cleanup_storage(&self) -> SessionResult<usize> {
        let data_dir = &self.config.data_dir;
        let mut entries = tokio::fs::read_dir(data_dir)
            .await
            .map_err(|err| SessionError::io("failed to list data directory", data_dir, err))?;

        let mut removed = 0;
        let mut failures = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(SessionError::io(
                        "failed to list data directory",
                        data_dir,
                        err,
                    ))
                }
            };
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if parse_storage_file_name(file_name).is_none() {
                continue;
            }
            if !matches!(entry.file_type().await, Ok(file_type) if file_type.is_file()) {
                continue;
            }
            let path = entry.path();

            // Held through the removal so no add can claim the path meanwhile.
            let paths = self.storage_paths.lock().await;
            if paths.claimed.contains(&path) {
                debug!(path = %path.display(), "session: storage in use; kept");
                continue;
            }
            let outcome = tokio::fs::remove_file(&path).await;
            drop(paths);

            match outcome {
                Ok(()) => {
                    info!(path = %path.display(), "session: removed storage file");
                    removed += 1;
                }
                Err(err) => failures.push((
                    file_name.to_owned(),
                    SessionError::io("failed to remove storage file", &path, err),
                )),
            }
        }

        aggregate("storage cleanup", failures)?;
        Ok(removed)
    }

    async fn snapshot_handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Picks and claims a storage path that neither exists nor was ever issued
    /// by this registry.
    ///
    /// Collisions within the same second move the timestamp forward. The claim
    /// keeps [`Self::cleanup_storage`] away from the file until it is released.
    async fn allocate_storage_path(&self, name: &str) -> (PathBuf, NaiveDateTime) {
        let now = Local::now().naive_local();
        let mut created_at = now.with_nanosecond(0).unwrap_or(now);
        loop {
            let path = storage_path_for(&self.config.data_dir, name, created_at);
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if !exists {
                let mut paths = self.storage_paths.lock().await;
                if paths.issued.insert(path.clone()) {
                    paths.claimed.insert(path.clone());
                    return (path, created_at);
                }
            }
            created_at += Duration::seconds(1);
        }
    }

    async fn release_storage_path(&self, path: &Path) {
        self.storage_paths.lock().await.claimed.remove(path);
    }
}

async fn join_fan_out(
    tasks: Vec<(String, JoinHandle<SessionResult<()>>)>,
) -> Vec<(String, SessionError)> {
    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    let results = futures::future::join_all(handles).await;
    names
        .into_iter()
        .zip(results)
        .filter_map(|(name, result)| match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some((name, err)),
            Err(join_err) => Some((
                name,
                SessionError::transport("session task failed", anyhow::Error::new(join_err)),
            )),
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
