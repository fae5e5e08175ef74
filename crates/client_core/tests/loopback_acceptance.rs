use std::sync::Arc;

use chrono::{TimeZone, Utc};
use client_core::{
    CancellationToken, LoopbackClient, LoopbackClientFactory, ProtocolClient, RegistryConfig,
    SessionError, SessionEvent, SessionHandle, SessionRegistry,
};
use shared::{
    domain::{ConnectionState, MediaKind},
    protocol::{AttachmentDescriptor, HistoryAnchor, HistoryRecord},
};
use storage::DeviceStore;
use tokio::sync::broadcast;

fn record(id: &str, second: u32, attachment: Option<(MediaKind, &[u8])>) -> HistoryRecord {
    HistoryRecord {
        message_id: id.into(),
        conversation_id: "family".into(),
        sender_id: "grandma".into(),
        sent_at: Utc
            .with_ymd_and_hms(2024, 2, 29, 18, 0, second)
            .single()
            .expect("timestamp"),
        caption: None,
        attachment: attachment.map(|(kind, bytes)| AttachmentDescriptor::new(kind, bytes)),
    }
}

fn seeded_history() -> Vec<HistoryRecord> {
    vec![
        record("photo-1", 1, Some((MediaKind::Image, b"jpeg bytes".as_slice()))),
        record("hello", 2, None),
        record("voice-1", 3, Some((MediaKind::Audio, b"ogg bytes".as_slice()))),
    ]
}

fn drain_pairing_codes(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<String> {
    let mut codes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::PairingCode { code, .. } = event {
            codes.push(code);
        }
    }
    codes
}

#[tokio::test]
async fn pair_sync_fetch_and_snapshot_acceptance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = SessionRegistry::new(
        RegistryConfig::new(dir.path().join("data")),
        Arc::new(LoopbackClientFactory::with_history(seeded_history())),
    )
    .await
    .expect("registry");
    let mut events = registry.subscribe_events();
    let cancel = CancellationToken::new();

    let alice = registry.add_session("alice").await.expect("add alice");
    registry
        .connect_session("alice", &cancel)
        .await
        .expect("first connect pairs");

    let codes = drain_pairing_codes(&mut events);
    assert_eq!(codes.len(), 1);
    assert!(codes[0].starts_with("loopback-"));
    assert_eq!(alice.state().await, ConnectionState::Connected);

    let media = alice.media_index();
    assert_eq!(media.len().await, 2);
    let photo = alice
        .fetch_media(&"photo-1".into(), &cancel)
        .await
        .expect("fetch photo");
    assert_eq!(
        photo,
        dir.path()
            .join("data")
            .join("media")
            .join("alice")
            .join("historical_20240229_180001_photo-1.jpg")
    );
    assert_eq!(
        tokio::fs::read(&photo).await.expect("read photo"),
        b"jpeg bytes".to_vec()
    );

    registry
        .disconnect_session("alice")
        .await
        .expect("disconnect");
    registry
        .connect_session("alice", &cancel)
        .await
        .expect("reconnect with stored identity");
    assert!(drain_pairing_codes(&mut events).is_empty());
    assert_eq!(media.len().await, 2);

    let snapshot = dir.path().join("alice-media.json");
    media.save_snapshot(&snapshot).await.expect("save snapshot");

    let bob = registry.add_session("bob").await.expect("add bob");
    let loaded = bob
        .media_index()
        .load_snapshot(&snapshot)
        .await
        .expect("load snapshot");
    assert_eq!(loaded, 2);
    assert_eq!(bob.media_index().list().await, media.list().await);

    registry.disconnect_all(&cancel).await.expect_err("bob never connected");
    assert!(!alice.is_connected().await);
}

#[tokio::test]
async fn removed_sessions_leave_storage_for_cleanup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = SessionRegistry::new(
        RegistryConfig::new(dir.path()),
        Arc::new(LoopbackClientFactory::new()),
    )
    .await
    .expect("registry");
    let cancel = CancellationToken::new();

    let storage_path = registry
        .add_session("alice")
        .await
        .expect("add alice")
        .storage_path()
        .to_path_buf();
    registry
        .connect_session("alice", &cancel)
        .await
        .expect("connect");
    registry.remove_session("alice").await.expect("remove");
    assert!(storage_path.exists());

    let removed = registry.cleanup_storage().await.expect("cleanup");
    assert_eq!(removed, 1);
    assert!(!storage_path.exists());
}

#[tokio::test]
async fn logout_requires_pairing_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = DeviceStore::open_path(&dir.path().join("session_alice_20240229_180000"))
        .await
        .expect("device store");
    let client = Arc::new(LoopbackClient::with_history(store, seeded_history()));
    let (sender, mut events) = broadcast::channel(64);
    let handle = SessionHandle::new(
        "alice",
        dir.path().join("session_alice_20240229_180000"),
        Utc::now().naive_local(),
        Arc::clone(&client) as Arc<dyn ProtocolClient>,
        dir.path().join("media"),
        sender,
    );
    let cancel = CancellationToken::new();

    handle.connect(&cancel).await.expect("pair");
    assert_eq!(drain_pairing_codes(&mut events).len(), 1);

    client.log_out().await.expect("log out");
    assert_eq!(handle.state().await, ConnectionState::LoggedOut);
    assert!(!client.store().has_identity().await.expect("identity"));

    let err = handle
        .request_history_sync(None, 10, &cancel)
        .await
        .expect_err("logged out");
    assert!(matches!(err, SessionError::NotConnected { .. }));

    handle.connect(&cancel).await.expect("pair again");
    assert_eq!(drain_pairing_codes(&mut events).len(), 1);
    assert_eq!(handle.state().await, ConnectionState::Connected);

    let anchor = HistoryAnchor {
        conversation_id: "family".into(),
        message_id: "voice-1".into(),
        sent_at: Utc
            .with_ymd_and_hms(2024, 2, 29, 18, 0, 3)
            .single()
            .expect("timestamp"),
    };
    handle
        .request_history_sync(Some(&anchor), 10, &cancel)
        .await
        .expect("older history");
    assert_eq!(handle.media_index().len().await, 2);
}
