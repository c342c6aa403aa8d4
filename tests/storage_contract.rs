//! Port contract exercised against both backends.

use std::sync::Arc;

use fastport::storage::{
    memory::MemoryStorage, sqlite::SqliteStorage, CachedMessage, DeviceToken, SessionPatch,
    SessionRecord, Storage, StorageError,
};

fn session(name: &str) -> SessionRecord {
    SessionRecord {
        session_name: name.into(),
        password: "pw".into(),
        secret_key: "ab".repeat(32),
        retry_interval: 5_000,
        max_retry_limit: 100,
        message_expiry_time: None,
        session_expiry: None,
        suspended: false,
        notifier: None,
    }
}

fn message(id: &str, session: &str, expiry: Option<u64>) -> CachedMessage {
    CachedMessage {
        message_id: id.into(),
        session_name: session.into(),
        topic: "t".into(),
        data: "payload".into(),
        hash: "h".into(),
        timestamp: 7,
        frame_type: "message".into(),
        published_at: 1_000,
        retry_count: 0,
        expiry_time: expiry,
        max_retry_limit: 3,
        retry_interval: 500,
    }
}

fn token(session: &str, user: &str, device: &str) -> DeviceToken {
    DeviceToken {
        session_name: session.into(),
        user_id: user.into(),
        device_id: device.into(),
        token: "tok-1".into(),
        platform: "android".into(),
        created_at: 1,
        updated_at: 1,
    }
}

async fn exercise_contract(storage: Arc<dyn Storage>) {
    storage.init().await.unwrap();
    // init is idempotent
    storage.init().await.unwrap();

    // sessions: create, duplicate, read back
    storage.create_session(&session("a")).await.unwrap();
    let err = storage.create_session(&session("a")).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(_)));
    let loaded = storage.get_session("a").await.unwrap().unwrap();
    assert_eq!(loaded, session("a"));
    assert!(storage.get_session("ghost").await.unwrap().is_none());

    // update: last write wins, missing name errors
    storage
        .update_session(
            "a",
            SessionPatch {
                suspended: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(storage.get_session("a").await.unwrap().unwrap().suspended);
    let err = storage
        .update_session("ghost", SessionPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));

    // messages: upsert semantics
    storage.save_message(&message("m1", "a", None)).await.unwrap();
    let mut updated = message("m1", "a", None);
    updated.retry_count = 2;
    storage.save_message(&updated).await.unwrap();
    let loaded = storage.get_message("m1").await.unwrap().unwrap();
    assert_eq!(loaded.retry_count, 2);

    storage.save_message(&message("m2", "a", None)).await.unwrap();
    let mut pending = storage.list_pending_messages("a").await.unwrap();
    pending.sort_by(|x, y| x.message_id.cmp(&y.message_id));
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].message_id, "m1");

    // remove is idempotent
    storage.remove_message("m1").await.unwrap();
    storage.remove_message("m1").await.unwrap();
    assert!(storage.get_message("m1").await.unwrap().is_none());

    // device tokens: upsert by key, listing, delete
    storage.save_device_token(&token("a", "u1", "d1")).await.unwrap();
    let mut replaced = token("a", "u1", "d1");
    replaced.token = "tok-2".into();
    replaced.updated_at = 2;
    storage.save_device_token(&replaced).await.unwrap();
    storage.save_device_token(&token("a", "u2", "d1")).await.unwrap();
    let tokens = storage.get_device_tokens("a").await.unwrap();
    assert_eq!(tokens.len(), 2);
    assert!(tokens
        .iter()
        .any(|t| t.user_id == "u1" && t.token == "tok-2"));
    storage.delete_device_token("a", "u2", "d1").await.unwrap();
    assert_eq!(storage.get_device_tokens("a").await.unwrap().len(), 1);

    // deleting a session cascades its messages and tokens
    storage.delete_session("a").await.unwrap();
    assert!(storage.get_session("a").await.unwrap().is_none());
    assert!(storage.get_message("m2").await.unwrap().is_none());
    assert!(storage.get_device_tokens("a").await.unwrap().is_empty());
    // and is idempotent
    storage.delete_session("a").await.unwrap();
}

async fn exercise_cleanup(storage: Arc<dyn Storage>) {
    storage.init().await.unwrap();

    let mut expiring = session("old");
    expiring.session_expiry = Some(500);
    storage.create_session(&expiring).await.unwrap();
    storage.create_session(&session("fresh")).await.unwrap();

    storage
        .save_message(&message("dead", "fresh", Some(400)))
        .await
        .unwrap();
    storage
        .save_message(&message("alive", "fresh", Some(40_000)))
        .await
        .unwrap();
    storage
        .save_message(&message("orphaned", "old", None))
        .await
        .unwrap();

    let counts = storage.cleanup_expired(1_000).await.unwrap();
    assert_eq!(counts.sessions, 1);
    assert_eq!(counts.messages, 1);

    assert!(storage.get_session("old").await.unwrap().is_none());
    assert!(storage.get_message("dead").await.unwrap().is_none());
    // the expired session took its messages with it
    assert!(storage.get_message("orphaned").await.unwrap().is_none());
    assert!(storage.get_message("alive").await.unwrap().is_some());
}

#[tokio::test]
async fn memory_backend_honors_the_contract() {
    exercise_contract(Arc::new(MemoryStorage::new())).await;
}

#[tokio::test]
async fn memory_backend_cleanup() {
    exercise_cleanup(Arc::new(MemoryStorage::new())).await;
}

#[tokio::test]
async fn sqlite_backend_honors_the_contract() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contract.db");
    let storage = SqliteStorage::connect(path.to_str().unwrap()).await.unwrap();
    exercise_contract(Arc::new(storage)).await;
}

#[tokio::test]
async fn sqlite_backend_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cleanup.db");
    let storage = SqliteStorage::connect(path.to_str().unwrap()).await.unwrap();
    exercise_cleanup(Arc::new(storage)).await;
}

#[tokio::test]
async fn sqlite_backend_is_durable_across_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("durable.db");
    let path = path.to_str().unwrap();

    {
        let storage = SqliteStorage::connect(path).await.unwrap();
        storage.init().await.unwrap();
        storage.create_session(&session("kept")).await.unwrap();
        storage
            .save_message(&message("m-kept", "kept", None))
            .await
            .unwrap();
    }

    let storage = SqliteStorage::connect(path).await.unwrap();
    storage.init().await.unwrap();
    assert!(storage.get_session("kept").await.unwrap().is_some());
    assert_eq!(storage.list_pending_messages("kept").await.unwrap().len(), 1);
}
