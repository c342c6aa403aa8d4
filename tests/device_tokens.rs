//! Token-registration envelope handling over the wire.

mod common;

use common::{spawn_broker, TestClient};
use fastport::core::crypto::seal_envelope;
use fastport::core::protocol::{ClientFrame, ServerFrame};
use fastport::core::session::CreateSessionOpts;

#[tokio::test]
async fn sealed_token_is_verified_decrypted_and_stored() {
    let harness = spawn_broker().await;
    let created = harness
        .broker
        .registry
        .create_session("s", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut conn = TestClient::connect(harness.addr).await;
    conn.init_as("s", "pw", Some("u1")).await;

    let payload = br#"{"token":"fcm-abc","deviceId":"pixel-7","platform":"android"}"#;
    let (encrypted_data, hash) =
        seal_envelope(&created.secret_key, payload, &[3u8; 12]).unwrap();

    conn.send(&ClientFrame::RegisterFcmToken {
        user_id: "u1".into(),
        encrypted_data,
        hash,
    })
    .await;
    match conn.recv().await {
        ServerFrame::FcmTokenResponse {
            success: true,
            error: None,
        } => {}
        other => panic!("unexpected {other:?}"),
    }

    let tokens = harness.broker.storage.get_device_tokens("s").await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].user_id, "u1");
    assert_eq!(tokens[0].device_id, "pixel-7");
    assert_eq!(tokens[0].token, "fcm-abc");
    assert_eq!(tokens[0].platform, "android");
}

#[tokio::test]
async fn tampered_envelope_hash_is_rejected() {
    let harness = spawn_broker().await;
    let created = harness
        .broker
        .registry
        .create_session("s", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut conn = TestClient::connect(harness.addr).await;
    conn.init("s", "pw").await;

    let payload = br#"{"token":"t","deviceId":"d","platform":"ios"}"#;
    let (encrypted_data, _) = seal_envelope(&created.secret_key, payload, &[9u8; 12]).unwrap();

    conn.send(&ClientFrame::RegisterFcmToken {
        user_id: "u1".into(),
        encrypted_data,
        hash: "0000".into(),
    })
    .await;
    match conn.recv().await {
        ServerFrame::FcmTokenResponse { success: false, .. } => {}
        other => panic!("unexpected {other:?}"),
    }
    assert!(harness
        .broker
        .storage
        .get_device_tokens("s")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn envelope_sealed_with_wrong_key_is_rejected() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut conn = TestClient::connect(harness.addr).await;
    conn.init("s", "pw").await;

    // sealed with a key that is not the session's secret
    let other_key = "11".repeat(32);
    let payload = br#"{"token":"t","deviceId":"d","platform":"ios"}"#;
    let (encrypted_data, hash) = seal_envelope(&other_key, payload, &[9u8; 12]).unwrap();

    conn.send(&ClientFrame::RegisterFcmToken {
        user_id: "u1".into(),
        encrypted_data,
        hash,
    })
    .await;
    match conn.recv().await {
        ServerFrame::FcmTokenResponse { success: false, .. } => {}
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn reregistration_upserts_by_device() {
    let harness = spawn_broker().await;
    let created = harness
        .broker
        .registry
        .create_session("s", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut conn = TestClient::connect(harness.addr).await;
    conn.init("s", "pw").await;

    for token in ["first", "second"] {
        let payload =
            format!(r#"{{"token":"{token}","deviceId":"d1","platform":"android"}}"#);
        let (encrypted_data, hash) =
            seal_envelope(&created.secret_key, payload.as_bytes(), &[5u8; 12]).unwrap();
        conn.send(&ClientFrame::RegisterFcmToken {
            user_id: "u1".into(),
            encrypted_data,
            hash,
        })
        .await;
        match conn.recv().await {
            ServerFrame::FcmTokenResponse { success: true, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    let tokens = harness.broker.storage.get_device_tokens("s").await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].token, "second");
}
