mod common;

use common::{spawn_broker, TestClient};
use fastport::core::protocol::{ClientFrame, ServerFrame};
use fastport::core::session::CreateSessionOpts;

#[tokio::test]
async fn basic_pub_sub_with_ack() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s1", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    // counters are process-global and monotonic; assert on deltas
    let published_before = fastport::metrics::published();
    let delivered_before = fastport::metrics::delivered();
    let acked_before = fastport::metrics::acked();

    let mut c1 = TestClient::connect(harness.addr).await;
    let mut c2 = TestClient::connect(harness.addr).await;
    c1.init("s1", "pw").await;
    c2.init("s1", "pw").await;
    c2.subscribe("t").await;

    let response = c1.publish("t", "X", "m1").await;
    assert_eq!(
        response,
        ServerFrame::PublishResponse {
            success: true,
            message_id: Some("m1".into()),
            delivered_to: Some(1),
            error: None,
        }
    );

    match c2.recv().await {
        ServerFrame::Message {
            topic,
            data,
            hash,
            timestamp,
            message_id,
        } => {
            assert_eq!(topic, "t");
            assert_eq!(data, "X");
            assert_eq!(hash, "h");
            assert_eq!(timestamp, 1);
            assert_eq!(message_id, "m1");
        }
        other => panic!("expected message, got {other:?}"),
    }

    c2.ack("t", "m1").await;
    match c1.recv().await {
        ServerFrame::AckReceived { message_id } => assert_eq!(message_id, "m1"),
        other => panic!("expected ack_received, got {other:?}"),
    }

    // cache is empty once acked
    assert!(harness
        .broker
        .storage
        .get_message("m1")
        .await
        .unwrap()
        .is_none());
    c2.expect_silence(150).await;

    assert!(fastport::metrics::published() > published_before);
    assert!(fastport::metrics::delivered() > delivered_before);
    assert!(fastport::metrics::acked() > acked_before);
}

#[tokio::test]
async fn publish_is_never_delivered_across_sessions() {
    let harness = spawn_broker().await;
    for name in ["s1", "s2"] {
        harness
            .broker
            .registry
            .create_session(name, "pw", CreateSessionOpts::default())
            .await
            .unwrap();
    }

    let mut c_a = TestClient::connect(harness.addr).await;
    let mut c_b = TestClient::connect(harness.addr).await;
    c_a.init("s1", "pw").await;
    c_b.init("s2", "pw").await;
    c_a.subscribe("shared").await;
    c_b.subscribe("shared").await;

    let response = c_a.publish("shared", "secret", "m1").await;
    assert_eq!(
        response,
        ServerFrame::PublishResponse {
            success: true,
            message_id: Some("m1".into()),
            delivered_to: Some(0),
            error: None,
        }
    );
    c_b.expect_silence(200).await;
}

#[tokio::test]
async fn uninitialized_connection_only_gets_errors() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s1", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut conn = TestClient::connect(harness.addr).await;
    conn.send(&ClientFrame::Subscribe { topic: "t".into() }).await;
    assert_eq!(conn.recv().await, ServerFrame::error("Not initialized"));

    conn.send(&ClientFrame::Publish {
        topic: "t".into(),
        data: "X".into(),
        hash: "h".into(),
        timestamp: 1,
        message_id: "m1".into(),
    })
    .await;
    assert_eq!(conn.recv().await, ServerFrame::error("Not initialized"));

    // no side effects: a real subscriber sees nothing from the rejected frames
    assert!(harness
        .broker
        .storage
        .get_message("m1")
        .await
        .unwrap()
        .is_none());
    assert!(harness.broker.index.subscribers_of("s1", "t").is_empty());
}

#[tokio::test]
async fn wrong_password_keeps_connection_in_new_state() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s1", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut conn = TestClient::connect(harness.addr).await;
    conn.send(&ClientFrame::Init {
        session_name: "s1".into(),
        password: "nope".into(),
        user_id: None,
    })
    .await;
    match conn.recv().await {
        ServerFrame::InitResponse { success, error } => {
            assert!(!success);
            assert_eq!(error.as_deref(), Some("authentication failed"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // connection is still open and still gated
    conn.send(&ClientFrame::Subscribe { topic: "t".into() }).await;
    assert_eq!(conn.recv().await, ServerFrame::error("Not initialized"));

    // and a correct init still works on the same connection
    conn.init("s1", "pw").await;
}

#[tokio::test]
async fn unsubscribe_before_publish_excludes_subscriber() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s1", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut c1 = TestClient::connect(harness.addr).await;
    let mut c2 = TestClient::connect(harness.addr).await;
    c1.init("s1", "pw").await;
    c2.init("s1", "pw").await;
    c2.subscribe("t").await;

    c2.send(&ClientFrame::Unsubscribe { topic: "t".into() }).await;
    match c2.recv().await {
        ServerFrame::UnsubscribeResponse { success: true, .. } => {}
        other => panic!("unexpected {other:?}"),
    }

    let response = c1.publish("t", "X", "m1").await;
    assert_eq!(
        response,
        ServerFrame::PublishResponse {
            success: true,
            message_id: Some("m1".into()),
            delivered_to: Some(0),
            error: None,
        }
    );
    c2.expect_silence(200).await;
}

#[tokio::test]
async fn publish_without_audience_caches_nothing() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s1", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut c1 = TestClient::connect(harness.addr).await;
    c1.init("s1", "pw").await;

    let response = c1.publish("empty", "X", "m1").await;
    assert_eq!(
        response,
        ServerFrame::PublishResponse {
            success: true,
            message_id: Some("m1".into()),
            delivered_to: Some(0),
            error: None,
        }
    );
    assert!(harness
        .broker
        .storage
        .get_message("m1")
        .await
        .unwrap()
        .is_none());
    assert!(!harness.broker.retry.has_timer("m1"));
}

#[tokio::test]
async fn sender_is_excluded_from_its_own_fanout() {
    let harness = spawn_broker().await;
    harness
        .broker
        .registry
        .create_session("s1", "pw", CreateSessionOpts::default())
        .await
        .unwrap();

    let mut c1 = TestClient::connect(harness.addr).await;
    c1.init("s1", "pw").await;
    c1.subscribe("t").await;

    let response = c1.publish("t", "X", "m1").await;
    assert_eq!(
        response,
        ServerFrame::PublishResponse {
            success: true,
            message_id: Some("m1".into()),
            delivered_to: Some(0),
            error: None,
        }
    );
    c1.expect_silence(150).await;
}

#[tokio::test]
async fn unknown_frame_marker_gets_error_reply() {
    let harness = spawn_broker().await;
    let mut conn = TestClient::connect(harness.addr).await;

    // length-prefixed frame with an unassigned marker byte
    conn.send_raw(&[0, 0, 0, 1, 0x7f]).await;
    assert_eq!(conn.recv().await, ServerFrame::error("Unknown message type"));

    // malformed JSON is an inline error, not a disconnect
    let bad = [&[0u8, 0, 0, 4][..], &[0x01, b'{', b'x', b'!'][..]].concat();
    conn.send_raw(&bad).await;
    assert_eq!(conn.recv().await, ServerFrame::error("Malformed frame"));
}
