//! End-to-end session scenarios over a local router.

mod common;

use std::time::{Duration, Instant};

use common::{name, shared_secret, TestRouter, WAIT};
use slim_session::{SessionConfig, SessionState, SessionType, SlimError};

const SVC: [&str; 3] = ["org", "ns", "svc"];

#[tokio::test]
async fn test_p2p_echo() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();

    let session = a
        .create_session(SessionConfig::point_to_point(), b.name().clone())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Established);
    assert!(session.is_initiator());
    assert_eq!(session.session_type(), SessionType::PointToPoint);

    let accepted = b.listen_for_session(Some(WAIT)).await.unwrap();
    assert!(!accepted.is_initiator());
    assert_eq!(accepted.destination(), *a.name());

    session
        .publish(vec![0x01, 0x02, 0x03], Some("ping".to_string()), None)
        .await
        .unwrap();
    let msg = accepted.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(msg.payload, vec![0x01, 0x02, 0x03]);
    assert_eq!(msg.context.source_name, *a.name());
    assert_eq!(msg.context.payload_type, "ping");
    assert_eq!(msg.context.identity, a.name().to_string());

    accepted
        .publish_to(&msg.context, vec![0x04], None, None)
        .await
        .unwrap();
    let reply = session.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(reply.payload, vec![0x04]);
    assert_eq!(reply.context.source_name, *b.name());
    assert_eq!(reply.context.payload_type, "msg");
}

#[tokio::test]
async fn test_confirmed_publish_and_metadata() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();

    let mut config = SessionConfig::point_to_point();
    config.metadata.insert("topic".to_string(), "weather".to_string());
    let session = a.create_session(config, b.name().clone()).await.unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).await.unwrap();
    assert_eq!(accepted.metadata().get("topic").map(String::as_str), Some("weather"));

    let meta = [("k".to_string(), "v".to_string())].into_iter().collect();
    let handle = session
        .publish_with_completion(b"hello".to_vec(), None, Some(meta))
        .await
        .unwrap();
    assert_eq!(handle.wait_for(WAIT).await, Ok(()));
    let msg = accepted.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(msg.payload, b"hello");
    assert_eq!(msg.context.metadata.get("k").map(String::as_str), Some("v"));
}

#[tokio::test]
async fn test_retry_exhaustion() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, b_conn) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();

    let session = a
        .create_session(
            SessionConfig::point_to_point().with_retries(2, 100),
            b.name().clone(),
        )
        .await
        .unwrap();
    let _accepted = b.listen_for_session(Some(WAIT)).await.unwrap();

    b.disconnect(b_conn).unwrap();
    router.wait_subscribed(b.name(), false).await;

    let start = Instant::now();
    let handle = session
        .publish_with_completion(vec![1], None, None)
        .await
        .unwrap();
    assert_eq!(
        handle.wait().await,
        Err(SlimError::SendError("delivery not confirmed".to_string()))
    );
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(matches!(
        handle.wait().await,
        Err(SlimError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let absent = name(SVC, 99);
    a.set_route(&absent, a_conn).unwrap();

    let start = Instant::now();
    let err = a
        .create_session(SessionConfig::point_to_point().with_retries(1, 50), absent)
        .await
        .unwrap_err();
    assert!(matches!(err, SlimError::SessionError(_)));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(a.session_ids().is_empty());
}

#[tokio::test]
async fn test_listen_timeout() {
    let router = TestRouter::start().await;
    let (a, _) = router.app(SVC, 1).await;
    let start = Instant::now();
    assert_eq!(
        a.listen_for_session(Some(Duration::from_millis(50)))
            .await
            .unwrap_err(),
        SlimError::Timeout
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_delete_closes_peer() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();

    let session = a
        .create_session(SessionConfig::point_to_point(), b.name().clone())
        .await
        .unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).await.unwrap();

    a.delete_session(&session).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        accepted.get_message(Some(WAIT)).await.unwrap_err(),
        SlimError::SessionError("session closed".to_string())
    );
    assert_eq!(accepted.state(), SessionState::Closed);
    assert!(matches!(
        session.publish(vec![1], None, None).await,
        Err(SlimError::SessionError(_))
    ));
    assert!(matches!(
        a.delete_session(&session).await,
        Err(SlimError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_encrypted_p2p() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();

    let session = a
        .create_session(SessionConfig::point_to_point().with_mls(true), b.name().clone())
        .await
        .unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).await.unwrap();
    assert!(accepted.config().mls_enabled);

    session.publish(b"sealed".to_vec(), None, None).await.unwrap();
    let msg = accepted.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(msg.payload, b"sealed");

    accepted
        .publish_to(&msg.context, b"ack".to_vec(), None, None)
        .await
        .unwrap();
    assert_eq!(session.get_message(Some(WAIT)).await.unwrap().payload, b"ack");
}

#[tokio::test]
async fn test_mls_mismatch_rejected() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();
    b.set_mls_policy(Some(true));

    let err = a
        .create_session(SessionConfig::point_to_point(), b.name().clone())
        .await
        .unwrap_err();
    assert_eq!(err, SlimError::SessionError("mls mismatch".to_string()));
    assert_eq!(
        b.listen_for_session(Some(Duration::from_millis(50)))
            .await
            .unwrap_err(),
        SlimError::Timeout
    );
}

#[tokio::test]
async fn test_wrong_secret_never_establishes() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router
        .app_with_auth(SVC, 2, &shared_secret("another-secret-0123456789abcdef!!"))
        .await;
    a.set_route(b.name(), a_conn).unwrap();

    let err = a
        .create_session(
            SessionConfig::point_to_point().with_retries(1, 50),
            b.name().clone(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SlimError::SessionError(_)));
}

#[tokio::test]
async fn test_dropped_create_session_leaves_no_entry() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let absent = name(SVC, 99);
    a.set_route(&absent, a_conn).unwrap();

    let pending = a.create_session(SessionConfig::point_to_point().with_retries(5, 200), absent);
    assert!(tokio::time::timeout(Duration::from_millis(50), pending)
        .await
        .is_err());
    assert!(a.session_ids().is_empty());
}

#[tokio::test]
async fn test_lost_ack_redelivers_and_resolves_once() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, _) = router.app(SVC, 2).await;
    a.set_route(b.name(), a_conn).unwrap();

    let session = a
        .create_session(
            SessionConfig::point_to_point().with_retries(5, 500),
            b.name().clone(),
        )
        .await
        .unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).await.unwrap();

    // Hide A from the router so B's acknowledgement is dropped there.
    let fabric = router.processor.fabric();
    let a_at_router = fabric
        .subscriptions()
        .into_iter()
        .find(|(n, c)| n == a.name() && c.is_some())
        .and_then(|(_, c)| c)
        .unwrap();
    fabric.unsubscribe(a.name(), Some(a_at_router)).unwrap();
    let dropped_before = router.processor.metrics().messages_dropped;

    let handle = session
        .publish_with_completion(b"once".to_vec(), None, None)
        .await
        .unwrap();
    let first = accepted.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(first.payload, b"once");
    common::wait_until(|| router.processor.metrics().messages_dropped > dropped_before).await;

    assert!(fabric.subscribe(a.name(), Some(a_at_router)));
    let second = accepted.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(second.payload, b"once");
    assert_eq!(handle.wait_for(WAIT).await, Ok(()));
    assert!(matches!(
        handle.wait().await,
        Err(SlimError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_reply_after_input_connection_closed() {
    let router = TestRouter::start().await;
    let (a, a_conn) = router.app(SVC, 1).await;
    let (b, b_first) = router.app(SVC, 2).await;
    let b_second = b
        .connect(&slim_session::ClientConfig::insecure(router.endpoint.clone()))
        .await
        .unwrap();
    a.set_route(b.name(), a_conn).unwrap();

    let session = a
        .create_session(SessionConfig::point_to_point(), b.name().clone())
        .await
        .unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).await.unwrap();
    session.publish(vec![1], None, None).await.unwrap();
    let msg = accepted.get_message(Some(WAIT)).await.unwrap();
    let input = msg.context.input_connection;
    assert!(input == b_first || input == b_second);
    let other = if input == b_first { b_second } else { b_first };

    b.disconnect(input).unwrap();
    assert_eq!(
        accepted
            .publish_to(&msg.context, vec![2], None, None)
            .await
            .unwrap_err(),
        SlimError::SendError("no route".to_string())
    );

    b.set_route(a.name(), other).unwrap();
    accepted
        .publish_to(&msg.context, vec![3], None, None)
        .await
        .unwrap();
    let reply = session.get_message(Some(WAIT)).await.unwrap();
    assert_eq!(reply.payload, vec![3]);
}
