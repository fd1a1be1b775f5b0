//! Blocking and future-driven adapter scenarios over a local router.

mod common;

use std::time::{Duration, Instant};

use common::{name, wait_until, Router, WAIT};
use slim_bindings::codec;
use slim_bindings::ffi::{
    slim_bindings_adapter_create_session_async, slim_bindings_adapter_delete_session,
    slim_bindings_session_get_message_async,
};
use slim_bindings::future::{
    slim_bindings_future_complete_buffer, slim_bindings_future_free_buffer,
    slim_bindings_future_free_pointer, slim_bindings_future_poll_buffer, POLL_MAYBE_READY,
    POLL_READY,
};
use slim_bindings::{BindingsAdapter, BindingsSessionContext, CallStatus, ForeignBytes};
use slim_session::{ReceivedMessage, SessionConfig, SessionType, SlimError};

#[test]
fn test_p2p_echo_blocking() {
    let router = Router::start();
    let (a, a_conn) = router.adapter(1);
    let (b, _) = router.adapter(2);
    a.set_route(&b.name(), a_conn).unwrap();

    let session = a
        .create_session(SessionConfig::point_to_point(), b.name())
        .unwrap();
    assert_eq!(session.session_type(), SessionType::PointToPoint);
    assert!(session.is_initiator());
    let accepted = b.listen_for_session(Some(WAIT)).unwrap();

    session
        .publish(vec![0x01, 0x02, 0x03], Some("ping".to_string()), None)
        .unwrap();
    let msg = accepted.get_message(Some(WAIT)).unwrap();
    assert_eq!(msg.payload, vec![0x01, 0x02, 0x03]);
    assert_eq!(msg.context.source_name, a.name());
    assert_eq!(msg.context.payload_type, "ping");

    accepted
        .publish_to(msg.context.clone(), vec![0x04], None, None)
        .unwrap();
    let reply = session.get_message(Some(WAIT)).unwrap();
    assert_eq!(reply.payload, vec![0x04]);

    a.delete_session(&session).unwrap();
    assert!(matches!(
        a.delete_session(&session),
        Err(SlimError::InvalidArgument(_))
    ));
}

#[test]
fn test_confirmed_publish_blocking() {
    let router = Router::start();
    let (a, a_conn) = router.adapter(1);
    let (b, _) = router.adapter(2);
    a.set_route(&b.name(), a_conn).unwrap();

    let session = a
        .create_session(SessionConfig::point_to_point(), b.name())
        .unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).unwrap();
    let handle = session
        .publish_with_completion(b"confirmed".to_vec(), None, None)
        .unwrap();
    assert_eq!(handle.wait_for(WAIT), Ok(()));
    assert!(matches!(handle.wait(), Err(SlimError::InvalidArgument(_))));
    assert_eq!(accepted.get_message(Some(WAIT)).unwrap().payload, b"confirmed");
}

#[test]
fn test_listen_timeout() {
    let router = Router::start();
    let (a, _) = router.adapter(1);
    let started = Instant::now();
    assert_eq!(
        a.listen_for_session(Some(Duration::from_millis(50)))
            .unwrap_err(),
        SlimError::Timeout
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_group_invite_through_adapter() {
    let router = Router::start();
    let (a, a_conn) = router.adapter(1);
    let (b, _) = router.adapter(2);
    let (c, _) = router.adapter(3);
    a.set_route(&b.name(), a_conn).unwrap();
    a.set_route(&c.name(), a_conn).unwrap();

    let group = slim_session::Name::new(["org", "ns", "room"], None).unwrap();
    let session = a.create_session(SessionConfig::group(), group).unwrap();
    for member in [&b, &c] {
        let handle = session.invite(member.name()).unwrap();
        assert_eq!(handle.wait_for(WAIT), Ok(()));
    }
    let at_b = b.listen_for_session(Some(WAIT)).unwrap();
    let at_c = c.listen_for_session(Some(WAIT)).unwrap();

    session.publish(b"all".to_vec(), None, None).unwrap();
    assert_eq!(at_b.get_message(Some(WAIT)).unwrap().payload, b"all");
    assert_eq!(at_c.get_message(Some(WAIT)).unwrap().payload, b"all");
}

extern "C" fn wake(data: u64, poll_result: i8) {
    let tx = unsafe { &*(data as *const std::sync::mpsc::Sender<i8>) };
    let _ = tx.send(poll_result);
}

fn session_handle(session: BindingsSessionContext) -> *const std::ffi::c_void {
    std::sync::Arc::into_raw(std::sync::Arc::new(session)) as *const std::ffi::c_void
}

#[test]
fn test_get_message_future_with_continuation() {
    let router = Router::start();
    let (a, a_conn) = router.adapter(1);
    let (b, _) = router.adapter(2);
    a.set_route(&b.name(), a_conn).unwrap();
    let session = a
        .create_session(SessionConfig::point_to_point(), b.name())
        .unwrap();
    let accepted = b.listen_for_session(Some(WAIT)).unwrap();
    let accepted_handle = session_handle(accepted);

    let timeout = codec::lower(&Some(WAIT)).unwrap();
    let fut = unsafe {
        slim_bindings_session_get_message_async(
            accepted_handle,
            ForeignBytes {
                len: timeout.len() as i32,
                data: timeout.as_ptr(),
            },
        )
    };

    let (tx, rx) = std::sync::mpsc::channel::<i8>();
    let data = &tx as *const std::sync::mpsc::Sender<i8> as u64;
    unsafe { slim_bindings_future_poll_buffer(fut, wake, data) };

    session.publish(vec![7, 7], None, None).unwrap();
    let first = rx.recv_timeout(WAIT).unwrap();
    assert!(first == POLL_READY || first == POLL_MAYBE_READY);
    if first == POLL_MAYBE_READY {
        unsafe { slim_bindings_future_poll_buffer(fut, wake, data) };
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), POLL_READY);
    }

    let mut status = CallStatus::default();
    let buf = unsafe { slim_bindings_future_complete_buffer(fut, &mut status) };
    assert!(status.is_success());
    let msg: ReceivedMessage = codec::lift(buf.as_slice()).unwrap();
    buf.destroy();
    assert_eq!(msg.payload, vec![7, 7]);
    assert_eq!(msg.context.source_name, a.name());

    unsafe {
        slim_bindings_future_free_buffer(fut);
        drop(std::sync::Arc::from_raw(
            accepted_handle as *const BindingsSessionContext,
        ));
    }
}

fn adapter_handle(adapter: &BindingsAdapter) -> *const std::ffi::c_void {
    std::sync::Arc::into_raw(std::sync::Arc::new(adapter.clone())) as *const std::ffi::c_void
}

fn foreign(bytes: &[u8]) -> ForeignBytes {
    ForeignBytes {
        len: bytes.len() as i32,
        data: bytes.as_ptr(),
    }
}

#[test]
fn test_delete_session_through_handles() {
    let router = Router::start();
    let (a, a_conn) = router.adapter(1);
    let (b, _) = router.adapter(2);
    a.set_route(&b.name(), a_conn).unwrap();
    let session = a
        .create_session(SessionConfig::point_to_point(), b.name())
        .unwrap();
    let _accepted = b.listen_for_session(Some(WAIT)).unwrap();

    let adapter = adapter_handle(&a);
    let session = session_handle(session);
    let mut status = CallStatus::default();
    unsafe { slim_bindings_adapter_delete_session(adapter, session, &mut status) };
    assert!(status.is_success());
    assert!(a.app().session_ids().is_empty());

    let mut status = CallStatus::default();
    unsafe { slim_bindings_adapter_delete_session(adapter, session, &mut status) };
    assert!(matches!(status.take_error(), Some(SlimError::InvalidArgument(_))));

    unsafe {
        drop(std::sync::Arc::from_raw(session as *const BindingsSessionContext));
        drop(std::sync::Arc::from_raw(adapter as *const BindingsAdapter));
    }
}

#[test]
fn test_freed_create_session_future_runs_to_completion() {
    let router = Router::start();
    let (a, a_conn) = router.adapter(1);
    let absent = name(99);
    a.set_route(&absent, a_conn).unwrap();

    let adapter = adapter_handle(&a);
    let config = codec::lower(&SessionConfig::point_to_point().with_retries(2, 100)).unwrap();
    let destination = codec::lower(&absent).unwrap();
    let fut = unsafe {
        slim_bindings_adapter_create_session_async(adapter, foreign(&config), foreign(&destination))
    };
    wait_until(|| !a.app().session_ids().is_empty());
    unsafe { slim_bindings_future_free_pointer(fut) };

    // The handshake keeps retrying after the free and then cleans up.
    wait_until(|| a.app().session_ids().is_empty());
    unsafe { drop(std::sync::Arc::from_raw(adapter as *const BindingsAdapter)) };
}
