//! End-to-end session tests over the in-process transport pair.
//!
//! Most tests drive the peer side of the connection directly through the raw
//! transport half, so the exact packet sequence on the wire is controlled by
//! the test. The duplex tests at the bottom run full sessions on both ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use backhaul::{
    MessageListener, Packet, Reconnector, Session, SessionConfig, SessionError, SessionState,
    Transport,
};

fn open_session(transport: Transport) -> Arc<Session> {
    let session = Arc::new(Session::new(transport, "collector.example:9994"));
    session.open().expect("open");
    session
}

#[derive(Default)]
struct RecordingReconnector {
    calls: Mutex<Vec<String>>,
}

impl Reconnector for RecordingReconnector {
    fn reconnect(&self, _session: Arc<Session>, address: &str) {
        self.calls.lock().push(address.to_string());
    }
}

struct EchoListener;

impl MessageListener for EchoListener {
    fn handle_send(&self, _payload: Bytes) {}

    fn handle_request(&self, payload: Bytes) -> Option<Bytes> {
        Some(payload)
    }

    fn handle_stream_create(&self, _stream_id: u32, _payload: Bytes) -> Result<(), String> {
        Ok(())
    }

    fn handle_stream_data(&self, _stream_id: u32, _payload: Bytes) {}

    fn handle_stream_close(&self, _stream_id: u32) {}
}

// ============================================================================
// Request/response
// ============================================================================

#[tokio::test]
async fn request_resolves_with_matching_response() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        match b.recv_packet().await.expect("request") {
            Packet::Request { id, payload } => {
                assert_eq!(id, 1);
                assert_eq!(payload, Bytes::from_static(&[1, 2, 3]));
                b.send_packet(Packet::Response {
                    id,
                    payload: Bytes::from_static(&[9]),
                })
                .await
                .expect("response");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    });

    let response = session
        .request(Bytes::from_static(&[1, 2, 3]))
        .await
        .expect("response");
    assert_eq!(response, Bytes::from_static(&[9]));
    assert_eq!(session.pending_calls(), 0);
    peer.await.unwrap();
}

#[tokio::test]
async fn request_fails_fast_when_not_running() {
    let (a, b) = Transport::mem_pair();
    let session = Arc::new(Session::new(a, "collector.example:9994"));

    let err = session.request(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidState(SessionState::Init)
    ));

    // Nothing was written.
    let quiet = tokio::time::timeout(Duration::from_millis(50), b.recv_packet()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn late_response_after_timeout_is_discarded() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        let id = match b.recv_packet().await.expect("first request") {
            Packet::Request { id, .. } => id,
            other => panic!("unexpected packet: {other:?}"),
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        b.send_packet(Packet::Response {
            id,
            payload: Bytes::from_static(b"late"),
        })
        .await
        .expect("late response");

        // The session must still be healthy: answer the second request
        // promptly.
        match b.recv_packet().await.expect("second request") {
            Packet::Request { id, .. } => {
                b.send_packet(Packet::Response {
                    id,
                    payload: Bytes::from_static(b"fresh"),
                })
                .await
                .expect("response");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    });

    let err = session
        .request_with_timeout(Bytes::from_static(b"slow"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let response = session.request(Bytes::from_static(b"again")).await.unwrap();
    assert_eq!(response, Bytes::from_static(b"fresh"));
    peer.await.unwrap();
}

#[tokio::test]
async fn closure_racing_a_request_fails_it_immediately() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);
    drop(b);

    let started = Instant::now();
    let err = session
        .request_with_timeout(Bytes::from_static(b"x"), Duration::from_secs(30))
        .await
        .unwrap_err();
    // Depending on whether the demux loop noticed the closure first, the
    // call surfaces the write failure, the teardown, or the state gate.
    // Never the 30 s call timeout.
    assert!(matches!(
        err,
        SessionError::WriteFailure(_)
            | SessionError::ConnectionClosed(_)
            | SessionError::InvalidState(_)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn open_twice_is_an_invalid_state_error() {
    let (a, _b) = Transport::mem_pair();
    let session = open_session(a);

    let err = session.open().unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(SessionState::Run)));
}

#[tokio::test]
async fn close_is_idempotent_and_sends_the_handshake() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    assert!(session.close().await);
    assert!(!session.close().await);
    assert_eq!(session.state(), SessionState::Closed);

    match b.recv_packet().await.expect("handshake") {
        Packet::Close => {}
        other => panic!("unexpected packet: {other:?}"),
    }

    let err = session.send(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidState(SessionState::Closed)
    ));
}

#[tokio::test]
async fn unexpected_closure_fails_pending_calls_and_reconnects_once() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);
    let reconnector = Arc::new(RecordingReconnector::default());
    session.set_reconnector(reconnector.clone());

    let peer = tokio::spawn(async move {
        for _ in 0..3 {
            match b.recv_packet().await.expect("request") {
                Packet::Request { .. } => {}
                other => panic!("unexpected packet: {other:?}"),
            }
        }
        // Drop the transport without a close handshake.
        drop(b);
    });

    let mut calls = Vec::new();
    for _ in 0..3 {
        let session = session.clone();
        calls.push(tokio::spawn(async move {
            session
                .request_with_timeout(Bytes::from_static(b"ping"), Duration::from_secs(30))
                .await
        }));
    }

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed(_)));
    }
    peer.await.unwrap();

    assert_eq!(session.state(), SessionState::Reconnect);
    assert_eq!(
        *reconnector.calls.lock(),
        vec!["collector.example:9994".to_string()]
    );
}

#[tokio::test]
async fn reattach_returns_the_session_to_run() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);
    session.set_reconnector(Arc::new(RecordingReconnector::default()));

    let err = session.reattach(Transport::mem_pair().0).unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(SessionState::Run)));

    drop(b);
    while session.state() != SessionState::Reconnect {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (c, d) = Transport::mem_pair();
    session.reattach(c).expect("reattach");
    assert_eq!(session.state(), SessionState::Run);

    let peer = tokio::spawn(async move {
        match d.recv_packet().await.expect("request") {
            Packet::Request { id, .. } => {
                d.send_packet(Packet::Response {
                    id,
                    payload: Bytes::from_static(b"back"),
                })
                .await
                .expect("response");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    });

    let response = session.request(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(response, Bytes::from_static(b"back"));
    peer.await.unwrap();
}

#[tokio::test]
async fn handshake_close_from_peer_does_not_reconnect() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);
    let reconnector = Arc::new(RecordingReconnector::default());
    session.set_reconnector(reconnector.clone());

    b.send_packet(Packet::Close).await.unwrap();
    drop(b);

    while session.state() != SessionState::Closed {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(reconnector.calls.lock().is_empty());
}

// ============================================================================
// Fire-and-forget
// ============================================================================

#[tokio::test]
async fn send_sync_completes_the_write() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    session.send_sync(Bytes::from_static(b"beat")).await.unwrap();
    match b.recv_packet().await.unwrap() {
        Packet::Send { payload } => assert_eq!(payload, Bytes::from_static(b"beat")),
        other => panic!("unexpected packet: {other:?}"),
    }
}

#[tokio::test]
async fn send_async_handle_reports_completion() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let handle = session.send_async(Bytes::from_static(b"one")).unwrap();
    handle.wait().await.unwrap();

    let mut handle = session.send_async(Bytes::from_static(b"two")).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The write completed while we were away; probing still observes it.
    match handle.try_result() {
        Some(Ok(())) => {}
        other => panic!("unexpected probe outcome: {other:?}"),
    }

    for expected in [&b"one"[..], &b"two"[..]] {
        match b.recv_packet().await.unwrap() {
            Packet::Send { payload } => assert_eq!(payload, Bytes::copy_from_slice(expected)),
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn stream_open_delivers_payloads_in_order() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        let stream_id = match b.recv_packet().await.expect("create") {
            Packet::StreamCreate { stream_id, payload } => {
                assert_eq!(payload, Bytes::from_static(b"subscribe"));
                stream_id
            }
            other => panic!("unexpected packet: {other:?}"),
        };
        b.send_packet(Packet::StreamCreateSuccess { stream_id })
            .await
            .unwrap();
        for n in 0u8..10 {
            b.send_packet(Packet::StreamResponse {
                stream_id,
                payload: Bytes::copy_from_slice(&[n]),
            })
            .await
            .unwrap();
        }
        b.send_packet(Packet::StreamClose { stream_id }).await.unwrap();
    });

    let mut stream = session
        .open_stream(Bytes::from_static(b"subscribe"))
        .await
        .expect("open stream");
    assert_eq!(stream.stream_id(), 1);

    for n in 0u8..10 {
        assert_eq!(stream.recv().await.unwrap(), Bytes::copy_from_slice(&[n]));
    }
    assert!(stream.recv().await.is_none());
    assert_eq!(session.open_streams(), 0);
    peer.await.unwrap();
}

#[tokio::test]
async fn stream_rejection_surfaces_the_reason_and_leaves_no_entry() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        let stream_id = match b.recv_packet().await.expect("create") {
            Packet::StreamCreate { stream_id, .. } => stream_id,
            other => panic!("unexpected packet: {other:?}"),
        };
        b.send_packet(Packet::StreamCreateFail {
            stream_id,
            reason: "rejected".to_string(),
        })
        .await
        .unwrap();
    });

    let err = session.open_stream(Bytes::new()).await.unwrap_err();
    match err {
        SessionError::StreamRejected(reason) => assert_eq!(reason, "rejected"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.open_streams(), 0);
    peer.await.unwrap();
}

#[tokio::test]
async fn unknown_stream_id_does_not_affect_open_streams() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        let stream_id = match b.recv_packet().await.expect("create") {
            Packet::StreamCreate { stream_id, .. } => stream_id,
            other => panic!("unexpected packet: {other:?}"),
        };
        b.send_packet(Packet::StreamCreateSuccess { stream_id })
            .await
            .unwrap();
        b.send_packet(Packet::StreamResponse {
            stream_id: 999,
            payload: Bytes::from_static(b"stray"),
        })
        .await
        .unwrap();
        b.send_packet(Packet::StreamResponse {
            stream_id,
            payload: Bytes::from_static(b"ok"),
        })
        .await
        .unwrap();
    });

    let mut stream = session.open_stream(Bytes::new()).await.expect("open stream");
    assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"ok"));
    peer.await.unwrap();
}

#[tokio::test]
async fn interleaved_stream_opens_get_distinct_ids() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        for _ in 0..3 {
            match b.recv_packet().await.expect("create") {
                Packet::StreamCreate { stream_id, .. } => {
                    b.send_packet(Packet::StreamCreateSuccess { stream_id })
                        .await
                        .unwrap();
                }
                other => panic!("unexpected packet: {other:?}"),
            }
        }
    });

    let (s1, s2, s3) = tokio::join!(
        session.open_stream(Bytes::new()),
        session.open_stream(Bytes::new()),
        session.open_stream(Bytes::new()),
    );
    let mut ids = vec![
        s1.unwrap().stream_id(),
        s2.unwrap().stream_id(),
        s3.unwrap().stream_id(),
    ];
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    peer.await.unwrap();
}

#[tokio::test]
async fn stream_handle_sends_to_the_peer() {
    let (a, b) = Transport::mem_pair();
    let session = open_session(a);

    let peer = tokio::spawn(async move {
        let stream_id = match b.recv_packet().await.expect("create") {
            Packet::StreamCreate { stream_id, .. } => stream_id,
            other => panic!("unexpected packet: {other:?}"),
        };
        b.send_packet(Packet::StreamCreateSuccess { stream_id })
            .await
            .unwrap();
        match b.recv_packet().await.expect("payload") {
            Packet::StreamResponse { stream_id: got, payload } => {
                assert_eq!(got, stream_id);
                assert_eq!(payload, Bytes::from_static(b"up"));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        match b.recv_packet().await.expect("close") {
            Packet::StreamClose { stream_id: got } => assert_eq!(got, stream_id),
            other => panic!("unexpected packet: {other:?}"),
        }
    });

    let mut stream = session.open_stream(Bytes::new()).await.expect("open stream");
    stream.send(Bytes::from_static(b"up")).await.unwrap();
    stream.close().await.unwrap();
    assert_eq!(session.open_streams(), 0);
    peer.await.unwrap();
}

#[tokio::test]
async fn remote_stream_create_is_offered_to_the_listener() {
    #[derive(Default)]
    struct CollectingListener {
        data: Mutex<Vec<(u32, Bytes)>>,
        closed: Mutex<Vec<u32>>,
    }

    impl MessageListener for CollectingListener {
        fn handle_send(&self, _payload: Bytes) {}

        fn handle_request(&self, _payload: Bytes) -> Option<Bytes> {
            None
        }

        fn handle_stream_create(&self, _stream_id: u32, _payload: Bytes) -> Result<(), String> {
            Ok(())
        }

        fn handle_stream_data(&self, stream_id: u32, payload: Bytes) {
            self.data.lock().push((stream_id, payload));
        }

        fn handle_stream_close(&self, stream_id: u32) {
            self.closed.lock().push(stream_id);
        }
    }

    let (a, b) = Transport::mem_pair();
    let session = open_session(b);
    let listener = Arc::new(CollectingListener::default());
    session.set_listener(listener.clone());

    a.send_packet(Packet::StreamCreate {
        stream_id: 6,
        payload: Bytes::from_static(b"offer"),
    })
    .await
    .unwrap();

    match a.recv_packet().await.expect("verdict") {
        Packet::StreamCreateSuccess { stream_id } => assert_eq!(stream_id, 6),
        other => panic!("unexpected packet: {other:?}"),
    }

    a.send_packet(Packet::StreamResponse {
        stream_id: 6,
        payload: Bytes::from_static(b"x"),
    })
    .await
    .unwrap();
    a.send_packet(Packet::StreamClose { stream_id: 6 }).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *listener.data.lock(),
        vec![(6, Bytes::from_static(b"x"))]
    );
    assert_eq!(*listener.closed.lock(), vec![6]);
    assert_eq!(session.open_streams(), 0);
}

#[tokio::test]
async fn rejected_remote_stream_gets_a_fail_packet() {
    let (a, b) = Transport::mem_pair();
    // Default LoggingListener rejects stream creates.
    let session = open_session(b);

    a.send_packet(Packet::StreamCreate {
        stream_id: 8,
        payload: Bytes::new(),
    })
    .await
    .unwrap();

    match a.recv_packet().await.expect("verdict") {
        Packet::StreamCreateFail { stream_id, reason } => {
            assert_eq!(stream_id, 8);
            assert_eq!(reason, "stream not supported");
        }
        other => panic!("unexpected packet: {other:?}"),
    }
    assert_eq!(session.open_streams(), 0);
}

#[tokio::test]
async fn stream_open_times_out_without_a_verdict() {
    let (a, b) = Transport::mem_pair();
    let session = Arc::new(Session::with_config(
        a,
        "collector.example:9994",
        SessionConfig {
            stream_open_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        },
    ));
    session.open().expect("open");

    // Peer receives the create but never answers.
    let peer = tokio::spawn(async move {
        match b.recv_packet().await.expect("create") {
            Packet::StreamCreate { .. } => {}
            other => panic!("unexpected packet: {other:?}"),
        }
    });

    let err = session.open_stream(Bytes::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout));
    assert_eq!(session.open_streams(), 0);
    peer.await.unwrap();
}

// ============================================================================
// Fatal transport errors
// ============================================================================

#[tokio::test]
async fn framing_fault_forces_the_session_closed() {
    use tokio::io::AsyncWriteExt;

    let (sock, mut raw_peer) = tokio::io::duplex(1024);
    let session = Arc::new(Session::new(Transport::stream(sock), "collector.example:9994"));
    session.open().expect("open");

    // Frame length far past the bound: a framing fault, not a skippable
    // anomaly.
    raw_peer.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    while session.state() != SessionState::Closed {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let err = session.send(Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidState(SessionState::Closed)
    ));
}

// ============================================================================
// Full duplex: sessions on both ends
// ============================================================================

#[tokio::test]
async fn sessions_on_both_ends_echo_requests() {
    let (a, b) = Transport::mem_pair();

    let agent = open_session(a);
    let collector = Arc::new(Session::with_config(
        b,
        "agent.example:1100",
        SessionConfig {
            stream_id_start: 2,
            ..SessionConfig::default()
        },
    ));
    collector.set_listener(Arc::new(EchoListener));
    collector.open().expect("open collector");
    agent.set_listener(Arc::new(EchoListener));

    let response = agent.request(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(response, Bytes::from_static(b"hello"));

    // The other direction works over the same wire.
    let response = collector.request(Bytes::from_static(b"marco")).await.unwrap();
    assert_eq!(response, Bytes::from_static(b"marco"));
}

#[tokio::test]
async fn listener_panic_does_not_kill_the_demux_loop() {
    struct PanickyListener;

    impl MessageListener for PanickyListener {
        fn handle_send(&self, _payload: Bytes) {}

        fn handle_request(&self, payload: Bytes) -> Option<Bytes> {
            if payload == Bytes::from_static(b"boom") {
                panic!("handler exploded");
            }
            Some(payload)
        }

        fn handle_stream_create(&self, _stream_id: u32, _payload: Bytes) -> Result<(), String> {
            Err("no streams".to_string())
        }

        fn handle_stream_data(&self, _stream_id: u32, _payload: Bytes) {}

        fn handle_stream_close(&self, _stream_id: u32) {}
    }

    let (a, b) = Transport::mem_pair();
    let agent = open_session(a);
    let collector = Arc::new(Session::with_config(
        b,
        "agent.example:1100",
        SessionConfig {
            stream_id_start: 2,
            ..SessionConfig::default()
        },
    ));
    collector.set_listener(Arc::new(PanickyListener));
    collector.open().expect("open collector");

    let err = agent
        .request_with_timeout(Bytes::from_static(b"boom"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout));

    let response = agent.request(Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(response, Bytes::from_static(b"ok"));
}
