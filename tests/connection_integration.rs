//! Engine-to-engine integration tests
//!
//! These tests wire a client connection to a server connection over
//! loopback TCP and exercise the full stack: preface and settings
//! exchange, stream lifecycle, flow control and cancellation.

use h2mux::error::{Error, ErrorCode};
use h2mux::{Connection, ConnectionBuilder, HeaderField, StreamEvent, StreamState};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Build a connected client/server pair with the given builders
fn pair(
    client: ConnectionBuilder,
    server: ConnectionBuilder,
) -> (Connection<TcpStream>, Connection<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        server.server(sock.try_clone().unwrap(), sock).unwrap()
    });

    let sock = TcpStream::connect(addr).unwrap();
    let client_conn = client.client(sock.try_clone().unwrap(), sock).unwrap();
    let server_conn = server_thread.join().unwrap();
    (client_conn, server_conn)
}

fn default_pair() -> (Connection<TcpStream>, Connection<TcpStream>) {
    pair(ConnectionBuilder::new(), ConnectionBuilder::new())
}

fn request_fields() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":path", "/"),
        HeaderField::new(":scheme", "http"),
        HeaderField::new(":authority", "localhost"),
    ]
}

fn response_fields() -> Vec<HeaderField> {
    vec![HeaderField::new(":status", "200")]
}

/// Poll until `predicate` holds or the timeout elapses
fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn request_response_closes_stream() {
    let (client, server) = default_pair();

    // HEADERS with END_STREAM skips Open entirely
    let stream = client.open_stream(&request_fields(), true).unwrap();
    assert_eq!(stream.id(), 1);
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);

    let served = server.accept().unwrap();
    assert_eq!(served.id(), 1);
    match served.read_event().unwrap().unwrap() {
        StreamEvent::Headers { fields, end_stream } => {
            assert!(end_stream);
            assert_eq!(fields[0], HeaderField::new(":method", "GET"));
        }
        other => panic!("expected headers, got {:?}", other),
    }

    served.write_headers(&response_fields(), true).unwrap();
    assert_eq!(served.state(), StreamState::Closed);

    match stream.read_event().unwrap().unwrap() {
        StreamEvent::Headers { fields, end_stream } => {
            assert!(end_stream);
            assert_eq!(fields[0], HeaderField::new(":status", "200"));
        }
        other => panic!("expected headers, got {:?}", other),
    }
    assert_eq!(stream.read_event().unwrap(), None);
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn body_round_trip_with_trailers() {
    let (client, server) = default_pair();

    let stream = client.open_stream(&request_fields(), false).unwrap();
    stream.write_data(b"hello ", false).unwrap();
    stream.write_data(b"world", false).unwrap();
    stream
        .write_trailers(&[HeaderField::new("x-checksum", "abc123")])
        .unwrap();

    let served = server.accept().unwrap();
    let events: Vec<_> = served.events().map(|e| e.unwrap()).collect();
    assert_eq!(events.len(), 4);
    assert!(matches!(events[0], StreamEvent::Headers { end_stream: false, .. }));
    assert_eq!(
        events[1],
        StreamEvent::Data {
            chunk: bytes::Bytes::from_static(b"hello "),
            end_stream: false
        }
    );
    assert_eq!(
        events[2],
        StreamEvent::Data {
            chunk: bytes::Bytes::from_static(b"world"),
            end_stream: false
        }
    );
    match &events[3] {
        StreamEvent::Trailers { fields } => {
            assert_eq!(fields[0], HeaderField::new("x-checksum", "abc123"));
        }
        other => panic!("expected trailers, got {:?}", other),
    }
}

#[test]
fn trailers_reject_pseudo_headers() {
    let (client, _server) = default_pair();
    let stream = client.open_stream(&request_fields(), false).unwrap();
    let result = stream.write_trailers(&[HeaderField::new(":status", "200")]);
    assert!(matches!(result, Err(Error::InvalidHeader(_))));
}

#[test]
fn pseudo_header_after_regular_rejected_before_encoding() {
    let (client, _server) = default_pair();
    let fields = vec![
        HeaderField::new("accept", "*/*"),
        HeaderField::new(":method", "GET"),
    ];
    assert!(matches!(
        client.open_stream(&fields, true),
        Err(Error::InvalidHeader(_))
    ));
}

#[test]
fn large_transfer_respects_frame_and_window_limits() {
    let (client, server) = default_pair();

    // 200 KB crosses both the 64 KB windows (needs replenishment) and the
    // 16 KB frame limit (needs splitting)
    let payload = vec![0x5a_u8; 200_000];
    let stream = client.open_stream(&request_fields(), false).unwrap();

    let writer = {
        let payload = payload.clone();
        thread::spawn(move || {
            stream.write_data(&payload, true).unwrap();
        })
    };

    let served = server.accept().unwrap();
    let mut received = Vec::new();
    for event in served.events() {
        match event.unwrap() {
            StreamEvent::Headers { .. } => {}
            StreamEvent::Data { chunk, .. } => {
                assert!(chunk.len() <= 16384, "frame exceeded max frame size");
                received.extend_from_slice(&chunk);
            }
            StreamEvent::Trailers { .. } => panic!("no trailers expected"),
        }
    }
    assert_eq!(received, payload);
    writer.join().unwrap();
}

#[test]
fn ordering_preserved_per_stream_under_interleaving() {
    let (client, server) = default_pair();

    let chunks: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 1000]).collect();

    let mut writers = Vec::new();
    for _ in 0..2 {
        let stream = client.open_stream(&request_fields(), false).unwrap();
        let chunks = chunks.clone();
        writers.push(thread::spawn(move || {
            for (i, chunk) in chunks.iter().enumerate() {
                stream.write_data(chunk, i == chunks.len() - 1).unwrap();
            }
        }));
    }

    for _ in 0..2 {
        let served = server.accept().unwrap();
        let mut expected = 0u8;
        let mut seen = Vec::new();
        for event in served.events() {
            if let StreamEvent::Data { chunk, .. } = event.unwrap() {
                seen.extend_from_slice(&chunk);
            }
        }
        // Delivery may merge wire frames per read, but byte order per
        // stream must match issue order exactly
        assert_eq!(seen.len(), 5000);
        for part in seen.chunks(1000) {
            assert!(part.iter().all(|b| *b == expected));
            expected += 1;
        }
    }

    for writer in writers {
        writer.join().unwrap();
    }
}

#[test]
fn settings_take_local_effect_only_after_ack() {
    let (client, _server) = pair(
        ConnectionBuilder::new()
            .max_concurrent_streams(7)
            .initial_window_size(30000),
        ConnectionBuilder::new(),
    );

    // The peer ACKs promptly, after which the advertised values are in
    // effect locally
    assert!(wait_until(Duration::from_secs(2), || {
        let s = client.local_settings();
        s.max_concurrent_streams == Some(7) && s.initial_window_size == Some(30000)
    }));
}

#[test]
fn window_shrink_suspends_writer_until_replenished() {
    let (client, server) = default_pair();

    let stream = client.open_stream(&request_fields(), false).unwrap();
    let _served = server.accept().unwrap();

    // Shrink the write budget to nothing
    server
        .update_settings(h2mux::SettingsBuilder::new().initial_window_size(0).build().unwrap())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        client.remote_settings().initial_window_size == Some(0)
    }));

    let (done_tx, done_rx) = mpsc::channel();
    let writer = thread::spawn(move || {
        stream.write_data(&[1u8; 1024], true).unwrap();
        done_tx.send(()).unwrap();
    });

    // The write must suspend, not fail and not complete
    assert!(done_rx.recv_timeout(Duration::from_millis(300)).is_err());

    // Raising the window releases it
    server
        .update_settings(
            h2mux::SettingsBuilder::new()
                .initial_window_size(65535)
                .build()
                .unwrap(),
        )
        .unwrap();
    assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
    writer.join().unwrap();
}

#[test]
fn peer_reset_fails_pending_write() {
    // Server advertises a zero window so the client's write parks
    let (client, server) = pair(
        ConnectionBuilder::new(),
        ConnectionBuilder::new().initial_window_size(0),
    );

    assert!(wait_until(Duration::from_secs(2), || {
        client.remote_settings().initial_window_size == Some(0)
    }));

    let stream = client.open_stream(&request_fields(), false).unwrap();
    let served = server.accept().unwrap();

    let (result_tx, result_rx) = mpsc::channel();
    let stream_for_writer = stream.clone();
    let writer = thread::spawn(move || {
        let result = stream_for_writer.write_data(&[9u8; 512], false);
        result_tx.send(result).unwrap();
    });

    // Parked on flow control; now the peer cancels
    assert!(result_rx.recv_timeout(Duration::from_millis(200)).is_err());
    served.cancel().unwrap();

    let result = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    match result {
        Err(Error::StreamReset { stream_id, code }) => {
            assert_eq!(stream_id, 1);
            assert_eq!(code, ErrorCode::Cancel);
        }
        other => panic!("expected StreamReset, got {:?}", other),
    }
    assert_eq!(stream.state(), StreamState::Reset);
    assert_eq!(stream.reset_code(), Some(ErrorCode::Cancel));
    writer.join().unwrap();
}

#[test]
fn cancel_is_idempotent_and_fails_reads() {
    let (client, server) = default_pair();

    let stream = client.open_stream(&request_fields(), false).unwrap();
    let served = server.accept().unwrap();

    let reader_stream = served.clone();
    let (read_tx, read_rx) = mpsc::channel();
    thread::spawn(move || {
        // Skip the headers, then park waiting for data that never comes
        let _ = reader_stream.read_event();
        read_tx.send(reader_stream.read_event()).unwrap();
    });

    stream.cancel().unwrap();
    stream.cancel().unwrap(); // no-op the second time
    assert_eq!(stream.state(), StreamState::Reset);

    let read_result = read_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(
        read_result,
        Err(Error::StreamReset {
            code: ErrorCode::Cancel,
            ..
        })
    ));

    // Writing after cancel fails as a stream-local error
    let write_result = stream.write_data(b"late", false);
    assert!(matches!(write_result, Err(Error::StreamReset { .. })));
    assert!(write_result.unwrap_err().is_stream_error());
}

#[test]
fn concurrent_stream_limit_enforced_locally() {
    let (client, _server) = pair(
        ConnectionBuilder::new(),
        ConnectionBuilder::new().max_concurrent_streams(1),
    );

    assert!(wait_until(Duration::from_secs(2), || {
        client.remote_settings().max_concurrent_streams == Some(1)
    }));

    let _first = client.open_stream(&request_fields(), false).unwrap();
    let second = client.open_stream(&request_fields(), false);
    assert!(matches!(second, Err(Error::TooManyStreams)));
}

#[test]
fn ping_round_trip() {
    let (client, server) = default_pair();
    client.ping().unwrap();
    server.ping().unwrap();
    client.ping().unwrap();
}

#[test]
fn goaway_refuses_new_streams_on_both_ends() {
    let (client, server) = default_pair();

    client.close().unwrap();
    assert!(client.is_closed());

    // Locally: new streams are refused immediately
    assert!(matches!(
        client.open_stream(&request_fields(), true),
        Err(Error::ConnectionClosed)
    ));

    // Remotely: the server observes the GOAWAY and accept fails
    match server.accept() {
        Err(err @ Error::GoawayReceived { .. }) => {
            assert!(matches!(
                err,
                Error::GoawayReceived {
                    code: ErrorCode::NoError,
                    ..
                }
            ));
            assert!(err.is_connection_error());
        }
        other => panic!("expected GoawayReceived, got {:?}", other.map(|s| s.id())),
    }
}

#[test]
fn stream_ids_increase_monotonically() {
    let (client, server) = default_pair();

    let ids: Vec<_> = (0..3)
        .map(|_| client.open_stream(&request_fields(), true).unwrap().id())
        .collect();
    assert_eq!(ids, vec![1, 3, 5]);

    for expected in [1, 3, 5] {
        assert_eq!(server.accept().unwrap().id(), expected);
    }
}

#[test]
fn handle_lookup_tolerates_reaped_streams() {
    let (client, server) = default_pair();

    let stream = client.open_stream(&request_fields(), true).unwrap();
    let served = server.accept().unwrap();
    served.write_headers(&response_fields(), true).unwrap();

    // Drain to completion; the stream is closed and eventually reaped
    while stream.read_event().unwrap().is_some() {}
    assert_eq!(stream.state(), StreamState::Closed);

    assert!(wait_until(Duration::from_secs(2), || {
        client.stream(stream.id()).is_none()
    }));

    // The held handle still answers, and writes fail cleanly
    assert!(matches!(
        stream.write_data(b"x", false),
        Err(Error::StreamClosed(_))
    ));
}
