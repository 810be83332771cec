//! Wire-level protocol tests
//!
//! One side of each test is a real engine; the other speaks raw frames
//! over the socket, so malformed input and byte-level properties (frame
//! atomicity, error classification, GOAWAY emission) can be observed
//! directly.

use bytes::Bytes;
use h2mux::codec::{FrameCodec, RawFrameHeader};
use h2mux::error::{Error, ErrorCode};
use h2mux::frames::{DataFrame, FrameFlags, FrameHeader, FrameType, HeadersFrame, SettingsFrame};
use h2mux::settings::Settings;
use h2mux::{Connection, ConnectionBuilder, HeaderField, CONNECTION_PREFACE};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;

/// Start a server engine and return a raw client socket that has
/// completed the preface and initial SETTINGS exchange.
fn raw_client_against_engine(builder: ConnectionBuilder) -> (TcpStream, Connection<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        builder.server(sock.try_clone().unwrap(), sock).unwrap()
    });

    let mut sock = TcpStream::connect(addr).unwrap();
    sock.write_all(CONNECTION_PREFACE).unwrap();
    let settings = FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new()));
    sock.write_all(&settings).unwrap();

    let server = server_thread.join().unwrap();
    (sock, server)
}

fn read_typed(sock: &mut TcpStream) -> (RawFrameHeader, Bytes) {
    FrameCodec::read_frame(sock, 1 << 24).expect("peer closed before expected frame")
}

/// Read frames until a GOAWAY arrives; return its error code.
fn read_until_goaway(sock: &mut TcpStream) -> ErrorCode {
    loop {
        let (raw, payload) = read_typed(sock);
        if let Some(header) = raw.typed() {
            if header.frame_type == FrameType::Goaway {
                let frame = FrameCodec::decode_goaway_frame(&header, payload).unwrap();
                return frame.error_code;
            }
        }
    }
}

#[test]
fn data_on_idle_stream_is_connection_error() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    let frame = FrameCodec::encode_data_frame(&DataFrame::new(5, Bytes::from_static(b"x"), false));
    sock.write_all(&frame).unwrap();

    assert_eq!(read_until_goaway(&mut sock), ErrorCode::ProtocolError);
}

#[test]
fn headers_on_stream_zero_is_connection_error() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    let frame =
        FrameCodec::encode_headers_frame(&HeadersFrame::new(0, Bytes::new(), true, true));
    sock.write_all(&frame).unwrap();

    assert_eq!(read_until_goaway(&mut sock), ErrorCode::ProtocolError);
}

#[test]
fn short_rst_stream_is_frame_size_error() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    // RST_STREAM must be exactly 4 bytes; send 5
    let header = FrameHeader::new(FrameType::RstStream, FrameFlags::empty(), 1, 5);
    sock.write_all(&FrameCodec::encode_header(&header)).unwrap();
    sock.write_all(&[0u8; 5]).unwrap();

    assert_eq!(read_until_goaway(&mut sock), ErrorCode::FrameSizeError);
}

#[test]
fn oversized_frame_rejected_before_payload() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    // Declared length above the advertised SETTINGS_MAX_FRAME_SIZE
    let header = FrameHeader::new(FrameType::Data, FrameFlags::empty(), 1, 20000);
    sock.write_all(&FrameCodec::encode_header(&header)).unwrap();

    assert_eq!(read_until_goaway(&mut sock), ErrorCode::FrameSizeError);
}

#[test]
fn settings_payload_not_multiple_of_six_is_frame_size_error() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    let header = FrameHeader::new(FrameType::Settings, FrameFlags::empty(), 0, 5);
    sock.write_all(&FrameCodec::encode_header(&header)).unwrap();
    sock.write_all(&[0u8; 5]).unwrap();

    assert_eq!(read_until_goaway(&mut sock), ErrorCode::FrameSizeError);
}

#[test]
fn continuation_interrupted_by_other_stream_is_connection_error() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    // Open a header block on stream 1 without END_HEADERS, then interpose
    // a frame from another stream
    let headers =
        FrameCodec::encode_headers_frame(&HeadersFrame::new(1, Bytes::new(), false, false));
    sock.write_all(&headers).unwrap();

    let interloper =
        FrameCodec::encode_data_frame(&DataFrame::new(3, Bytes::from_static(b"x"), false));
    sock.write_all(&interloper).unwrap();

    assert_eq!(read_until_goaway(&mut sock), ErrorCode::ProtocolError);
}

#[test]
fn unknown_frame_types_are_skipped() {
    let (mut sock, _server) = raw_client_against_engine(ConnectionBuilder::new());

    // A frame of unassigned type must be discarded, not rejected
    let mut unknown = FrameCodec::encode_header(&FrameHeader::new(
        FrameType::Data,
        FrameFlags::empty(),
        1,
        3,
    ))
    .to_vec();
    unknown[3] = 0xbe;
    unknown.extend_from_slice(&[1, 2, 3]);
    sock.write_all(&unknown).unwrap();

    // The connection is still alive: a PING comes back acknowledged
    let ping = FrameCodec::encode_ping_frame(&h2mux::frames::PingFrame::new([7; 8]));
    sock.write_all(&ping).unwrap();

    loop {
        let (raw, payload) = read_typed(&mut sock);
        if let Some(header) = raw.typed() {
            assert_ne!(header.frame_type, FrameType::Goaway, "engine rejected the frame");
            if header.frame_type == FrameType::Ping {
                let frame = FrameCodec::decode_ping_frame(&header, &payload).unwrap();
                assert!(frame.ack);
                assert_eq!(frame.data, [7; 8]);
                break;
            }
        }
    }
}

#[test]
fn stale_stream_id_gets_rst_not_goaway() {
    let (mut sock, server) = raw_client_against_engine(ConnectionBuilder::new());

    // Stream 9 is below no previously seen id, so HEADERS for it after the
    // engine has seen stream 11 is a stream error, not a connection error
    let mut encoder = h2mux::headers::HeaderEncoder::new();
    let block = encoder
        .encode(&[HeaderField::new(":method", "GET")])
        .unwrap();
    let open_11 = FrameCodec::encode_headers_frame(&HeadersFrame::new(11, block, false, true));
    sock.write_all(&open_11).unwrap();
    let _stream = server.accept().unwrap();

    let stale =
        FrameCodec::encode_headers_frame(&HeadersFrame::new(9, Bytes::new(), false, true));
    sock.write_all(&stale).unwrap();

    loop {
        let (raw, payload) = read_typed(&mut sock);
        if let Some(header) = raw.typed() {
            assert_ne!(header.frame_type, FrameType::Goaway, "expected stream-level error");
            if header.frame_type == FrameType::RstStream {
                let frame = FrameCodec::decode_rst_stream_frame(&header, &payload).unwrap();
                assert_eq!(frame.stream_id, 9);
                assert_eq!(frame.error_code, ErrorCode::StreamClosed);
                break;
            }
        }
    }
}

#[test]
fn concurrent_stream_limit_refuses_with_rst() {
    let (mut sock, server) =
        raw_client_against_engine(ConnectionBuilder::new().max_concurrent_streams(1));

    // The engine's limit is in effect once we acknowledge its SETTINGS
    loop {
        let (raw, _payload) = read_typed(&mut sock);
        if let Some(header) = raw.typed() {
            if header.frame_type == FrameType::Settings && !header.flags.is_ack() {
                break;
            }
        }
    }
    let ack = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
    sock.write_all(&ack).unwrap();

    let first = FrameCodec::encode_headers_frame(&HeadersFrame::new(1, Bytes::new(), false, true));
    sock.write_all(&first).unwrap();
    let _stream = server.accept().unwrap();

    let second =
        FrameCodec::encode_headers_frame(&HeadersFrame::new(3, Bytes::new(), false, true));
    sock.write_all(&second).unwrap();

    loop {
        let (raw, payload) = read_typed(&mut sock);
        if let Some(header) = raw.typed() {
            if header.frame_type == FrameType::RstStream {
                let frame = FrameCodec::decode_rst_stream_frame(&header, &payload).unwrap();
                assert_eq!(frame.stream_id, 3);
                assert_eq!(frame.error_code, ErrorCode::RefusedStream);
                break;
            }
        }
    }
}

#[test]
fn bad_preface_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_thread = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        ConnectionBuilder::new().server(sock.try_clone().unwrap(), sock)
    });

    let mut sock = TcpStream::connect(addr).unwrap();
    sock.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let result = server_thread.join().unwrap();
    assert!(matches!(result, Err(Error::MissingPreface)));
}

/// A header block split over CONTINUATION frames must appear on the wire
/// as one contiguous run, with no other stream's frame interposed, even
/// under concurrent writers.
#[test]
fn continuation_sequences_stay_contiguous_under_concurrency() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Raw server: handshake, then observe the client's frame stream
    let observer = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut preface = [0u8; 24];
        std::io::Read::read_exact(&mut sock, &mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);

        let settings = FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new()));
        sock.write_all(&settings).unwrap();

        let mut sequences = 0;
        while sequences < 4 {
            let (raw, _payload) = read_typed(&mut sock);
            let Some(header) = raw.typed() else { continue };
            match header.frame_type {
                FrameType::Headers if !header.flags.is_end_headers() => {
                    // An open block: every following frame must be a
                    // CONTINUATION for the same stream until END_HEADERS
                    let block_stream = header.stream_id;
                    loop {
                        let (raw, _payload) = read_typed(&mut sock);
                        let header = raw.typed().expect("unknown frame inside header block");
                        assert_eq!(
                            header.frame_type,
                            FrameType::Continuation,
                            "header block for stream {} interrupted",
                            block_stream
                        );
                        assert_eq!(header.stream_id, block_stream);
                        if header.flags.is_end_headers() {
                            break;
                        }
                    }
                    sequences += 1;
                }
                FrameType::Headers => sequences += 1,
                _ => {}
            }
        }
    });

    let sock = TcpStream::connect(addr).unwrap();
    let client =
        std::sync::Arc::new(Connection::client(sock.try_clone().unwrap(), sock).unwrap());

    // Header blocks far above the 16 KB frame limit force CONTINUATIONs;
    // distinct values keep HPACK from shrinking them via the dynamic table
    let mut writers = Vec::new();
    for i in 0..4 {
        let client = std::sync::Arc::clone(&client);
        writers.push(thread::spawn(move || {
            client
                .open_stream(
                    &[
                        HeaderField::new(":method", "GET"),
                        HeaderField::new(":path", "/"),
                        HeaderField::new("x-large", format!("{}{}", "v".repeat(60_000), i)),
                    ],
                    true,
                )
                .unwrap();
        }));
    }
    for writer in writers {
        writer.join().unwrap();
    }

    observer.join().unwrap();
}
