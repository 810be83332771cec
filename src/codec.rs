//! HTTP/2 frame encoding and decoding
//!
//! Low-level wire codec: the fixed 9-byte frame header, per-type payload
//! encoders producing complete frames, and per-type payload decoders guarded
//! by the header's declared length. A decoder that observes a length
//! incompatible with the type's fixed-size fields raises a frame-size error;
//! scope classification (stream vs connection) is the dispatcher's job.

use crate::error::{Error, ErrorCode, Result};
use crate::frames::*;
use crate::settings::Settings;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest length value the 24-bit field can carry (16MB - 1)
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// A decoded frame header, type byte not yet interpreted.
///
/// Frames of unknown type must be skipped, not rejected (RFC 7540
/// Section 4.1), so the raw type byte survives decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrameHeader {
    /// Payload length
    pub length: u32,
    /// Raw type byte
    pub type_byte: u8,
    /// Frame flags
    pub flags: FrameFlags,
    /// Stream id, reserved bit cleared
    pub stream_id: u32,
}

impl RawFrameHeader {
    /// Interpret the type byte; None for frame types this engine does not
    /// know, which callers discard.
    pub fn typed(&self) -> Option<FrameHeader> {
        FrameType::from_u8(self.type_byte).map(|frame_type| FrameHeader {
            length: self.length,
            frame_type,
            flags: self.flags,
            stream_id: self.stream_id,
        })
    }
}

/// Frame codec: header and payload encode/decode
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header into its 9-byte wire form
    pub fn encode_header(header: &FrameHeader) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        buf[0] = ((header.length >> 16) & 0xFF) as u8;
        buf[1] = ((header.length >> 8) & 0xFF) as u8;
        buf[2] = (header.length & 0xFF) as u8;

        // Type (8 bits)
        buf[3] = header.frame_type.as_u8();

        // Flags (8 bits)
        buf[4] = header.flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = header.stream_id & 0x7FFFFFFF;
        buf[5] = ((stream_id >> 24) & 0xFF) as u8;
        buf[6] = ((stream_id >> 16) & 0xFF) as u8;
        buf[7] = ((stream_id >> 8) & 0xFF) as u8;
        buf[8] = (stream_id & 0xFF) as u8;

        buf
    }

    /// Decode a frame header from its 9-byte wire form
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> RawFrameHeader {
        let length =
            ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);

        let type_byte = bytes[3];
        let flags = FrameFlags::from_u8(bytes[4]);

        // Stream ID (31 bits, reserved bit masked off)
        let stream_id = ((bytes[5] as u32 & 0x7F) << 24)
            | ((bytes[6] as u32) << 16)
            | ((bytes[7] as u32) << 8)
            | (bytes[8] as u32);

        RawFrameHeader {
            length,
            type_byte,
            flags,
            stream_id,
        }
    }

    // ---- encoders ----

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let mut payload_len = frame.data.len();
        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header = FrameHeader::new(FrameType::Data, flags, frame.stream_id, payload_len as u32);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(&header));

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        buf.put_slice(&frame.data);
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let mut payload_len = frame.header_block.len();
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }
        let padding_len = if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
            pad_len
        } else {
            0
        };

        let header =
            FrameHeader::new(FrameType::Headers, flags, frame.stream_id, payload_len as u32);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(&header));

        if frame.padding.is_some() {
            buf.put_u8(padding_len);
        }
        if let Some(priority) = &frame.priority {
            let mut dep = priority.stream_dependency;
            if priority.exclusive {
                dep |= 0x80000000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }
        buf.put_slice(&frame.header_block);
        if padding_len > 0 {
            buf.put_bytes(0, padding_len as usize);
        }

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = FrameHeader::new(
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len() as u32,
        );
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());
        buf.put_slice(&Self::encode_header(&header));
        buf.put_slice(&frame.header_block);
        buf.freeze()
    }

    /// Encode a complete header block as a HEADERS frame followed by as
    /// many CONTINUATION frames as the block needs at the given max frame
    /// size. The returned frames form one unbroken sequence: the writer
    /// must emit them with nothing in between.
    pub fn encode_header_block(
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        max_frame_size: usize,
    ) -> Vec<Bytes> {
        let mut frames = Vec::new();

        if block.len() <= max_frame_size {
            let frame = HeadersFrame::new(
                stream_id,
                Bytes::copy_from_slice(block),
                end_stream,
                true,
            );
            frames.push(Self::encode_headers_frame(&frame));
            return frames;
        }

        let (first, rest) = block.split_at(max_frame_size);
        let frame = HeadersFrame::new(stream_id, Bytes::copy_from_slice(first), end_stream, false);
        frames.push(Self::encode_headers_frame(&frame));

        let mut chunks = rest.chunks(max_frame_size).peekable();
        while let Some(chunk) = chunks.next() {
            let cont = ContinuationFrame {
                stream_id,
                header_block: Bytes::copy_from_slice(chunk),
                end_headers: chunks.peek().is_none(),
            };
            frames.push(Self::encode_continuation_frame(&cont));
        }

        frames
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let settings_data = if frame.ack {
            Bytes::new()
        } else {
            frame.settings.encode()
        };

        // Stream ID must be 0 for SETTINGS
        let header = FrameHeader::new(FrameType::Settings, flags, 0, settings_data.len() as u32);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + settings_data.len());
        buf.put_slice(&Self::encode_header(&header));
        buf.put_slice(&settings_data);
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let header = FrameHeader::new(FrameType::Ping, flags, 0, 8);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(&header));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let payload_len = 8 + frame.debug_data.len();

        let header = FrameHeader::new(FrameType::Goaway, FrameFlags::empty(), 0, payload_len as u32);
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(&header));
        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let header = FrameHeader::new(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(&header));
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let header = FrameHeader::new(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        );
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(&header));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let header = FrameHeader::new(
            FrameType::Priority,
            FrameFlags::empty(),
            frame.stream_id,
            5,
        );
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        buf.put_slice(&Self::encode_header(&header));

        let mut dep = frame.priority.stream_dependency;
        if frame.priority.exclusive {
            dep |= 0x80000000;
        }
        buf.put_u32(dep);
        buf.put_u8(frame.priority.weight);
        buf.freeze()
    }

    // ---- payload decoders ----

    /// Strip the pad-length prefix and trailing padding from a PADDED
    /// payload; returns the unpadded content.
    fn unpad(header: &FrameHeader, payload: Bytes) -> Result<Bytes> {
        if !header.flags.is_padded() {
            return Ok(payload);
        }
        if payload.is_empty() {
            return Err(Error::Protocol(
                "PADDED frame with empty payload".to_string(),
            ));
        }
        let pad_len = payload[0] as usize;
        if pad_len + 1 > payload.len() {
            // Padding longer than the payload it pads
            return Err(Error::Protocol(format!(
                "Pad length {} exceeds payload length {}",
                pad_len,
                payload.len() - 1
            )));
        }
        Ok(payload.slice(1..payload.len() - pad_len))
    }

    /// Decode a DATA payload
    pub fn decode_data_frame(header: &FrameHeader, payload: Bytes) -> Result<DataFrame> {
        let padding = if header.flags.is_padded() {
            Some(payload.first().copied().unwrap_or(0))
        } else {
            None
        };
        let data = Self::unpad(header, payload)?;

        Ok(DataFrame {
            stream_id: header.stream_id,
            data,
            end_stream: header.flags.is_end_stream(),
            padding,
        })
    }

    /// Decode a HEADERS payload
    pub fn decode_headers_frame(header: &FrameHeader, payload: Bytes) -> Result<HeadersFrame> {
        let padding = if header.flags.is_padded() {
            Some(payload.first().copied().unwrap_or(0))
        } else {
            None
        };
        let mut content = Self::unpad(header, payload)?;

        let priority = if header.flags.is_priority() {
            if content.len() < 5 {
                return Err(Error::FrameSize(
                    "HEADERS with PRIORITY flag shorter than 5 bytes".to_string(),
                ));
            }
            let dep = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
            let weight = content[4];
            content = content.slice(5..);
            Some(PrioritySpec::new(dep & 0x7FFFFFFF, dep & 0x80000000 != 0, weight))
        } else {
            None
        };

        Ok(HeadersFrame {
            stream_id: header.stream_id,
            header_block: content,
            end_stream: header.flags.is_end_stream(),
            end_headers: header.flags.is_end_headers(),
            priority,
            padding,
        })
    }

    /// Decode a CONTINUATION payload
    pub fn decode_continuation_frame(header: &FrameHeader, payload: Bytes) -> ContinuationFrame {
        ContinuationFrame {
            stream_id: header.stream_id,
            header_block: payload,
            end_headers: header.flags.is_end_headers(),
        }
    }

    /// Decode a PRIORITY payload (exactly 5 bytes)
    pub fn decode_priority_frame(header: &FrameHeader, payload: &[u8]) -> Result<PriorityFrame> {
        if payload.len() != 5 {
            return Err(Error::FrameSize(format!(
                "PRIORITY payload must be 5 bytes, got {}",
                payload.len()
            )));
        }
        let dep = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(PriorityFrame {
            stream_id: header.stream_id,
            priority: PrioritySpec::new(dep & 0x7FFFFFFF, dep & 0x80000000 != 0, payload[4]),
        })
    }

    /// Decode a RST_STREAM payload (exactly 4 bytes)
    ///
    /// Unknown error codes are carried as INTERNAL_ERROR per RFC 7540
    /// Section 7.
    pub fn decode_rst_stream_frame(header: &FrameHeader, payload: &[u8]) -> Result<RstStreamFrame> {
        if payload.len() != 4 {
            return Err(Error::FrameSize(format!(
                "RST_STREAM payload must be 4 bytes, got {}",
                payload.len()
            )));
        }
        let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(RstStreamFrame {
            stream_id: header.stream_id,
            error_code: ErrorCode::from_u32(code).unwrap_or(ErrorCode::InternalError),
        })
    }

    /// Decode a SETTINGS payload
    pub fn decode_settings_frame(header: &FrameHeader, payload: &[u8]) -> Result<SettingsFrame> {
        if header.flags.is_ack() {
            if !payload.is_empty() {
                return Err(Error::FrameSize(
                    "SETTINGS ACK must have an empty payload".to_string(),
                ));
            }
            return Ok(SettingsFrame::ack());
        }

        Ok(SettingsFrame::new(Settings::decode(payload)?))
    }

    /// Decode a PUSH_PROMISE payload
    pub fn decode_push_promise_frame(
        header: &FrameHeader,
        payload: Bytes,
    ) -> Result<PushPromiseFrame> {
        let padding = if header.flags.is_padded() {
            Some(payload.first().copied().unwrap_or(0))
        } else {
            None
        };
        let content = Self::unpad(header, payload)?;
        if content.len() < 4 {
            return Err(Error::FrameSize(
                "PUSH_PROMISE payload shorter than 4 bytes".to_string(),
            ));
        }
        let promised = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);

        Ok(PushPromiseFrame {
            stream_id: header.stream_id,
            promised_stream_id: promised & 0x7FFFFFFF,
            header_block: content.slice(4..),
            end_headers: header.flags.is_end_headers(),
            padding,
        })
    }

    /// Decode a PING payload (exactly 8 bytes)
    pub fn decode_ping_frame(header: &FrameHeader, payload: &[u8]) -> Result<PingFrame> {
        if payload.len() != 8 {
            return Err(Error::FrameSize(format!(
                "PING payload must be 8 bytes, got {}",
                payload.len()
            )));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(payload);
        Ok(PingFrame {
            ack: header.flags.is_ack(),
            data,
        })
    }

    /// Decode a GOAWAY payload (at least 8 bytes)
    pub fn decode_goaway_frame(_header: &FrameHeader, payload: Bytes) -> Result<GoawayFrame> {
        if payload.len() < 8 {
            return Err(Error::FrameSize(format!(
                "GOAWAY payload must be at least 8 bytes, got {}",
                payload.len()
            )));
        }
        let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Ok(GoawayFrame {
            last_stream_id: last & 0x7FFFFFFF,
            error_code: ErrorCode::from_u32(code).unwrap_or(ErrorCode::InternalError),
            debug_data: payload.slice(8..),
        })
    }

    /// Decode a WINDOW_UPDATE payload (exactly 4 bytes)
    pub fn decode_window_update_frame(
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<WindowUpdateFrame> {
        if payload.len() != 4 {
            return Err(Error::FrameSize(format!(
                "WINDOW_UPDATE payload must be 4 bytes, got {}",
                payload.len()
            )));
        }
        let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(WindowUpdateFrame {
            stream_id: header.stream_id,
            size_increment: increment & 0x7FFFFFFF,
        })
    }

    // ---- transport I/O ----

    /// Read exactly one frame: the 9-byte header, then exactly `length`
    /// payload bytes. A declared length above `max_frame_size` is rejected
    /// before any payload byte is read.
    pub fn read_frame<R: Read>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<(RawFrameHeader, Bytes)> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::ConnectionClosed
            } else {
                Error::Io(e)
            }
        })?;

        let header = Self::decode_header(&header_bytes);

        if header.length as usize > max_frame_size {
            return Err(Error::FrameSize(format!(
                "Frame length {} exceeds advertised maximum {}",
                header.length, max_frame_size
            )));
        }

        let mut payload = vec![0u8; header.length as usize];
        if !payload.is_empty() {
            reader.read_exact(&mut payload)?;
        }

        Ok((header, Bytes::from(payload)))
    }

    /// Write a complete encoded frame and flush
    pub fn write_frame<W: Write>(writer: &mut W, frame_data: &[u8]) -> Result<()> {
        writer.write_all(frame_data)?;
        writer.flush()?;
        Ok(())
    }
}
