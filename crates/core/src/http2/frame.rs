//! HTTP/2 frame types and the wire codec.
//!
//! Inbound bytes are cut into [`RawFrame`]s by [`FrameCodec`] (a
//! [`tokio_util::codec::Decoder`]); the connection reader turns raw frames
//! into the typed [`Http2Frame`] variants the rest of the engine works with.
//! Outbound frames are serialized by the `encode_*` helpers, always on the
//! connection writer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::ProtocolError;
use crate::http2::headers::Http2Headers;
use crate::http2::settings::ABSOLUTE_MAX_FRAME_SIZE;

/// The 24-byte client connection preface.
pub(crate) const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

pub(crate) mod frame_type {
    pub(crate) const DATA: u8 = 0x0;
    pub(crate) const HEADERS: u8 = 0x1;
    pub(crate) const PRIORITY: u8 = 0x2;
    pub(crate) const RST_STREAM: u8 = 0x3;
    pub(crate) const SETTINGS: u8 = 0x4;
    pub(crate) const PUSH_PROMISE: u8 = 0x5;
    pub(crate) const PING: u8 = 0x6;
    pub(crate) const GOAWAY: u8 = 0x7;
    pub(crate) const WINDOW_UPDATE: u8 = 0x8;
    pub(crate) const CONTINUATION: u8 = 0x9;
}

pub(crate) mod flags {
    pub(crate) const END_STREAM: u8 = 0x1;
    pub(crate) const ACK: u8 = 0x1;
    pub(crate) const END_HEADERS: u8 = 0x4;
    pub(crate) const PADDED: u8 = 0x8;
    pub(crate) const PRIORITY: u8 = 0x20;
}

/// An HTTP/2 error code, carried by RST_STREAM and GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2ErrorCode(pub u32);

impl Http2ErrorCode {
    /// Graceful shutdown or no error.
    pub const NO_ERROR: Self = Self(0x0);
    /// Protocol error detected.
    pub const PROTOCOL_ERROR: Self = Self(0x1);
    /// Implementation fault.
    pub const INTERNAL_ERROR: Self = Self(0x2);
    /// Flow-control limits exceeded.
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    /// Frame size incorrect.
    pub const FRAME_SIZE_ERROR: Self = Self(0x6);
    /// Stream not processed.
    pub const REFUSED_STREAM: Self = Self(0x7);
    /// Stream cancelled.
    pub const CANCEL: Self = Self(0x8);
    /// Compression state not updated.
    pub const COMPRESSION_ERROR: Self = Self(0x9);
}

impl std::fmt::Display for Http2ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A HEADERS frame (initial headers or trailers).
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    /// Owning stream.
    pub stream_id: u32,
    /// The decoded header block.
    pub headers: Http2Headers,
    /// Whether this frame half-closes the sender.
    pub end_stream: bool,
}

/// A DATA frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    /// Owning stream.
    pub stream_id: u32,
    /// Payload with padding removed.
    pub data: Bytes,
    /// Length counted against flow control (padding included).
    pub flow_controlled_length: usize,
    /// Whether this frame half-closes the sender.
    pub end_stream: bool,
}

/// A typed HTTP/2 frame.
#[derive(Debug, Clone)]
pub enum Http2Frame {
    /// HEADERS or trailers.
    Headers(HeadersFrame),
    /// DATA.
    Data(DataFrame),
    /// WINDOW_UPDATE; `stream_id == 0` addresses the whole connection.
    WindowUpdate {
        /// Target stream, 0 for the connection.
        stream_id: u32,
        /// Window increment.
        delta: u32,
    },
    /// RST_STREAM. Implicitly ends the stream.
    RstStream {
        /// Target stream.
        stream_id: u32,
        /// Why the stream was torn down.
        error_code: Http2ErrorCode,
    },
    /// PING.
    Ping {
        /// Opaque payload, echoed back in the ack.
        payload: [u8; 8],
        /// Whether this is the acknowledgement.
        ack: bool,
    },
    /// SETTINGS.
    Settings {
        /// `(identifier, value)` pairs.
        settings: Vec<(u16, u32)>,
        /// Whether this is the acknowledgement.
        ack: bool,
    },
    /// GOAWAY.
    Goaway {
        /// Highest stream id the peer may have processed.
        last_stream_id: u32,
        /// Why the connection is going away.
        error_code: Http2ErrorCode,
    },
}

impl Http2Frame {
    /// The stream the frame belongs to (0 for connection scope).
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Headers(f) => f.stream_id,
            Self::Data(f) => f.stream_id,
            Self::WindowUpdate { stream_id, .. } | Self::RstStream { stream_id, .. } => *stream_id,
            Self::Ping { .. } | Self::Settings { .. } | Self::Goaway { .. } => 0,
        }
    }

    /// Whether the frame half-closes the remote sender.
    pub fn end_stream(&self) -> bool {
        match self {
            Self::Headers(f) => f.end_stream,
            Self::Data(f) => f.end_stream,
            Self::RstStream { .. } => true,
            _ => false,
        }
    }
}

/// A frame as cut from the wire, header parsed but payload untyped.
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub(crate) typ: u8,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
    pub(crate) payload: Bytes,
}

impl RawFrame {
    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Cuts a byte stream into raw frames; on the server side it first consumes
/// the client connection preface.
#[derive(Debug)]
pub(crate) struct FrameCodec {
    expect_preface: bool,
    max_frame_size: u32,
}

impl FrameCodec {
    pub(crate) fn new(expect_preface: bool) -> Self {
        Self {
            expect_preface,
            // Lenient receive limit: we never announce a larger
            // SETTINGS_MAX_FRAME_SIZE, but tolerate peers that do.
            max_frame_size: ABSOLUTE_MAX_FRAME_SIZE,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        if self.expect_preface {
            if src.len() < CONNECTION_PREFACE.len() {
                return Ok(None);
            }
            let preface = src.split_to(CONNECTION_PREFACE.len());
            if &preface[..] != CONNECTION_PREFACE {
                return Err(ProtocolError::BadPreface);
            }
            self.expect_preface = false;
        }

        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([0, src[0], src[1], src[2]]);
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_frame_size,
            });
        }
        if src.len() < FRAME_HEADER_LEN + length as usize {
            src.reserve(FRAME_HEADER_LEN + length as usize - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(FRAME_HEADER_LEN);
        header.advance(3);
        let typ = header.get_u8();
        let flags = header.get_u8();
        let stream_id = header.get_u32() & 0x7fff_ffff;
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(RawFrame {
            typ,
            flags,
            stream_id,
            payload,
        }))
    }
}

/// Remove padding (and on HEADERS the optional priority block) from a frame
/// payload.
pub(crate) fn strip_padding(
    mut payload: Bytes,
    padded: bool,
    priority: bool,
) -> Result<Bytes, ProtocolError> {
    let pad_len = if padded {
        if payload.is_empty() {
            return Err(ProtocolError::InvalidFrame("padded frame too short".into()));
        }
        payload.get_u8() as usize
    } else {
        0
    };
    if priority {
        if payload.len() < 5 {
            return Err(ProtocolError::InvalidFrame(
                "priority block too short".into(),
            ));
        }
        payload.advance(5);
    }
    if pad_len > payload.len() {
        return Err(ProtocolError::InvalidFrame(
            "padding exceeds frame payload".into(),
        ));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

fn put_frame_header(buf: &mut BytesMut, length: usize, typ: u8, flags: u8, stream_id: u32) {
    debug_assert!(length <= ABSOLUTE_MAX_FRAME_SIZE as usize);
    buf.put_uint(length as u64, 3);
    buf.put_u8(typ);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

pub(crate) fn encode_data(buf: &mut BytesMut, stream_id: u32, data: &[u8], end_stream: bool) {
    let flags = if end_stream { flags::END_STREAM } else { 0 };
    put_frame_header(buf, data.len(), frame_type::DATA, flags, stream_id);
    buf.put_slice(data);
}

/// Serialize a header block as a HEADERS frame, spilling into CONTINUATION
/// frames when it exceeds `max_frame_size`.
pub(crate) fn encode_headers(
    buf: &mut BytesMut,
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let first_len = block.len().min(max);
    let (first, mut rest) = block.split_at(first_len);

    let mut first_flags = if end_stream { flags::END_STREAM } else { 0 };
    if rest.is_empty() {
        first_flags |= flags::END_HEADERS;
    }
    put_frame_header(buf, first.len(), frame_type::HEADERS, first_flags, stream_id);
    buf.put_slice(first);

    while !rest.is_empty() {
        let chunk_len = rest.len().min(max);
        let (chunk, tail) = rest.split_at(chunk_len);
        let cont_flags = if tail.is_empty() { flags::END_HEADERS } else { 0 };
        put_frame_header(
            buf,
            chunk.len(),
            frame_type::CONTINUATION,
            cont_flags,
            stream_id,
        );
        buf.put_slice(chunk);
        rest = tail;
    }
}

pub(crate) fn encode_rst_stream(buf: &mut BytesMut, stream_id: u32, error_code: Http2ErrorCode) {
    put_frame_header(buf, 4, frame_type::RST_STREAM, 0, stream_id);
    buf.put_u32(error_code.0);
}

pub(crate) fn encode_window_update(buf: &mut BytesMut, stream_id: u32, delta: u32) {
    put_frame_header(buf, 4, frame_type::WINDOW_UPDATE, 0, stream_id);
    buf.put_u32(delta & 0x7fff_ffff);
}

pub(crate) fn encode_ping(buf: &mut BytesMut, payload: [u8; 8], ack: bool) {
    let flags = if ack { flags::ACK } else { 0 };
    put_frame_header(buf, 8, frame_type::PING, flags, 0);
    buf.put_slice(&payload);
}

pub(crate) fn encode_settings(buf: &mut BytesMut, settings: &[(u16, u32)], ack: bool) {
    let flags = if ack { flags::ACK } else { 0 };
    put_frame_header(buf, settings.len() * 6, frame_type::SETTINGS, flags, 0);
    for (id, value) in settings {
        buf.put_u16(*id);
        buf.put_u32(*value);
    }
}

pub(crate) fn encode_goaway(buf: &mut BytesMut, last_stream_id: u32, error_code: Http2ErrorCode) {
    put_frame_header(buf, 8, frame_type::GOAWAY, 0, 0);
    buf.put_u32(last_stream_id & 0x7fff_ffff);
    buf.put_u32(error_code.0);
}

pub(crate) fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>, ProtocolError> {
    if payload.len() % 6 != 0 {
        return Err(ProtocolError::InvalidFrame(
            "settings payload not a multiple of 6".into(),
        ));
    }
    let mut buf = payload;
    let mut settings = Vec::with_capacity(payload.len() / 6);
    while buf.has_remaining() {
        let id = buf.get_u16();
        let value = buf.get_u32();
        settings.push((id, value));
    }
    Ok(settings)
}
