//! gRPC message framing.
//!
//! Every message crosses the wire as `compressed-flag (1 byte) || length
//! (4 bytes, big-endian) || payload`. [`TriEncoder`] produces that envelope,
//! [`TriDecoder`] is the two-state reader that reassembles it from an
//! arbitrary chunking of DATA frames and hands each payload to its listener.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::compression::{Compressor, Decompressor};
use crate::status::{RpcCode, RpcStatus};

pub(crate) const GRPC_HEADER_LEN: usize = 5;
const COMPRESSED_FLAG_MASK: u8 = 0x01;
const RESERVED_MASK: u8 = 0xFE;

/// Largest message payload accepted in either direction.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4_194_304;

/// Encodes application payloads into the gRPC message envelope.
pub struct TriEncoder {
    compressor: Option<Arc<dyn Compressor>>,
}

impl TriEncoder {
    /// Create an encoder. The compressor is only consulted when a message is
    /// encoded with `compress_flag = 1`.
    pub fn new(compressor: Option<Arc<dyn Compressor>>) -> Self {
        Self { compressor }
    }

    /// Replace the compressor.
    pub fn set_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressor = Some(compressor);
    }

    /// The configured compressor, if any.
    pub fn compressor(&self) -> Option<&Arc<dyn Compressor>> {
        self.compressor.as_ref()
    }

    /// Encode one message.
    pub fn encode(&self, message: &[u8], compress_flag: u8) -> Result<Bytes, RpcStatus> {
        if compress_flag > 1 {
            return Err(RpcStatus::new(RpcCode::Internal)
                .with_description(format!("compress_flag must be 0 or 1, but got {compress_flag}")));
        }

        if message.len() > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(RpcStatus::new(RpcCode::InvalidArgument).with_description(format!(
                "message too large. Allowed maximum size is {DEFAULT_MAX_MESSAGE_SIZE} bytes, but got {} bytes",
                message.len()
            )));
        }

        let payload;
        let body: &[u8] = if compress_flag == 1 {
            let compressor = self.compressor.as_ref().ok_or_else(|| {
                RpcStatus::new(RpcCode::Internal)
                    .with_description("compression is required when compress_flag is 1")
            })?;
            payload = compressor.compress(message).map_err(|e| {
                RpcStatus::new(RpcCode::Internal)
                    .with_description(format!("failed to compress message: {e}"))
            })?;
            &payload
        } else {
            message
        };

        let mut buf = BytesMut::with_capacity(GRPC_HEADER_LEN + body.len());
        buf.put_u8(compress_flag);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for TriEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriEncoder")
            .field(
                "compressor",
                &self.compressor.as_ref().map(|c| c.message_encoding()),
            )
            .finish()
    }
}

/// Receives each reassembled payload from a [`TriDecoder`].
pub trait TriDecoderListener: Send {
    /// A complete (decompressed) message payload.
    fn on_message(&mut self, message: Vec<u8>);

    /// No more payloads will arrive.
    fn on_close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Payload,
}

/// Two-state reader for the gRPC message envelope.
pub struct TriDecoder {
    listener: Box<dyn TriDecoderListener>,
    decompressor: Option<Arc<dyn Decompressor>>,
    accumulate: BytesMut,
    state: DecodeState,
    required_length: usize,
    compressed: bool,
    // Serializes recursive decode() calls issued from listener callbacks.
    decoding: bool,
    closing: bool,
    closed: bool,
}

impl TriDecoder {
    /// Create a decoder delivering payloads to `listener`, decompressing with
    /// `decompressor` when the compressed flag is set.
    pub fn new(
        listener: Box<dyn TriDecoderListener>,
        decompressor: Option<Arc<dyn Decompressor>>,
    ) -> Self {
        Self {
            listener,
            decompressor,
            accumulate: BytesMut::new(),
            state: DecodeState::Header,
            required_length: GRPC_HEADER_LEN,
            compressed: false,
            decoding: false,
            closing: false,
            closed: false,
        }
    }

    /// Feed inbound bytes.
    pub fn decode(&mut self, data: &[u8]) -> Result<(), RpcStatus> {
        self.accumulate.extend_from_slice(data);
        self.do_decode()
    }

    /// Flush and close the listener.
    pub fn close(&mut self) -> Result<(), RpcStatus> {
        self.closing = true;
        self.do_decode()
    }

    fn do_decode(&mut self) -> Result<(), RpcStatus> {
        if self.decoding {
            return Ok(());
        }

        self.decoding = true;
        let result = self.decode_loop();
        self.decoding = false;
        result
    }

    fn decode_loop(&mut self) -> Result<(), RpcStatus> {
        while self.accumulate.len() >= self.required_length {
            match self.state {
                DecodeState::Header => self.process_header()?,
                DecodeState::Payload => self.process_payload()?,
            }
        }
        if self.closing && !self.closed {
            self.closed = true;
            self.accumulate = BytesMut::new();
            self.listener.on_close();
        }
        Ok(())
    }

    fn process_header(&mut self) -> Result<(), RpcStatus> {
        let mut header = self.accumulate.split_to(GRPC_HEADER_LEN);
        let flag = header.get_u8();
        if flag & RESERVED_MASK != 0 {
            return Err(RpcStatus::new(RpcCode::Internal)
                .with_description("gRPC frame header malformed: reserved bits not zero"));
        }
        self.compressed = flag & COMPRESSED_FLAG_MASK != 0;
        self.required_length = header.get_u32() as usize;
        if self.required_length > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(RpcStatus::new(RpcCode::ResourceExhausted).with_description(format!(
                "message of {} bytes exceeds maximum size {DEFAULT_MAX_MESSAGE_SIZE}",
                self.required_length
            )));
        }
        self.state = DecodeState::Payload;
        Ok(())
    }

    fn process_payload(&mut self) -> Result<(), RpcStatus> {
        let payload = self.accumulate.split_to(self.required_length);
        let message = if self.compressed {
            let decompressor = self.decompressor.as_ref().ok_or_else(|| {
                RpcStatus::new(RpcCode::Internal)
                    .with_description("compressed message without a negotiated encoding")
            })?;
            decompressor.decompress(&payload).map_err(|e| {
                RpcStatus::new(RpcCode::Internal)
                    .with_description(format!("failed to decompress message: {e}"))
            })?
        } else {
            payload.to_vec()
        };

        self.listener.on_message(message);

        self.required_length = GRPC_HEADER_LEN;
        self.state = DecodeState::Header;
        Ok(())
    }
}

impl std::fmt::Debug for TriDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriDecoder")
            .field("state", &self.state)
            .field("buffered", &self.accumulate.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{Bzip2, Gzip, Identity};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink {
        messages: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl TriDecoderListener for Sink {
        fn on_message(&mut self, message: Vec<u8>) {
            self.messages.lock().unwrap().push(message);
        }

        fn on_close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn collecting_decoder(
        decompressor: Option<Arc<dyn Decompressor>>,
    ) -> (TriDecoder, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<bool>>) {
        let sink = Sink::default();
        let messages = sink.messages.clone();
        let closed = sink.closed.clone();
        (
            TriDecoder::new(Box::new(sink), decompressor),
            messages,
            closed,
        )
    }

    #[test]
    fn encode_layout() {
        let encoder = TriEncoder::new(None);
        let frame = encoder.encode(b"world", 0).unwrap();
        assert_eq!(&frame[..], b"\x00\x00\x00\x00\x05world");
    }

    #[test]
    fn encode_rejects_oversized_message() {
        let encoder = TriEncoder::new(None);
        let status = encoder
            .encode(&vec![0u8; DEFAULT_MAX_MESSAGE_SIZE + 1], 0)
            .unwrap_err();
        assert_eq!(status.code(), RpcCode::InvalidArgument);
        assert!(status.description().unwrap().contains("message too large"));
    }

    #[test]
    fn encode_requires_compressor_for_flag() {
        let encoder = TriEncoder::new(None);
        let status = encoder.encode(b"x", 1).unwrap_err();
        assert_eq!(status.code(), RpcCode::Internal);
    }

    #[test]
    fn decode_across_arbitrary_chunking() {
        let encoder = TriEncoder::new(None);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encoder.encode(b"first", 0).unwrap());
        wire.extend_from_slice(&encoder.encode(b"", 0).unwrap());
        wire.extend_from_slice(&encoder.encode(b"second", 0).unwrap());

        let (mut decoder, messages, closed) = collecting_decoder(None);
        for chunk in wire.chunks(3) {
            decoder.decode(chunk).unwrap();
        }
        decoder.close().unwrap();

        assert_eq!(
            &*messages.lock().unwrap(),
            &[b"first".to_vec(), b"".to_vec(), b"second".to_vec()]
        );
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn decode_rejects_oversized_length_prefix() {
        // A non-conforming peer can announce any length it likes; the cap
        // must hold on the receive side too.
        let (mut decoder, messages, _) = collecting_decoder(None);
        let mut header = BytesMut::new();
        header.put_u8(0);
        header.put_u32(DEFAULT_MAX_MESSAGE_SIZE as u32 + 1);
        let status = decoder.decode(&header).unwrap_err();
        assert_eq!(status.code(), RpcCode::ResourceExhausted);
        assert!(status.description().unwrap().contains("exceeds maximum size"));
        assert!(messages.lock().unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_reserved_bits() {
        let (mut decoder, _, _) = collecting_decoder(None);
        let status = decoder.decode(b"\x02\x00\x00\x00\x00").unwrap_err();
        assert_eq!(status.code(), RpcCode::Internal);
        assert!(status.description().unwrap().contains("reserved bits"));
    }

    #[test]
    fn round_trip_every_codec() {
        let payloads: [&[u8]; 3] = [b"", b"payload", &[7u8; 100_000]];
        let codecs: [(Arc<dyn Compressor>, Arc<dyn Decompressor>); 3] = [
            (Arc::new(Identity), Arc::new(Identity)),
            (Arc::new(Gzip), Arc::new(Gzip)),
            (Arc::new(Bzip2), Arc::new(Bzip2)),
        ];
        for (compressor, decompressor) in codecs {
            for payload in payloads {
                for flag in [0u8, 1] {
                    let encoder = TriEncoder::new(Some(compressor.clone()));
                    let frame = encoder.encode(payload, flag).unwrap();
                    let (mut decoder, messages, _) =
                        collecting_decoder(Some(decompressor.clone()));
                    decoder.decode(&frame).unwrap();
                    assert_eq!(&*messages.lock().unwrap(), &[payload.to_vec()]);
                }
            }
        }
    }

    #[test]
    fn close_without_pending_bytes_reports_once() {
        let (mut decoder, _, closed) = collecting_decoder(None);
        decoder.close().unwrap();
        decoder.close().unwrap();
        assert!(*closed.lock().unwrap());
    }
}
