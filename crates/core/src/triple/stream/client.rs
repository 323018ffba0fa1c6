//! Inbound half of a client call.
//!
//! [`ClientTransportListener`] validates the response header block, selects
//! a decompressor from `grpc-encoding`, feeds DATA through the message
//! decoder, and turns trailers into the terminal status. Error responses
//! that die before gRPC framing (bad HTTP status, wrong content type) are
//! collected into a transport status and delivered once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::StatusCode;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::codec::{TriDecoder, TriDecoderListener};
use crate::compression::{CompressionRegistry, IDENTITY};
use crate::http2::frame::Http2ErrorCode;
use crate::http2::headers::Http2Headers;
use crate::http2::stream::{Http2Stream, StreamListener};
use crate::invocation::DeserializeFn;
use crate::status::{MAX_DESCRIPTION_LEN, RpcCode, RpcStatus};
use crate::triple::call::client::{SharedListener, close_listener};
use crate::triple::{header_name, header_value};

/// Status and trailers staged for the decoder's close callback.
#[derive(Default)]
struct CloseState {
    status: Option<RpcStatus>,
    trailers: IndexMap<String, String>,
}

type SharedCloseState = Arc<Mutex<CloseState>>;

/// Stream listener for the response side of one client call.
pub(crate) struct ClientTransportListener<Resp> {
    deserializer: DeserializeFn<Resp>,
    listener: SharedListener<Resp>,
    done: Arc<AtomicBool>,
    registry: Arc<CompressionRegistry>,
    stream: Weak<Http2Stream>,
    decoder: Option<TriDecoder>,
    close_state: SharedCloseState,
    rpc_status: Option<RpcStatus>,
    headers_received: bool,
}

impl<Resp> ClientTransportListener<Resp>
where
    Resp: Send + 'static,
{
    pub(crate) fn new(
        deserializer: DeserializeFn<Resp>,
        listener: SharedListener<Resp>,
        done: Arc<AtomicBool>,
        registry: Arc<CompressionRegistry>,
    ) -> Self {
        Self {
            deserializer,
            listener,
            done,
            registry,
            stream: Weak::new(),
            decoder: None,
            close_state: Arc::new(Mutex::new(CloseState::default())),
            rpc_status: None,
            headers_received: false,
        }
    }

    /// Record a transport-level failure found in the header block.
    fn validate_headers(&mut self, headers: &Http2Headers) {
        let status_code = match headers.status() {
            Some(raw) => match raw.parse::<u16>().ok().and_then(|c| StatusCode::from_u16(c).ok()) {
                Some(code) => code,
                None => {
                    self.rpc_status = Some(
                        RpcStatus::new(RpcCode::Internal)
                            .with_description(format!("invalid HTTP status code: {raw}")),
                    );
                    return;
                }
            },
            None => {
                self.rpc_status = Some(
                    RpcStatus::new(RpcCode::Internal)
                        .with_description("missing HTTP status code"),
                );
                return;
            }
        };

        if status_code != StatusCode::OK {
            self.rpc_status = Some(
                RpcStatus::from_http_code(status_code)
                    .with_description(format!("unexpected HTTP status: {status_code}")),
            );
            return;
        }

        let content_type = headers.get(header_name::CONTENT_TYPE).unwrap_or("");
        if !content_type.starts_with(header_value::APPLICATION_GRPC) {
            self.rpc_status = Some(
                RpcStatus::new(RpcCode::Internal)
                    .with_description(format!("invalid content-type: {content_type}")),
            );
        }
    }

    fn on_headers_received(&mut self, headers: &Http2Headers) {
        self.headers_received = true;
        self.validate_headers(headers);
        if self.rpc_status.is_some() {
            return;
        }

        let encoding = headers
            .get(header_name::GRPC_ENCODING)
            .unwrap_or(IDENTITY)
            .to_owned();
        let decompressor = if encoding == IDENTITY {
            None
        } else {
            match self.registry.decompressor(&encoding) {
                Ok(decompressor) => Some(decompressor),
                Err(_) => {
                    self.rpc_status = Some(
                        RpcStatus::new(RpcCode::Unimplemented)
                            .with_description(format!("unsupported message encoding '{encoding}'")),
                    );
                    return;
                }
            }
        };

        let bridge = ClientDecoderBridge {
            deserializer: self.deserializer.clone(),
            listener: self.listener.clone(),
            done: self.done.clone(),
            stream: self.stream.clone(),
            close_state: self.close_state.clone(),
        };
        self.decoder = Some(TriDecoder::new(Box::new(bridge), decompressor));
    }

    fn on_trailers_received(&mut self, trailers: Http2Headers) {
        if !self.headers_received && self.rpc_status.is_none() {
            // Trailers-only response: the block carries the HTTP status too.
            self.validate_headers(&trailers);
        }

        if let Some(status) = &mut self.rpc_status {
            // The call already failed at the transport level; keep whatever
            // detail the trailers add.
            if let Some(message) = trailers.get(header_name::GRPC_MESSAGE) {
                status.append_description(message);
            }
        } else {
            self.rpc_status = Some(status_from_trailers(&trailers, self.headers_received));
        }

        let trailer_map = trailers.to_map();
        match self.decoder.as_mut() {
            Some(decoder) => {
                {
                    let mut state = self.close_state.lock();
                    state.status = self.rpc_status.take();
                    state.trailers = trailer_map;
                }
                if let Err(status) = decoder.close() {
                    self.fail(status);
                }
            }
            None => {
                let status = self
                    .rpc_status
                    .take()
                    .unwrap_or_else(|| RpcStatus::new(RpcCode::Unknown));
                if let Some(stream) = self.stream.upgrade() {
                    if !stream.is_local_closed() {
                        stream.send_reset(Http2ErrorCode::NO_ERROR);
                    }
                }
                close_listener(&self.done, &self.listener, status, trailer_map);
            }
        }
    }

    /// Framing failure: reset the stream and surface the status.
    fn fail(&mut self, status: RpcStatus) {
        if let Some(stream) = self.stream.upgrade() {
            stream.send_reset(Http2ErrorCode::CANCEL);
        }
        close_listener(&self.done, &self.listener, status, IndexMap::new());
    }
}

impl<Resp> StreamListener for ClientTransportListener<Resp>
where
    Resp: Send + 'static,
{
    fn bind(&mut self, stream: Weak<Http2Stream>) {
        self.stream = stream;
    }

    fn on_headers(&mut self, headers: Http2Headers, end_stream: bool) {
        if end_stream {
            self.on_trailers_received(headers);
        } else {
            self.on_headers_received(&headers);
        }
    }

    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        if let Some(status) = self.rpc_status.as_mut() {
            // The call already failed; the body is diagnostic at best.
            status.append_description(&format!("data: {}", String::from_utf8_lossy(&data)));
            let overlong = status
                .description()
                .is_some_and(|d| d.len() >= MAX_DESCRIPTION_LEN);
            if overlong || end_stream {
                let status = self.rpc_status.take().expect("status checked above");
                if let Some(stream) = self.stream.upgrade() {
                    stream.send_reset(Http2ErrorCode::NO_ERROR);
                }
                close_listener(&self.done, &self.listener, status, IndexMap::new());
            }
            return;
        }

        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(status) = decoder.decode(&data) {
                self.fail(status);
            }
        }
    }

    fn on_trailers(&mut self, headers: Http2Headers) {
        self.on_trailers_received(headers);
    }

    fn on_reset(&mut self, error_code: Http2ErrorCode) {
        close_listener(
            &self.done,
            &self.listener,
            RpcStatus::new(RpcCode::Cancelled)
                .with_description(format!("cancelled by remote peer, error code: {error_code}")),
            IndexMap::new(),
        );
    }

    fn on_terminated(&mut self) {
        close_listener(
            &self.done,
            &self.listener,
            RpcStatus::new(RpcCode::Unavailable).with_description("connection lost"),
            IndexMap::new(),
        );
    }
}

fn status_from_trailers(trailers: &Http2Headers, headers_received: bool) -> RpcStatus {
    if let Some(code) = trailers
        .get(header_name::GRPC_STATUS)
        .and_then(|raw| raw.parse::<u32>().ok())
    {
        let mut status = RpcStatus::from_rpc_code(code);
        if let Some(message) = trailers.get(header_name::GRPC_MESSAGE) {
            if !message.is_empty() {
                status.append_description(message);
            }
        }
        return status;
    }

    if headers_received {
        return RpcStatus::new(RpcCode::Unknown).with_description("missing grpc-status");
    }

    let mut status = match trailers
        .status()
        .and_then(|raw| raw.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
    {
        Some(code) => RpcStatus::from_http_code(code),
        None => RpcStatus::new(RpcCode::Internal).with_description("missing HTTP status code"),
    };
    status.append_description("missing grpc-status, inferring from the HTTP status code");
    status
}

/// Decoder callbacks: deserialize each payload and hand the staged terminal
/// status over on close.
struct ClientDecoderBridge<Resp> {
    deserializer: DeserializeFn<Resp>,
    listener: SharedListener<Resp>,
    done: Arc<AtomicBool>,
    stream: Weak<Http2Stream>,
    close_state: SharedCloseState,
}

impl<Resp> TriDecoderListener for ClientDecoderBridge<Resp>
where
    Resp: Send + 'static,
{
    fn on_message(&mut self, message: Vec<u8>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match (self.deserializer)(&message) {
            Ok(message) => self.listener.lock().on_message(message),
            Err(err) => {
                tracing::error!("failed to deserialize message: {err}");
                if let Some(stream) = self.stream.upgrade() {
                    stream.send_reset(Http2ErrorCode::CANCEL);
                }
                close_listener(
                    &self.done,
                    &self.listener,
                    RpcStatus::new(RpcCode::Internal)
                        .with_description("failed to deserialize message")
                        .with_cause(err),
                    IndexMap::new(),
                );
            }
        }
    }

    fn on_close(&mut self) {
        let (status, trailers) = {
            let mut state = self.close_state.lock();
            (
                state
                    .status
                    .take()
                    .unwrap_or_else(|| RpcStatus::new(RpcCode::Unknown)),
                std::mem::take(&mut state.trailers),
            )
        };
        close_listener(&self.done, &self.listener, status, trailers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::raw_deserializer;
    use crate::triple::call::client::ClientCallListener;

    struct Recording {
        messages: Arc<Mutex<Vec<Vec<u8>>>>,
        closes: Arc<Mutex<Vec<(RpcCode, String)>>>,
    }

    impl ClientCallListener<Vec<u8>> for Recording {
        fn on_message(&mut self, message: Vec<u8>) {
            self.messages.lock().push(message);
        }

        fn on_close(&mut self, status: RpcStatus, _trailers: IndexMap<String, String>) {
            self.closes
                .lock()
                .push((status.code(), status.description().unwrap_or("").to_owned()));
        }
    }

    #[allow(clippy::type_complexity)]
    fn listener() -> (
        ClientTransportListener<Vec<u8>>,
        Arc<Mutex<Vec<Vec<u8>>>>,
        Arc<Mutex<Vec<(RpcCode, String)>>>,
    ) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(Vec::new()));
        let recording = Recording {
            messages: messages.clone(),
            closes: closes.clone(),
        };
        let transport = ClientTransportListener::new(
            raw_deserializer(),
            Arc::new(Mutex::new(Box::new(recording))),
            Arc::new(AtomicBool::new(false)),
            Arc::new(CompressionRegistry::new()),
        );
        (transport, messages, closes)
    }

    fn ok_headers() -> Http2Headers {
        let mut headers = Http2Headers::new();
        headers.set_status(200);
        headers.add("content-type", "application/grpc+proto");
        headers
    }

    #[test]
    fn full_response_cycle_delivers_message_and_ok() {
        let (mut transport, messages, closes) = listener();
        transport.on_headers(ok_headers(), false);

        let frame = crate::codec::TriEncoder::new(None).encode(b"hi", 0).unwrap();
        transport.on_data(frame, false);

        let mut trailers = Http2Headers::new();
        trailers.add("grpc-status", "0");
        transport.on_trailers(trailers);

        assert_eq!(&*messages.lock(), &[b"hi".to_vec()]);
        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, RpcCode::Ok);
    }

    #[test]
    fn bad_content_type_fails_with_internal() {
        let (mut transport, _, closes) = listener();
        let mut headers = Http2Headers::new();
        headers.set_status(200);
        headers.add("content-type", "text/html");
        transport.on_headers(headers, false);

        let mut trailers = Http2Headers::new();
        trailers.add("grpc-status", "0");
        transport.on_trailers(trailers);

        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, RpcCode::Internal);
        assert!(closes[0].1.contains("invalid content-type"));
    }

    #[test]
    fn http_error_maps_through_status_table() {
        let (mut transport, _, closes) = listener();
        let mut headers = Http2Headers::new();
        headers.set_status(503);
        headers.add("content-type", "application/grpc+proto");
        transport.on_headers(headers, true);

        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, RpcCode::Unavailable);
    }

    #[test]
    fn unknown_encoding_is_unimplemented() {
        let (mut transport, _, closes) = listener();
        let mut headers = ok_headers();
        headers.add("grpc-encoding", "snappy");
        transport.on_headers(headers, false);

        let mut trailers = Http2Headers::new();
        trailers.add("grpc-status", "0");
        transport.on_trailers(trailers);

        let closes = closes.lock();
        assert_eq!(closes[0].0, RpcCode::Unimplemented);
    }

    #[test]
    fn missing_grpc_status_is_unknown() {
        let (mut transport, _, closes) = listener();
        transport.on_headers(ok_headers(), false);
        transport.on_trailers(Http2Headers::new());

        let closes = closes.lock();
        assert_eq!(closes[0].0, RpcCode::Unknown);
        assert!(closes[0].1.contains("missing grpc-status"));
    }

    #[test]
    fn remote_reset_closes_with_cancelled_exactly_once() {
        let (mut transport, _, closes) = listener();
        transport.on_headers(ok_headers(), false);
        transport.on_reset(Http2ErrorCode::CANCEL);
        transport.on_reset(Http2ErrorCode::CANCEL);
        transport.on_terminated();

        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, RpcCode::Cancelled);
    }

    #[test]
    fn connection_loss_is_unavailable() {
        let (mut transport, _, closes) = listener();
        transport.on_terminated();
        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].0, RpcCode::Unavailable);
    }
}
