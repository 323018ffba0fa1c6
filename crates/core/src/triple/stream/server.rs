//! Inbound half of a server call: request admission and the response
//! stream.
//!
//! [`ServerTransportListener`] validates every incoming request header block
//! (method, content type, path, route, encoding) before any call state is
//! created. Failures before a call exists answer with a plain-text HTTP
//! error or a gRPC trailers-only response; once a call is admitted, request
//! payloads flow through the message decoder into the method runner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http::StatusCode;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::codec::{TriDecoder, TriDecoderListener, TriEncoder};
use crate::compression::{CompressionRegistry, Decompressor, IDENTITY};
use crate::error::Result;
use crate::handler::ServiceRouter;
use crate::http2::frame::Http2ErrorCode;
use crate::http2::headers::Http2Headers;
use crate::http2::stream::{Http2Stream, StreamListener};
use crate::status::{RpcCode, RpcStatus};
use crate::triple::call::server::{InboundMessageSink, TripleServerCall};
use crate::triple::{header_name, header_value};

/// Response side of one inbound RPC, at the byte level.
pub(crate) struct TripleServerStream {
    stream: Arc<Http2Stream>,
    encoder: Mutex<TriEncoder>,
    registry: Arc<CompressionRegistry>,
    headers_sent: AtomicBool,
    trailers_sent: AtomicBool,
    rst: AtomicBool,
}

impl TripleServerStream {
    pub(crate) fn new(stream: Arc<Http2Stream>, registry: Arc<CompressionRegistry>) -> Self {
        Self {
            stream,
            encoder: Mutex::new(TriEncoder::new(None)),
            registry,
            headers_sent: AtomicBool::new(false),
            trailers_sent: AtomicBool::new(false),
            rst: AtomicBool::new(false),
        }
    }

    /// Emit the `200 OK` response headers once.
    pub(crate) fn send_response_headers(&self) -> Result<()> {
        if self.headers_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut headers = Http2Headers::new();
        headers.set_status(StatusCode::OK.as_u16());
        headers.add(
            header_name::CONTENT_TYPE,
            header_value::APPLICATION_GRPC_PROTO,
        );
        if let Some(compressor) = self.encoder.lock().compressor() {
            if compressor.message_encoding() != IDENTITY {
                headers.add(header_name::GRPC_ENCODING, compressor.message_encoding());
            }
        }
        self.stream.send_headers(headers, false)?;
        Ok(())
    }

    /// Encode and send one response payload.
    pub(crate) fn send_message(&self, payload: &[u8]) -> Result<()> {
        let encoded = {
            let encoder = self.encoder.lock();
            let flag = u8::from(
                encoder
                    .compressor()
                    .is_some_and(|c| c.message_encoding() != IDENTITY),
            );
            encoder.encode(payload, flag).map_err(|status| status.to_error())?
        };
        self.stream.send_data(encoded, false, false)?;
        Ok(())
    }

    /// Send the trailers frame, folding the response headers in when none
    /// were sent (trailers-only response).
    pub(crate) fn complete(
        &self,
        status: RpcStatus,
        attachments: IndexMap<String, String>,
    ) -> Result<()> {
        if self.trailers_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let headers_were_sent = self.headers_sent.swap(true, Ordering::AcqRel);

        let mut trailers = Http2Headers::new();
        if !headers_were_sent {
            trailers.set_status(StatusCode::OK.as_u16());
            trailers.add(
                header_name::CONTENT_TYPE,
                header_value::APPLICATION_GRPC_PROTO,
            );
        }
        for (key, value) in attachments {
            trailers.add(key, value);
        }
        trailers.add(header_name::GRPC_STATUS, status.code().code().to_string());
        if status.code() != RpcCode::Ok {
            trailers.add(header_name::GRPC_MESSAGE, status.message_for_trailers());
        }

        if headers_were_sent {
            self.stream.send_trailers(trailers, false)?;
        } else {
            self.stream.send_headers(trailers, true)?;
        }
        Ok(())
    }

    /// Reset the stream; idempotent.
    pub(crate) fn cancel_by_local(&self, status: &RpcStatus) {
        if self.rst.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(stream_id = self.stream.id(), %status, "cancelling server stream");
        self.stream.send_reset(Http2ErrorCode::CANCEL);
    }

    /// Select the response compressor by its encoding name. Unknown names
    /// cancel the stream.
    pub(crate) fn set_compression(&self, encoding: &str) {
        if encoding == IDENTITY {
            return;
        }
        match self.registry.compressor(encoding) {
            Ok(compressor) => self.encoder.lock().set_compressor(compressor),
            Err(err) => {
                tracing::warn!("unsupported compression: {encoding}");
                self.cancel_by_local(
                    &RpcStatus::new(RpcCode::Internal)
                        .with_description(format!("unsupported compression: {err}")),
                );
            }
        }
    }
}

impl std::fmt::Debug for TripleServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleServerStream")
            .field("stream_id", &self.stream.id())
            .field("headers_sent", &self.headers_sent.load(Ordering::Relaxed))
            .finish()
    }
}

type SharedSink = Arc<Mutex<Box<dyn InboundMessageSink>>>;

struct ActiveCall {
    decoder: TriDecoder,
    sink: SharedSink,
    call: Arc<TripleServerCall>,
}

/// Stream listener for the request side of one server stream.
pub struct ServerTransportListener {
    router: Arc<ServiceRouter>,
    registry: Arc<CompressionRegistry>,
    runtime: Handle,
    response_compression: Option<String>,
    stream: Weak<Http2Stream>,
    active: Option<ActiveCall>,
}

impl ServerTransportListener {
    /// Create a listener; one is built per inbound stream by the
    /// multiplexer's listener factory.
    pub fn new(
        router: Arc<ServiceRouter>,
        registry: Arc<CompressionRegistry>,
        runtime: Handle,
        response_compression: Option<String>,
    ) -> Self {
        Self {
            router,
            registry,
            runtime,
            response_compression,
            stream: Weak::new(),
            active: None,
        }
    }

    /// Error before any call state exists: plain HTTP with gRPC headers.
    fn respond_plain_text_error(&self, http_status: StatusCode, status: &RpcStatus) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let mut headers = Http2Headers::new();
        headers.set_status(http_status.as_u16());
        headers.add(header_name::GRPC_STATUS, status.code().code().to_string());
        headers.add(header_name::GRPC_MESSAGE, status.message_for_trailers());
        headers.add(header_name::CONTENT_TYPE, header_value::TEXT_PLAIN_UTF8);
        if let Err(err) = stream.send_headers(headers, true) {
            tracing::debug!("failed to send error response: {err}");
        }
    }

    /// Error after the request was recognizably gRPC: trailers-only
    /// response.
    fn respond_error(&self, status: &RpcStatus) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };
        let mut trailers = Http2Headers::new();
        trailers.set_status(StatusCode::OK.as_u16());
        trailers.add(header_name::GRPC_STATUS, status.code().code().to_string());
        trailers.add(header_name::GRPC_MESSAGE, status.message_for_trailers());
        trailers.add(
            header_name::CONTENT_TYPE,
            header_value::APPLICATION_GRPC_PROTO,
        );
        if let Err(err) = stream.send_headers(trailers, true) {
            tracing::debug!("failed to send error trailers: {err}");
        }
    }

    fn admit(&mut self, headers: &Http2Headers, end_stream: bool) -> Option<ActiveCall> {
        let method = headers.method().unwrap_or("");
        if method != http::Method::POST.as_str() {
            self.respond_plain_text_error(
                StatusCode::METHOD_NOT_ALLOWED,
                &RpcStatus::new(RpcCode::Internal)
                    .with_description(format!("method {method} is not supported")),
            );
            return None;
        }

        let content_type = headers.get(header_name::CONTENT_TYPE).unwrap_or("");
        if !content_type.starts_with(header_value::APPLICATION_GRPC) {
            let description = if content_type.is_empty() {
                "content-type is missing from the request".to_owned()
            } else {
                format!("content-type {content_type} is not supported")
            };
            self.respond_plain_text_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                &RpcStatus::new(RpcCode::Unimplemented).with_description(description),
            );
            return None;
        }

        let path = headers.path().unwrap_or("");
        if path.is_empty() || !path.starts_with('/') {
            self.respond_plain_text_error(
                StatusCode::NOT_FOUND,
                &RpcStatus::new(RpcCode::Unimplemented)
                    .with_description(format!("expected path of the form /service/method: {path}")),
            );
            return None;
        }

        let mut parts = path[1..].split('/');
        let (service_name, method_name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => {
                (service, method)
            }
            _ => {
                self.respond_error(
                    &RpcStatus::new(RpcCode::Unimplemented)
                        .with_description(format!("bad path format: {path}")),
                );
                return None;
            }
        };

        let handler = match self.router.resolve(service_name, method_name) {
            Ok(handler) => handler,
            Err(status) => {
                self.respond_error(&status);
                return None;
            }
        };

        if end_stream {
            // A request without a body is not a call; nothing to run.
            return None;
        }

        let mut decompressor: Option<Arc<dyn Decompressor>> = None;
        if let Some(encoding) = headers.get(header_name::GRPC_ENCODING) {
            if encoding != IDENTITY {
                match self.registry.decompressor(encoding) {
                    Ok(found) => decompressor = Some(found),
                    Err(_) => {
                        self.respond_error(
                            &RpcStatus::new(RpcCode::Unimplemented).with_description(format!(
                                "grpc-encoding '{encoding}' is not supported"
                            )),
                        );
                        return None;
                    }
                }
            }
        }

        let stream = self.stream.upgrade()?;
        let call = Arc::new(TripleServerCall::new(TripleServerStream::new(
            stream,
            self.registry.clone(),
        )));
        if let Some(encoding) = &self.response_compression {
            call.set_compression(encoding);
        }
        let sink: SharedSink = Arc::new(Mutex::new(
            handler.executor().launch(call.clone(), &self.runtime),
        ));
        let decoder = TriDecoder::new(
            Box::new(ServerDecoderBridge { sink: sink.clone() }),
            decompressor,
        );

        Some(ActiveCall {
            decoder,
            sink,
            call,
        })
    }

    /// Framing failure on the request body: reset and unblock the runner.
    fn fail_active(&mut self, status: RpcStatus) {
        if let Some(active) = self.active.take() {
            active.call.cancel(&status);
            active.sink.lock().on_cancel(status);
        }
    }
}

impl StreamListener for ServerTransportListener {
    fn bind(&mut self, stream: Weak<Http2Stream>) {
        self.stream = stream;
    }

    fn on_headers(&mut self, headers: Http2Headers, end_stream: bool) {
        self.active = self.admit(&headers, end_stream);
    }

    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Err(status) = active.decoder.decode(&data) {
            self.fail_active(status);
            return;
        }
        if end_stream {
            if let Err(status) = self
                .active
                .as_mut()
                .expect("active call checked above")
                .decoder
                .close()
            {
                self.fail_active(status);
            }
        }
    }

    fn on_trailers(&mut self, _headers: Http2Headers) {
        tracing::warn!("ignoring unexpected trailers from client");
    }

    fn on_reset(&mut self, error_code: Http2ErrorCode) {
        if let Some(active) = self.active.take() {
            active.sink.lock().on_cancel(
                RpcStatus::new(RpcCode::Cancelled)
                    .with_description(format!("cancelled by client, error code: {error_code}")),
            );
        }
    }

    fn on_terminated(&mut self) {
        if let Some(active) = self.active.take() {
            active.sink.lock().on_cancel(
                RpcStatus::new(RpcCode::Unavailable).with_description("connection lost"),
            );
        }
    }
}

impl std::fmt::Debug for ServerTransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransportListener")
            .field("active", &self.active.is_some())
            .finish()
    }
}

/// Decoder callbacks feeding the method runner's sink.
struct ServerDecoderBridge {
    sink: SharedSink,
}

impl TriDecoderListener for ServerDecoderBridge {
    fn on_message(&mut self, message: Vec<u8>) {
        self.sink.lock().on_message(message);
    }

    fn on_close(&mut self) {
        self.sink.lock().on_complete();
    }
}
