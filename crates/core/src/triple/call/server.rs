//! The server call state machine and method runner.
//!
//! A [`TripleServerCall`] owns the response side of one inbound RPC. The
//! user's handler body runs on the blocking worker pool, reading requests
//! from a bounded stream and writing responses back through the call; any
//! error it returns is converted to `INTERNAL` trailers as long as the
//! stream is still writable.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::runtime::Handle;

use crate::error::{BoxedError, Result};
use crate::invocation::{DeserializeFn, RpcType, SerializeFn};
use crate::status::{RpcCode, RpcStatus};
use crate::triple::stream::server::TripleServerStream;
use crate::triple::streams::{ReadOutcome, ReadStream, ReadWriteStream, WriteSink, WriteStream};

/// Serialization-level view of one server call.
pub(crate) struct TripleServerCall {
    stream: TripleServerStream,
}

impl TripleServerCall {
    pub(crate) fn new(stream: TripleServerStream) -> Self {
        Self { stream }
    }

    /// Send one response payload, emitting the response HEADERS first when
    /// necessary.
    pub(crate) fn send_message(&self, payload: &[u8]) -> Result<()> {
        self.stream.send_response_headers()?;
        self.stream.send_message(payload)
    }

    /// Finish the call with trailers.
    pub(crate) fn complete(
        &self,
        status: RpcStatus,
        attachments: IndexMap<String, String>,
    ) -> Result<()> {
        self.stream.complete(status, attachments)
    }

    /// Reset the stream; idempotent.
    pub(crate) fn cancel(&self, status: &RpcStatus) {
        self.stream.cancel_by_local(status);
    }

    /// Select the response compressor by encoding name.
    pub(crate) fn set_compression(&self, encoding: &str) {
        self.stream.set_compression(encoding);
    }
}

/// Inbound message payloads for one server call, fed by the transport
/// listener on the dispatch thread.
pub(crate) trait InboundMessageSink: Send {
    fn on_message(&mut self, payload: Vec<u8>);
    fn on_complete(&mut self);
    fn on_cancel(&mut self, status: RpcStatus);
}

/// A type-erased, registered method implementation.
pub(crate) trait ServerMethod: Send + Sync {
    fn rpc_type(&self) -> RpcType;

    /// Start the handler body on the worker pool and return the sink that
    /// will feed it request payloads.
    fn launch(&self, call: Arc<TripleServerCall>, runtime: &Handle) -> Box<dyn InboundMessageSink>;
}

/// The four handler shapes, dispatched by RPC type.
pub(crate) enum MethodBody<Req, Resp> {
    Unary(Box<dyn Fn(Req) -> std::result::Result<Resp, BoxedError> + Send + Sync>),
    ClientStream(
        Box<
            dyn Fn(&ReadWriteStream<Resp, Req>) -> std::result::Result<Resp, BoxedError>
                + Send
                + Sync,
        >,
    ),
    ServerStream(Box<dyn Fn(Req) -> std::result::Result<Vec<Resp>, BoxedError> + Send + Sync>),
    BiStream(
        Box<
            dyn Fn(&ReadWriteStream<Resp, Req>) -> std::result::Result<Vec<Resp>, BoxedError>
                + Send
                + Sync,
        >,
    ),
}

impl<Req, Resp> MethodBody<Req, Resp> {
    fn rpc_type(&self) -> RpcType {
        match self {
            Self::Unary(_) => RpcType::UNARY,
            Self::ClientStream(_) => RpcType::CLIENT_STREAM,
            Self::ServerStream(_) => RpcType::SERVER_STREAM,
            Self::BiStream(_) => RpcType::BI_STREAM,
        }
    }
}

/// Generic method implementation carrying its codecs; erased behind
/// [`ServerMethod`] for the router.
pub(crate) struct TypedMethod<Req, Resp> {
    body: Arc<MethodBody<Req, Resp>>,
    request_deserializer: DeserializeFn<Req>,
    response_serializer: SerializeFn<Resp>,
}

impl<Req, Resp> TypedMethod<Req, Resp> {
    pub(crate) fn new(
        body: MethodBody<Req, Resp>,
        request_deserializer: DeserializeFn<Req>,
        response_serializer: SerializeFn<Resp>,
    ) -> Self {
        Self {
            body: Arc::new(body),
            request_deserializer,
            response_serializer,
        }
    }
}

impl<Req, Resp> ServerMethod for TypedMethod<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn rpc_type(&self) -> RpcType {
        self.body.rpc_type()
    }

    fn launch(&self, call: Arc<TripleServerCall>, runtime: &Handle) -> Box<dyn InboundMessageSink> {
        let reads: ReadStream<Req> = ReadStream::new();
        let write = WriteStream::new(Arc::new(ServerWriteSink {
            call: call.clone(),
            serializer: self.response_serializer.clone(),
        }) as Arc<dyn WriteSink<Resp>>);
        let rw = ReadWriteStream::new(write, reads.clone());

        let body = self.body.clone();
        runtime.spawn_blocking(move || run_method(&body, &rw));

        Box::new(TypedInbound {
            deserializer: self.request_deserializer.clone(),
            reads,
            call,
        })
    }
}

fn run_method<Req, Resp>(body: &MethodBody<Req, Resp>, rw: &ReadWriteStream<Resp, Req>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let outcome: std::result::Result<(), BoxedError> = (|| {
        match body {
            MethodBody::Unary(f) => {
                let request = read_request(rw)?;
                let response = f(request)?;
                rw.write(response)?;
            }
            MethodBody::ServerStream(f) => {
                let request = read_request(rw)?;
                for response in f(request)? {
                    rw.write(response)?;
                }
            }
            MethodBody::ClientStream(f) => {
                let response = f(rw)?;
                rw.write(response)?;
            }
            MethodBody::BiStream(f) => {
                for response in f(rw)? {
                    rw.write(response)?;
                }
            }
        }
        rw.done_writing()?;
        Ok(())
    })();

    if let Err(err) = outcome {
        handle_invoke_error(rw, &err);
    }
}

fn read_request<Req, Resp>(
    rw: &ReadWriteStream<Resp, Req>,
) -> std::result::Result<Req, BoxedError>
where
    Req: Send + 'static,
{
    match rw.read() {
        Ok(ReadOutcome::Message(message)) => Ok(message),
        Ok(ReadOutcome::Eof) | Ok(ReadOutcome::TimedOut) => Err("missing request message".into()),
        Err(err) => Err(err.into()),
    }
}

fn handle_invoke_error<Req, Resp>(rw: &ReadWriteStream<Resp, Req>, err: &BoxedError)
where
    Req: Send + 'static,
{
    if !rw.can_write_more() {
        return;
    }
    tracing::error!("invoke method failed: {err}");
    let status = RpcStatus::new(RpcCode::Internal)
        .with_description(format!("Invoke method failed: {err}"));
    if let Err(err) = rw.done_writing_with(status) {
        tracing::debug!("failed to send error trailers: {err}");
    }
}

/// Serializes responses into the call.
struct ServerWriteSink<Resp> {
    call: Arc<TripleServerCall>,
    serializer: SerializeFn<Resp>,
}

impl<Resp> WriteSink<Resp> for ServerWriteSink<Resp>
where
    Resp: Send + 'static,
{
    fn write_message(&self, message: Resp) -> Result<()> {
        let data = (self.serializer)(&message).map_err(|err| {
            tracing::error!("failed to serialize response: {err}");
            let status = RpcStatus::new(RpcCode::Internal)
                .with_description("failed to serialize response")
                .with_cause(err);
            let rpc_err = status.to_error();
            self.call.cancel(&status);
            rpc_err
        })?;
        self.call.send_message(&data)
    }

    fn finish(&self, status: Option<RpcStatus>) -> Result<()> {
        self.call.complete(
            status.unwrap_or_else(|| RpcStatus::new(RpcCode::Ok)),
            IndexMap::new(),
        )
    }

    fn cancel(&self, reason: &str) {
        self.call.cancel(
            &RpcStatus::new(RpcCode::Cancelled)
                .with_description(format!("call cancelled by handler: {reason}")),
        );
    }
}

/// Feeds deserialized requests into the handler's read stream.
struct TypedInbound<Req> {
    deserializer: DeserializeFn<Req>,
    reads: ReadStream<Req>,
    call: Arc<TripleServerCall>,
}

impl<Req> InboundMessageSink for TypedInbound<Req>
where
    Req: Send + 'static,
{
    fn on_message(&mut self, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        match (self.deserializer)(&payload) {
            Ok(message) => self.reads.put(message),
            Err(err) => {
                tracing::error!("failed to deserialize request: {err}");
                let status = RpcStatus::new(RpcCode::Internal)
                    .with_description("failed to deserialize request")
                    .with_cause(err);
                let rpc_err = status.to_error();
                self.call.cancel(&status);
                self.reads.put_error(rpc_err);
            }
        }
    }

    fn on_complete(&mut self) {
        self.reads.put_eof();
    }

    fn on_cancel(&mut self, status: RpcStatus) {
        self.reads.put_error(status.to_error());
    }
}
