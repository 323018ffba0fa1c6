//! The client: connection ownership, the invoker, and the per-shape
//! callables.
//!
//! A [`Client`] owns its runtime, its connection, and its stream
//! multiplexer exclusively. The public surface is synchronous: callables
//! block the calling thread (unary) or hand back lazy streams, while all
//! I/O runs on the internal runtime. Do not call into it from inside
//! another async runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

use crate::compression::{CompressionRegistry, IDENTITY};
use crate::error::{Result, RpcError};
use crate::http2::connection::{self, ConnectionHandle};
use crate::http2::multiplexer::StreamMultiplexer;
use crate::invocation::{DeserializeFn, MethodDescriptor, RpcInvocation, RpcType, SerializeFn};
use crate::status::{RpcCode, RpcStatus};
use crate::triple::call::client::{
    FutureListenerAdapter, StreamListenerAdapter, TripleClientCall,
};
use crate::triple::metadata::RequestMetadata;
use crate::triple::streams::{ReadStream, ReadWriteStream, WriteSink, WriteStream};
use crate::triple::{header_name, header_value};

/// Configures and connects a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    address: String,
    service: String,
    scheme: String,
    application: Option<String>,
    group: Option<String>,
    version: Option<String>,
    compression: String,
    timeout: Option<Duration>,
}

impl ClientBuilder {
    /// Target `host:port` and the service name used on `:path`.
    pub fn new(address: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            service: service.into(),
            scheme: header_value::HTTP.to_owned(),
            application: None,
            group: None,
            version: None,
            compression: IDENTITY.to_owned(),
            timeout: None,
        }
    }

    /// Consumer application name, sent as `tri-consumer-appname`.
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// Service group, sent as `tri-service-group`.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Service version, sent as `tri-service-version` unless `1.0.0`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Compress request messages with the named encoding.
    pub fn compression(mut self, encoding: impl Into<String>) -> Self {
        self.compression = encoding.into();
        self
    }

    /// Ask the server to honor this call timeout. Transmitted as
    /// `grpc-timeout`; no local timer is armed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connect and return the client.
    pub fn connect(self) -> Result<Client> {
        self.connect_with_registry(CompressionRegistry::new())
    }

    /// Connect with a custom compression registry.
    pub fn connect_with_registry(self, registry: CompressionRegistry) -> Result<Client> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("trirpc-client")
            .enable_all()
            .build()
            .map_err(|err| RpcError::new(RpcCode::Internal, err.to_string()))?;

        let multiplexer = StreamMultiplexer::client();
        let socket = runtime
            .block_on(TcpStream::connect(&self.address))
            .map_err(|err| {
                RpcError::new(
                    RpcCode::Unavailable,
                    format!("failed to connect to {}: {err}", self.address),
                )
            })?;
        let conn = connection::spawn(socket, multiplexer.clone(), true, runtime.handle().clone());
        tracing::debug!(address = %self.address, "connected");

        Ok(Client {
            invoker: Arc::new(TripleInvoker {
                multiplexer,
                conn,
                registry: Arc::new(registry),
                config: self,
            }),
            _runtime: Arc::new(runtime),
        })
    }
}

/// A connected Triple client for one service.
#[derive(Debug)]
pub struct Client {
    invoker: Arc<TripleInvoker>,
    _runtime: Arc<Runtime>,
}

impl Client {
    /// Connect with default options.
    pub fn connect(address: impl Into<String>, service: impl Into<String>) -> Result<Self> {
        ClientBuilder::new(address, service).connect()
    }

    /// Start configuring a client.
    pub fn builder(address: impl Into<String>, service: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(address, service)
    }

    /// Whether the connection is still up.
    pub fn is_available(&self) -> bool {
        !self.invoker.conn.is_closed()
    }

    /// Tear the connection down. In-flight calls fail with UNAVAILABLE.
    pub fn close(&self) {
        self.invoker.conn.close();
    }

    /// A unary callable for `method_name`.
    pub fn unary<Req, Resp>(
        &self,
        method_name: impl Into<String>,
        request_serializer: SerializeFn<Req>,
        response_deserializer: DeserializeFn<Resp>,
    ) -> UnaryCallable<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        UnaryCallable {
            invoker: self.invoker.clone(),
            descriptor: MethodDescriptor::new(
                method_name,
                RpcType::UNARY,
                request_serializer,
                response_deserializer,
            ),
        }
    }

    /// A client-streaming callable for `method_name`.
    pub fn client_stream<Req, Resp>(
        &self,
        method_name: impl Into<String>,
        request_serializer: SerializeFn<Req>,
        response_deserializer: DeserializeFn<Resp>,
    ) -> ClientStreamCallable<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        ClientStreamCallable {
            invoker: self.invoker.clone(),
            descriptor: MethodDescriptor::new(
                method_name,
                RpcType::CLIENT_STREAM,
                request_serializer,
                response_deserializer,
            ),
        }
    }

    /// A server-streaming callable for `method_name`.
    pub fn server_stream<Req, Resp>(
        &self,
        method_name: impl Into<String>,
        request_serializer: SerializeFn<Req>,
        response_deserializer: DeserializeFn<Resp>,
    ) -> ServerStreamCallable<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        ServerStreamCallable {
            invoker: self.invoker.clone(),
            descriptor: MethodDescriptor::new(
                method_name,
                RpcType::SERVER_STREAM,
                request_serializer,
                response_deserializer,
            ),
        }
    }

    /// A bidirectional-streaming callable for `method_name`.
    pub fn bi_stream<Req, Resp>(
        &self,
        method_name: impl Into<String>,
        request_serializer: SerializeFn<Req>,
        response_deserializer: DeserializeFn<Resp>,
    ) -> BiStreamCallable<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        BiStreamCallable {
            invoker: self.invoker.clone(),
            descriptor: MethodDescriptor::new(
                method_name,
                RpcType::BI_STREAM,
                request_serializer,
                response_deserializer,
            ),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.invoker.conn.close();
    }
}

/// Owns the connection and opens calls on it.
struct TripleInvoker {
    multiplexer: Arc<StreamMultiplexer>,
    conn: ConnectionHandle,
    registry: Arc<CompressionRegistry>,
    config: ClientBuilder,
}

impl TripleInvoker {
    fn create_metadata(&self, invocation: &RpcInvocation) -> Result<RequestMetadata> {
        // An unknown compressor fails the call before any stream work.
        let compressor = self
            .registry
            .compressor(&self.config.compression)
            .map_err(|err| RpcStatus::from(err).to_error())?;

        let mut metadata = RequestMetadata {
            scheme: self.config.scheme.clone(),
            address: self.config.address.clone(),
            service: invocation.service_name().to_owned(),
            method: invocation.method_name().to_owned(),
            group: self.config.group.clone(),
            version: self.config.version.clone(),
            application: self.config.application.clone(),
            timeout: self.config.timeout.map(encode_grpc_timeout),
            accept_encoding: None,
            compressor,
            attachments: invocation.attachments().clone(),
        };
        metadata
            .attachments
            .entry(header_name::TE.to_owned())
            .or_insert_with(|| header_value::TRAILERS.to_owned());
        Ok(metadata)
    }

    fn start_call<Req, Resp>(
        &self,
        descriptor: &MethodDescriptor<Req, Resp>,
        listener: Box<dyn crate::triple::call::client::ClientCallListener<Resp>>,
    ) -> Result<Arc<TripleClientCall<Req, Resp>>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        if self.conn.is_closed() {
            return Err(RpcError::new(
                RpcCode::Unavailable,
                "the client is not connected to the server",
            ));
        }
        let invocation =
            RpcInvocation::new(self.config.service.clone(), descriptor.method_name());
        let metadata = self.create_metadata(&invocation)?;
        TripleClientCall::start(
            &self.multiplexer,
            self.registry.clone(),
            metadata,
            listener,
            descriptor.request_serializer(),
            descriptor.response_deserializer(),
        )
    }
}

impl std::fmt::Debug for TripleInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleInvoker")
            .field("address", &self.config.address)
            .field("service", &self.config.service)
            .finish()
    }
}

/// gRPC wire encoding of a timeout value.
fn encode_grpc_timeout(timeout: Duration) -> String {
    format!("{}m", timeout.as_millis().max(1))
}

/// Performs unary calls.
pub struct UnaryCallable<Req, Resp> {
    invoker: Arc<TripleInvoker>,
    descriptor: MethodDescriptor<Req, Resp>,
}

impl<Req, Resp> UnaryCallable<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Perform the call, blocking until the response or failure.
    pub fn call(&self, request: Req) -> Result<Resp> {
        let (tx, rx) = oneshot::channel();
        let call = self
            .invoker
            .start_call(&self.descriptor, Box::new(FutureListenerAdapter::new(tx)))?;
        call.send_message(Some(&request), true)?;
        rx.blocking_recv()
            .map_err(|_| RpcError::new(RpcCode::Unavailable, "call dropped before completion"))?
    }
}

/// Performs server-streaming calls.
pub struct ServerStreamCallable<Req, Resp> {
    invoker: Arc<TripleInvoker>,
    descriptor: MethodDescriptor<Req, Resp>,
}

impl<Req, Resp> ServerStreamCallable<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Send the single request and return the lazy response stream.
    pub fn call(&self, request: Req) -> Result<ReadStream<Resp>> {
        let reads = ReadStream::new();
        let call = self.invoker.start_call(
            &self.descriptor,
            Box::new(StreamListenerAdapter::new(reads.clone())),
        )?;
        call.send_message(Some(&request), true)?;
        Ok(reads)
    }
}

/// Performs client-streaming calls.
pub struct ClientStreamCallable<Req, Resp> {
    invoker: Arc<TripleInvoker>,
    descriptor: MethodDescriptor<Req, Resp>,
}

impl<Req, Resp> ClientStreamCallable<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Open the call; write requests, then `done_writing()` and read the
    /// single response.
    pub fn call(&self) -> Result<ReadWriteStream<Req, Resp>> {
        open_streaming_call(&self.invoker, &self.descriptor)
    }
}

/// Performs bidirectional-streaming calls.
pub struct BiStreamCallable<Req, Resp> {
    invoker: Arc<TripleInvoker>,
    descriptor: MethodDescriptor<Req, Resp>,
}

impl<Req, Resp> BiStreamCallable<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Open the call; both halves are live until `done_writing()` and EOF.
    pub fn call(&self) -> Result<ReadWriteStream<Req, Resp>> {
        open_streaming_call(&self.invoker, &self.descriptor)
    }
}

fn open_streaming_call<Req, Resp>(
    invoker: &Arc<TripleInvoker>,
    descriptor: &MethodDescriptor<Req, Resp>,
) -> Result<ReadWriteStream<Req, Resp>>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let reads = ReadStream::new();
    let call = invoker.start_call(
        descriptor,
        Box::new(StreamListenerAdapter::new(reads.clone())),
    )?;
    let write = WriteStream::new(call as Arc<dyn WriteSink<Req>>);
    Ok(ReadWriteStream::new(write, reads))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_timeout_encoding() {
        assert_eq!(encode_grpc_timeout(Duration::from_secs(3)), "3000m");
        assert_eq!(encode_grpc_timeout(Duration::from_micros(5)), "1m");
    }
}
