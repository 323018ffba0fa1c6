//! The client call state machine.
//!
//! [`TripleClientCall`] drives the outbound half of one RPC: it serializes
//! messages, runs them through the gRPC message encoder, and lazily emits
//! the request HEADERS on the first send. The inbound half lives in the
//! transport listener ([`super::super::stream::client`]); the two share the
//! user-facing listener and a `done` flag so the terminal event is delivered
//! exactly once whichever side closes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::TriEncoder;
use crate::compression::{CompressionRegistry, IDENTITY};
use crate::error::{Result, RpcError};
use crate::http2::frame::Http2ErrorCode;
use crate::http2::multiplexer::StreamMultiplexer;
use crate::http2::stream::Http2Stream;
use crate::invocation::{DeserializeFn, SerializeFn};
use crate::status::{RpcCode, RpcStatus};
use crate::triple::metadata::RequestMetadata;
use crate::triple::stream::client::ClientTransportListener;
use crate::triple::streams::{ReadStream, WriteSink};

/// Receives the response side of a client call.
pub(crate) trait ClientCallListener<Resp>: Send + 'static {
    /// A response message arrived.
    fn on_message(&mut self, message: Resp);

    /// The call finished. Delivered exactly once.
    fn on_close(&mut self, status: RpcStatus, trailers: IndexMap<String, String>);
}

pub(crate) type SharedListener<Resp> = Arc<Mutex<Box<dyn ClientCallListener<Resp>>>>;

/// Deliver the terminal event if nobody else has.
pub(crate) fn close_listener<Resp: 'static>(
    done: &AtomicBool,
    listener: &SharedListener<Resp>,
    status: RpcStatus,
    trailers: IndexMap<String, String>,
) {
    if !done.swap(true, Ordering::AcqRel) {
        listener.lock().on_close(status, trailers);
    }
}

/// Outbound half of one client RPC.
pub(crate) struct TripleClientCall<Req, Resp> {
    stream: Arc<Http2Stream>,
    encoder: TriEncoder,
    serializer: SerializeFn<Req>,
    compress: bool,
    metadata: Mutex<Option<RequestMetadata>>,
    headers_sent: AtomicBool,
    done: Arc<AtomicBool>,
    listener: SharedListener<Resp>,
}

impl<Req, Resp> TripleClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Open the call: create the transport listener and bind a new stream.
    /// HEADERS are not sent yet; they ride with the first message.
    pub(crate) fn start(
        multiplexer: &StreamMultiplexer,
        registry: Arc<CompressionRegistry>,
        metadata: RequestMetadata,
        listener: Box<dyn ClientCallListener<Resp>>,
        serializer: SerializeFn<Req>,
        deserializer: DeserializeFn<Resp>,
    ) -> Result<Arc<Self>> {
        let compressor = metadata.compressor.clone();
        let compress = compressor.message_encoding() != IDENTITY;
        let done = Arc::new(AtomicBool::new(false));
        let shared: SharedListener<Resp> = Arc::new(Mutex::new(listener));

        let transport =
            ClientTransportListener::new(deserializer, shared.clone(), done.clone(), registry);
        let stream = multiplexer.create(Box::new(transport))?;

        Ok(Arc::new(Self {
            stream,
            encoder: TriEncoder::new(Some(compressor)),
            serializer,
            compress,
            metadata: Mutex::new(Some(metadata)),
            headers_sent: AtomicBool::new(false),
            done,
            listener: shared,
        }))
    }

    /// Send one message; `None` half-closes with an empty DATA frame. With
    /// `last` the final frame carries `end_stream`.
    pub(crate) fn send_message(&self, message: Option<&Req>, last: bool) -> Result<()> {
        if self.done.load(Ordering::Acquire) {
            tracing::warn!("call is done, cannot send message");
            return Ok(());
        }

        // Serialize and frame before any stream work so a failing message
        // leaves no frames behind.
        let encoded = match message {
            Some(message) => {
                let data = (self.serializer)(message).map_err(|err| {
                    tracing::error!("failed to serialize message: {err}");
                    self.fail_locally(
                        RpcStatus::new(RpcCode::Internal)
                            .with_description("failed to serialize message")
                            .with_cause(err),
                    )
                })?;
                let flag = u8::from(self.compress);
                Some(self.encoder.encode(&data, flag).map_err(|status| {
                    let err = status.to_error();
                    self.fail_locally(status);
                    err
                })?)
            }
            None => None,
        };

        if !self.headers_sent.swap(true, Ordering::AcqRel) {
            let metadata = self
                .metadata
                .lock()
                .take()
                .expect("request metadata consumed twice");
            self.stream.send_headers(metadata.to_headers(), false)?;
        }

        match encoded {
            Some(data) => self.stream.send_data(data, last, last)?,
            // Half-close with nothing left to say.
            None => self.stream.send_data(Bytes::new(), true, true)?,
        }
        Ok(())
    }

    /// Cancel the call locally; idempotent. The listener observes CANCELLED.
    pub(crate) fn cancel_by_local(&self, reason: &str) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.fail_locally(
            RpcStatus::new(RpcCode::Cancelled)
                .with_description(format!("call cancelled by client: {reason}")),
        );
    }

    /// Mark the call failed: reset the stream when it carries frames already
    /// and close the listener exactly once. Returns the matching error.
    fn fail_locally(&self, status: RpcStatus) -> RpcError {
        let err = status.to_error();
        if !self.done.swap(true, Ordering::AcqRel) {
            if self.headers_sent.load(Ordering::Acquire) {
                self.stream.send_reset(Http2ErrorCode::CANCEL);
            }
            self.listener.lock().on_close(status, IndexMap::new());
        }
        err
    }
}

impl<Req, Resp> WriteSink<Req> for TripleClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn write_message(&self, message: Req) -> Result<()> {
        self.send_message(Some(&message), false)
    }

    fn finish(&self, _status: Option<RpcStatus>) -> Result<()> {
        self.send_message(None, true)
    }

    fn cancel(&self, reason: &str) {
        self.cancel_by_local(reason);
    }
}

impl<Req, Resp> std::fmt::Debug for TripleClientCall<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripleClientCall")
            .field("stream_id", &self.stream.id())
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

/// Listener adapter completing a oneshot future: unary responses.
pub(crate) struct FutureListenerAdapter<Resp> {
    tx: Option<oneshot::Sender<Result<Resp>>>,
    message: Option<Resp>,
}

impl<Resp> FutureListenerAdapter<Resp> {
    pub(crate) fn new(tx: oneshot::Sender<Result<Resp>>) -> Self {
        Self {
            tx: Some(tx),
            message: None,
        }
    }
}

impl<Resp: Send + 'static> ClientCallListener<Resp> for FutureListenerAdapter<Resp> {
    fn on_message(&mut self, message: Resp) {
        self.message = Some(message);
    }

    fn on_close(&mut self, status: RpcStatus, _trailers: IndexMap<String, String>) {
        let Some(tx) = self.tx.take() else { return };
        let outcome = if status.code() == RpcCode::Ok {
            match self.message.take() {
                Some(message) => Ok(message),
                None => Err(RpcError::new(
                    RpcCode::Internal,
                    "call completed without a response message",
                )),
            }
        } else {
            Err(status.to_error())
        };
        let _ = tx.send(outcome);
    }
}

/// Listener adapter feeding a read stream: server and bidi streaming.
pub(crate) struct StreamListenerAdapter<Resp> {
    stream: ReadStream<Resp>,
}

impl<Resp> StreamListenerAdapter<Resp> {
    pub(crate) fn new(stream: ReadStream<Resp>) -> Self {
        Self { stream }
    }
}

impl<Resp: Send + 'static> ClientCallListener<Resp> for StreamListenerAdapter<Resp> {
    fn on_message(&mut self, message: Resp) {
        self.stream.put(message);
    }

    fn on_close(&mut self, status: RpcStatus, _trailers: IndexMap<String, String>) {
        if status.code() == RpcCode::Ok {
            self.stream.put_eof();
        } else {
            self.stream.put_error(status.to_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_adapter_resolves_with_last_message() {
        let (tx, rx) = oneshot::channel();
        let mut adapter = FutureListenerAdapter::new(tx);
        adapter.on_message(41u32);
        adapter.on_message(42u32);
        adapter.on_close(RpcStatus::new(RpcCode::Ok), IndexMap::new());
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), 42);
    }

    #[test]
    fn future_adapter_propagates_error_status() {
        let (tx, rx) = oneshot::channel::<Result<u32>>();
        let mut adapter = FutureListenerAdapter::new(tx);
        adapter.on_close(
            RpcStatus::new(RpcCode::Unavailable).with_description("gone"),
            IndexMap::new(),
        );
        let err = rx.blocking_recv().unwrap().unwrap_err();
        assert_eq!(err.code, RpcCode::Unavailable);
    }

    #[test]
    fn stream_adapter_terminates_reads() {
        let reads: ReadStream<u32> = ReadStream::new();
        let mut adapter = StreamListenerAdapter::new(reads.clone());
        adapter.on_message(1);
        adapter.on_close(RpcStatus::new(RpcCode::Ok), IndexMap::new());
        assert_eq!(
            reads.read().unwrap(),
            crate::triple::streams::ReadOutcome::Message(1)
        );
        assert_eq!(
            reads.read().unwrap(),
            crate::triple::streams::ReadOutcome::Eof
        );
    }

    #[test]
    fn close_listener_fires_once() {
        struct Counting(Arc<AtomicBool>);
        impl ClientCallListener<u32> for Counting {
            fn on_message(&mut self, _: u32) {}
            fn on_close(&mut self, _: RpcStatus, _: IndexMap<String, String>) {
                assert!(!self.0.swap(true, Ordering::SeqCst), "closed twice");
            }
        }

        let seen = Arc::new(AtomicBool::new(false));
        let done = AtomicBool::new(false);
        let listener: SharedListener<u32> =
            Arc::new(Mutex::new(Box::new(Counting(seen.clone()))));
        close_listener(&done, &listener, RpcStatus::new(RpcCode::Ok), IndexMap::new());
        close_listener(
            &done,
            &listener,
            RpcStatus::new(RpcCode::Cancelled),
            IndexMap::new(),
        );
        assert!(seen.load(Ordering::SeqCst));
    }
}
