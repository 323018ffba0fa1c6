//! One HTTP/2 stream and its inbound listener.
//!
//! A stream moves through Idle → Open → (HalfClosedLocal | HalfClosedRemote)
//! → Closed, tracked here as two independent `local_closed`/`remote_closed`
//! flags. Outbound frames go through the stream's [`FrameOrderController`];
//! inbound frames arrive on the connection's dispatch thread through
//! [`Http2Stream::receive_frame`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::ProtocolError;
use crate::http2::connection::ConnectionHandle;
use crate::http2::frame::{Http2ErrorCode, Http2Frame};
use crate::http2::headers::Http2Headers;
use crate::http2::writer::FrameOrderController;

/// Receives inbound events for one stream.
///
/// Callbacks run on the connection's dispatch thread, never on the I/O
/// tasks, so implementations may do CPU-bound work but must not block
/// indefinitely.
pub trait StreamListener: Send + 'static {
    /// The stream handle, delivered once right after registration.
    fn bind(&mut self, stream: std::sync::Weak<Http2Stream>) {
        let _ = stream;
    }

    /// Initial HEADERS arrived.
    fn on_headers(&mut self, headers: Http2Headers, end_stream: bool);

    /// A DATA frame arrived.
    fn on_data(&mut self, data: Bytes, end_stream: bool);

    /// A trailers frame (second HEADERS) arrived.
    fn on_trailers(&mut self, headers: Http2Headers);

    /// The peer reset the stream.
    fn on_reset(&mut self, error_code: Http2ErrorCode);

    /// The connection is gone; no further events will arrive.
    fn on_terminated(&mut self);
}

/// Per-RPC HTTP/2 stream state.
pub struct Http2Stream {
    id: u32,
    conn: ConnectionHandle,
    listener: Mutex<Box<dyn StreamListener>>,
    order: FrameOrderController,
    headers_sent: AtomicBool,
    headers_received: AtomicBool,
    // An end_stream frame has been queued; nothing may be sent after it.
    end_stream_queued: AtomicBool,
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl Http2Stream {
    /// Create and register the stream's writer task.
    pub(crate) fn new(
        id: u32,
        listener: Box<dyn StreamListener>,
        conn: ConnectionHandle,
    ) -> Arc<Self> {
        let stream = Arc::new(Self {
            id,
            conn: conn.clone(),
            listener: Mutex::new(listener),
            order: FrameOrderController::new(),
            headers_sent: AtomicBool::new(false),
            headers_received: AtomicBool::new(false),
            end_stream_queued: AtomicBool::new(false),
            local_closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
        });
        stream.order.start(Arc::downgrade(&stream), id, conn);
        stream.listener.lock().bind(Arc::downgrade(&stream));
        stream
    }

    /// The stream identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_headers_sent(&self) -> bool {
        self.headers_sent.load(Ordering::Acquire)
    }

    /// Whether our side can no longer send.
    pub fn is_local_closed(&self) -> bool {
        self.local_closed.load(Ordering::Acquire)
    }

    /// Whether the peer can no longer send.
    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::Acquire)
    }

    pub(crate) fn close_local(&self) {
        self.local_closed.store(true, Ordering::Release);
        self.order.stop();
    }

    pub(crate) fn close_remote(&self) {
        self.remote_closed.store(true, Ordering::Release);
    }

    fn send_available(&self) -> bool {
        !self.is_local_closed() && !self.end_stream_queued.load(Ordering::Acquire)
    }

    /// Queue the HEADERS frame. Must happen exactly once, before any DATA.
    pub fn send_headers(
        &self,
        headers: Http2Headers,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        if self.headers_sent.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::HeadersAlreadySent(self.id));
        }
        if !self.send_available() {
            return Err(ProtocolError::StreamClosed(self.id));
        }
        if end_stream {
            self.end_stream_queued.store(true, Ordering::Release);
        }
        self.order.write_headers(headers, end_stream);
        Ok(())
    }

    /// Queue a DATA frame. `last` marks the final data frame and releases a
    /// deferred trailers frame, independent of `end_stream`.
    pub fn send_data(&self, data: Bytes, end_stream: bool, last: bool) -> Result<(), ProtocolError> {
        if !self.is_headers_sent() {
            return Err(ProtocolError::HeadersNotSent(self.id));
        }
        if !self.send_available() {
            return Err(ProtocolError::StreamClosed(self.id));
        }
        if end_stream {
            self.end_stream_queued.store(true, Ordering::Release);
        }
        self.order.write_data(data, end_stream, last);
        Ok(())
    }

    /// Queue a trailers frame (a HEADERS frame with `end_stream`). With
    /// `after_data` the frame is parked until the last DATA is enqueued.
    pub fn send_trailers(
        &self,
        headers: Http2Headers,
        after_data: bool,
    ) -> Result<(), ProtocolError> {
        if !self.is_headers_sent() {
            return Err(ProtocolError::HeadersNotSent(self.id));
        }
        if !self.send_available() {
            return Err(ProtocolError::StreamClosed(self.id));
        }
        if after_data {
            self.order.write_trailers_after_data(headers);
        } else {
            self.end_stream_queued.store(true, Ordering::Release);
            self.order.write_trailers(headers);
        }
        Ok(())
    }

    /// Reset the stream. Skips the ordered queue and closes both directions
    /// immediately; idempotent.
    pub fn send_reset(&self, error_code: Http2ErrorCode) {
        if self.is_local_closed() {
            return;
        }
        self.close_local();
        self.close_remote();
        self.conn.send_reset(self.id, error_code);
    }

    /// Route one inbound frame to the listener. Runs on the dispatch thread.
    pub(crate) fn receive_frame(&self, frame: Http2Frame) {
        if self.is_remote_closed() {
            return;
        }
        if frame.end_stream() {
            self.close_remote();
        }

        match frame {
            Http2Frame::Headers(frame) => {
                if !self.headers_received.swap(true, Ordering::AcqRel) {
                    self.listener.lock().on_headers(frame.headers, frame.end_stream);
                } else {
                    self.listener.lock().on_trailers(frame.headers);
                }
            }
            Http2Frame::Data(frame) => {
                self.listener.lock().on_data(frame.data, frame.end_stream);
            }
            Http2Frame::RstStream { error_code, .. } => {
                self.listener.lock().on_reset(error_code);
                self.close_local();
            }
            other => {
                tracing::warn!(stream_id = self.id, "unroutable frame: {other:?}");
            }
        }
    }

    /// Fail the stream because the connection is gone.
    pub(crate) fn terminate(&self) {
        self.close_local();
        self.close_remote();
        self.listener.lock().on_terminated();
    }
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Stream")
            .field("id", &self.id)
            .field("headers_sent", &self.is_headers_sent())
            .field("local_closed", &self.is_local_closed())
            .field("remote_closed", &self.is_remote_closed())
            .finish()
    }
}
