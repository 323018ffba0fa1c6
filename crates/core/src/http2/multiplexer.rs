//! The per-connection stream table.
//!
//! On the client side the multiplexer allocates odd stream ids and hands out
//! new streams; on the server side it lazily registers a stream on the first
//! HEADERS frame for an unknown id, using a listener factory supplied at
//! construction. Inbound frames are routed to the owning stream; frames for
//! unknown streams are dropped with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::RpcError;
use crate::http2::connection::ConnectionHandle;
use crate::http2::frame::Http2Frame;
use crate::http2::stream::{Http2Stream, StreamListener};
use crate::status::RpcCode;

/// Creates the listener for a server stream registered on first HEADERS.
pub type ListenerFactory = Box<dyn Fn() -> Box<dyn StreamListener> + Send + Sync>;

enum Side {
    Client { next_stream_id: AtomicU32 },
    Server { factory: ListenerFactory },
}

/// Owns the `stream id → stream` table of one connection.
pub struct StreamMultiplexer {
    streams: Mutex<HashMap<u32, Arc<Http2Stream>>>,
    side: Side,
    conn: OnceLock<ConnectionHandle>,
}

impl StreamMultiplexer {
    /// A client-side multiplexer; stream ids are allocated locally, odd.
    pub fn client() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            side: Side::Client {
                next_stream_id: AtomicU32::new(1),
            },
            conn: OnceLock::new(),
        })
    }

    /// A server-side multiplexer; streams are registered lazily through the
    /// listener factory.
    pub fn server(factory: ListenerFactory) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            side: Side::Server { factory },
            conn: OnceLock::new(),
        })
    }

    pub(crate) fn bind(&self, conn: ConnectionHandle) {
        let _ = self.conn.set(conn);
    }

    pub(crate) fn connection(&self) -> Result<&ConnectionHandle, RpcError> {
        match self.conn.get() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(RpcError::new(
                RpcCode::Unavailable,
                "the client is not connected to the server",
            )),
        }
    }

    /// Open a new client stream bound to `listener`.
    pub fn create(&self, listener: Box<dyn StreamListener>) -> Result<Arc<Http2Stream>, RpcError> {
        let Side::Client { next_stream_id } = &self.side else {
            return Err(RpcError::new(
                RpcCode::Internal,
                "cannot create streams on a server connection",
            ));
        };
        let conn = self.connection()?.clone();
        let stream_id = next_stream_id.fetch_add(2, Ordering::AcqRel);
        let stream = Http2Stream::new(stream_id, listener, conn);
        self.streams.lock().insert(stream_id, stream.clone());
        Ok(stream)
    }

    fn register(&self, stream_id: u32) -> Option<Arc<Http2Stream>> {
        let Side::Server { factory } = &self.side else {
            return None;
        };
        let conn = self.conn.get()?.clone();
        let stream = Http2Stream::new(stream_id, factory(), conn);
        self.streams.lock().insert(stream_id, stream.clone());
        Some(stream)
    }

    /// Route one inbound frame. Runs on the dispatch thread.
    pub(crate) fn handle_frame(&self, frame: Http2Frame) {
        let stream_id = frame.stream_id();
        if stream_id == 0 {
            tracing::warn!("dropping connection-scope frame routed to the multiplexer");
            return;
        }

        let mut stream = self.streams.lock().get(&stream_id).cloned();
        if stream.is_none() && matches!(frame, Http2Frame::Headers(_)) {
            stream = self.register(stream_id);
        }
        let Some(stream) = stream else {
            tracing::warn!(stream_id, "stream not found, ignoring frame");
            return;
        };

        let is_reset = matches!(frame, Http2Frame::RstStream { .. });
        let end_stream = frame.end_stream();
        stream.receive_frame(frame);

        if is_reset {
            self.streams.lock().remove(&stream_id);
            if let Some(conn) = self.conn.get() {
                conn.stream_closed(stream_id);
            }
        } else if end_stream && stream.is_local_closed() {
            self.streams.lock().remove(&stream_id);
        }
    }

    /// Fail every live stream; the connection is gone.
    pub(crate) fn connection_lost(&self) {
        let streams: Vec<Arc<Http2Stream>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.terminate();
        }
    }

    /// Number of live streams, for diagnostics.
    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match &self.side {
            Side::Client { .. } => "client",
            Side::Server { .. } => "server",
        };
        f.debug_struct("StreamMultiplexer")
            .field("side", &side)
            .field("active_streams", &self.active_streams())
            .finish()
    }
}
