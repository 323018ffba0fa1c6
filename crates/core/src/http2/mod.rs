//! The HTTP/2 remoting layer.
//!
//! This module is a self-contained, gRPC-oriented HTTP/2 implementation:
//! frame parsing and serialization, HPACK, per-connection reader/writer
//! tasks, send-side flow control, the per-stream ordered frame writer, and
//! the stream multiplexer. The Triple protocol layer above it only ever
//! talks to [`Http2Stream`] and [`StreamMultiplexer`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub mod connection;
pub(crate) mod flow;
pub mod frame;
pub mod headers;
pub(crate) mod hpack;
pub mod multiplexer;
pub(crate) mod settings;
pub mod stream;
pub(crate) mod writer;

pub use frame::{DataFrame, HeadersFrame, Http2ErrorCode, Http2Frame};
pub use headers::Http2Headers;
pub use multiplexer::StreamMultiplexer;
pub use stream::{Http2Stream, StreamListener};

/// A one-shot "this frame reached the socket" latch.
///
/// Set exactly once by the connection writer when the frame it accompanies
/// has been fully written (for DATA: fully drained past flow control).
/// Multiple tasks may await it; waiting after the fact returns immediately.
#[derive(Debug, Default)]
pub(crate) struct SendGate {
    done: AtomicBool,
    notify: Notify,
}

impl SendGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A gate that is already open.
    pub(crate) fn opened() -> Arc<Self> {
        let gate = Self::new();
        gate.set();
        gate
    }

    pub(crate) fn set(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_gate_wait_after_set_returns_immediately() {
        let gate = SendGate::new();
        gate.set();
        gate.wait().await;
        assert!(gate.is_set());
    }

    #[tokio::test]
    async fn send_gate_wakes_waiter() {
        let gate = SendGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait().await;
            })
        };
        tokio::task::yield_now().await;
        gate.set();
        waiter.await.unwrap();
    }
}
