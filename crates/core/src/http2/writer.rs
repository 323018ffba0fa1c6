//! The per-stream ordered frame writer.
//!
//! Each stream owns a priority queue keyed by frame kind, HEADERS(0) <
//! DATA(1) < TRAILERS(2) with FIFO order inside a kind, drained by a small
//! task. The task holds two gates: no DATA goes out before the HEADERS frame
//! was written, and no DATA before its predecessor was fully drained past
//! flow control. A trailers frame registered "after data" is parked until
//! the frame marked as the last DATA is enqueued.

use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::http2::SendGate;
use crate::http2::connection::ConnectionHandle;
use crate::http2::headers::Http2Headers;
use crate::http2::stream::Http2Stream;

#[derive(Debug)]
pub(crate) enum QueuedFrame {
    Headers {
        headers: Http2Headers,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Trailers {
        headers: Http2Headers,
    },
}

impl QueuedFrame {
    fn kind(&self) -> u8 {
        match self {
            Self::Headers { .. } => 0,
            Self::Data { .. } => 1,
            Self::Trailers { .. } => 2,
        }
    }
}

#[derive(Debug)]
struct QueueEntry {
    kind: u8,
    seq: u64,
    frame: QueuedFrame,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; invert so the smallest (kind, seq) pops
    // first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.kind, other.seq).cmp(&(self.kind, self.seq))
    }
}

#[derive(Debug, Default)]
struct OrderState {
    queue: BinaryHeap<QueueEntry>,
    deferred_trailers: Option<Http2Headers>,
    started: bool,
    stopped: bool,
    seq: u64,
}

impl OrderState {
    fn push(&mut self, frame: QueuedFrame) {
        let entry = QueueEntry {
            kind: frame.kind(),
            seq: self.seq,
            frame,
        };
        self.seq += 1;
        self.queue.push(entry);
    }

    fn pop(&mut self) -> Option<QueuedFrame> {
        self.queue.pop().map(|entry| entry.frame)
    }
}

/// Frame-order controller for one stream.
#[derive(Debug)]
pub(crate) struct FrameOrderController {
    state: Arc<Mutex<OrderState>>,
    notify: Arc<Notify>,
}

impl FrameOrderController {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(OrderState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Spawn the drain task. Called once when the stream is registered.
    pub(crate) fn start(&self, stream: Weak<Http2Stream>, stream_id: u32, conn: ConnectionHandle) {
        let state = self.state.clone();
        let notify = self.notify.clone();
        conn.runtime().spawn(write_frames(state, notify, stream, stream_id, conn.clone()));
    }

    pub(crate) fn write_headers(&self, headers: Http2Headers, end_stream: bool) {
        let mut state = self.state.lock();
        state.push(QueuedFrame::Headers { headers, end_stream });
        state.started = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Enqueue a DATA frame. `last` marks the final data frame of the call
    /// and releases any trailers parked behind the data.
    pub(crate) fn write_data(&self, data: Bytes, end_stream: bool, last: bool) {
        let mut state = self.state.lock();
        state.push(QueuedFrame::Data { data, end_stream });
        if last {
            if let Some(headers) = state.deferred_trailers.take() {
                state.push(QueuedFrame::Trailers { headers });
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn write_trailers(&self, headers: Http2Headers) {
        let mut state = self.state.lock();
        state.push(QueuedFrame::Trailers { headers });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Park a trailers frame until the last DATA frame is enqueued.
    pub(crate) fn write_trailers_after_data(&self, headers: Http2Headers) {
        self.state.lock().deferred_trailers = Some(headers);
    }

    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.notify.notify_waiters();
    }
}

async fn write_frames(
    state: Arc<Mutex<OrderState>>,
    notify: Arc<Notify>,
    stream: Weak<Http2Stream>,
    stream_id: u32,
    conn: ConnectionHandle,
) {
    let mut headers_gate: Option<Arc<SendGate>> = None;
    let mut data_gate: Option<Arc<SendGate>> = None;

    loop {
        // Wait until the HEADERS frame is queued, then for each next frame.
        let frame = loop {
            let notified = notify.notified();
            {
                let mut locked = state.lock();
                if locked.stopped {
                    return;
                }
                if locked.started {
                    if let Some(frame) = locked.pop() {
                        break frame;
                    }
                }
            }
            notified.await;
        };

        match frame {
            QueuedFrame::Headers { headers, end_stream } => {
                let gate = conn.send_headers(stream_id, headers, end_stream);
                headers_gate = Some(gate);
                if end_stream {
                    if let Some(stream) = stream.upgrade() {
                        stream.close_local();
                    }
                    return;
                }
            }
            QueuedFrame::Data { data, end_stream } => {
                if let Some(gate) = &headers_gate {
                    gate.wait().await;
                }
                if let Some(gate) = data_gate.take() {
                    gate.wait().await;
                }
                let gate = conn.send_data(stream_id, data, end_stream, stream.clone());
                data_gate = Some(gate);
                if end_stream {
                    // The flow controller closes the local side once the
                    // last chunk has physically drained.
                    return;
                }
            }
            QueuedFrame::Trailers { headers } => {
                if let Some(gate) = &headers_gate {
                    gate.wait().await;
                }
                if let Some(gate) = data_gate.take() {
                    gate.wait().await;
                }
                // A reset may have landed while we waited on the gates.
                let Some(stream) = stream.upgrade() else { return };
                if stream.is_local_closed() {
                    return;
                }
                conn.send_headers(stream_id, headers, true);
                stream.close_local();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(n: u8) -> QueuedFrame {
        QueuedFrame::Data {
            data: Bytes::from(vec![n]),
            end_stream: false,
        }
    }

    #[test]
    fn headers_pop_before_earlier_queued_data() {
        let mut state = OrderState::default();
        state.push(data(1));
        state.push(QueuedFrame::Headers {
            headers: Http2Headers::new(),
            end_stream: false,
        });
        assert!(matches!(state.pop(), Some(QueuedFrame::Headers { .. })));
        assert!(matches!(state.pop(), Some(QueuedFrame::Data { .. })));
    }

    #[test]
    fn data_frames_stay_fifo() {
        let mut state = OrderState::default();
        for n in 0..5 {
            state.push(data(n));
        }
        for n in 0..5 {
            match state.pop() {
                Some(QueuedFrame::Data { data, .. }) => assert_eq!(data[0], n),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn trailers_sort_after_all_data() {
        let mut state = OrderState::default();
        state.push(data(1));
        state.push(QueuedFrame::Trailers {
            headers: Http2Headers::new(),
        });
        state.push(data(2));
        assert!(matches!(state.pop(), Some(QueuedFrame::Data { .. })));
        assert!(matches!(state.pop(), Some(QueuedFrame::Data { .. })));
        assert!(matches!(state.pop(), Some(QueuedFrame::Trailers { .. })));
    }

    #[test]
    fn deferred_trailers_released_by_last_data() {
        let controller = FrameOrderController::new();
        controller.write_trailers_after_data(Http2Headers::new());
        controller.write_data(Bytes::from_static(b"a"), false, false);
        assert!(controller.state.lock().deferred_trailers.is_some());
        controller.write_data(Bytes::from_static(b"b"), false, true);
        assert!(controller.state.lock().deferred_trailers.is_none());

        let mut state = controller.state.lock();
        state.started = true;
        let kinds: Vec<u8> = std::iter::from_fn(|| state.pop().map(|f| f.kind())).collect();
        assert_eq!(kinds, vec![1, 1, 2]);
    }
}
