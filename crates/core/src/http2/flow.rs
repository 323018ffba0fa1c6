//! The connection writer actor: ordered frame emission and send-side flow
//! control.
//!
//! Exactly one [`ConnectionWriter`] task exists per connection. It owns the
//! socket write half, the HPACK encoder, the peer's settings, and every send
//! window, so no other task ever mutates HTTP/2 state; cross-thread callers
//! reach it through [`WriterCommand`]s on an unbounded channel.
//!
//! DATA is split against `min(connection_window, stream_window)` and chunked
//! by the peer's `SETTINGS_MAX_FRAME_SIZE`. Whatever does not fit is kept in
//! a per-stream buffer and marked blocked; a connection-scope WINDOW_UPDATE
//! re-queues every blocked stream, a stream-scope one only its own. The
//! `end_stream` flag travels on the physically last chunk only, and a
//! zero-length DATA frame carries it when the application had nothing left
//! to send.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::ProtocolError;
use crate::http2::SendGate;
use crate::http2::frame::{self, CONNECTION_PREFACE, Http2ErrorCode};
use crate::http2::headers::Http2Headers;
use crate::http2::hpack::HpackEncoder;
use crate::http2::settings::Settings;
use crate::http2::stream::Http2Stream;

/// A request to the connection writer actor.
#[derive(Debug)]
pub(crate) enum WriterCommand {
    /// Emit a HEADERS frame (initial headers or trailers).
    Headers {
        stream_id: u32,
        headers: Http2Headers,
        end_stream: bool,
        gate: Arc<SendGate>,
    },
    /// Emit DATA, subject to flow control. The gate opens when every byte
    /// has been written to the socket.
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        gate: Arc<SendGate>,
        stream: Weak<Http2Stream>,
    },
    /// Emit RST_STREAM and drop everything buffered for the stream.
    Reset {
        stream_id: u32,
        error_code: Http2ErrorCode,
    },
    /// The peer opened its receive window.
    WindowUpdate { stream_id: u32, delta: u32 },
    /// Replenish the peer's view of our receive window after consuming a
    /// flow-controlled DATA frame.
    AckData { stream_id: u32, len: u32 },
    /// The peer sent SETTINGS; apply and acknowledge.
    RemoteSettings { settings: Vec<(u16, u32)> },
    /// The peer pinged; answer it.
    Ping { payload: [u8; 8] },
    /// The stream is gone (reset by the peer or removed); release buffers.
    StreamClosed { stream_id: u32 },
    /// Send GOAWAY and stop the writer.
    Shutdown,
}

#[derive(Debug)]
struct OutboundData {
    buf: BytesMut,
    half_close: bool,
    gate: Arc<SendGate>,
    stream: Weak<Http2Stream>,
}

#[derive(Debug, Default)]
struct StreamSendState {
    window: i64,
    outbound: Option<OutboundData>,
    blocked: bool,
}

/// The per-connection writer actor.
pub(crate) struct ConnectionWriter<W> {
    io: W,
    rx: UnboundedReceiver<WriterCommand>,
    is_client: bool,
    hpack: HpackEncoder,
    remote_settings: Settings,
    conn_window: i64,
    streams: HashMap<u32, StreamSendState>,
    ready: VecDeque<u32>,
    buf: BytesMut,
}

impl<W> ConnectionWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(io: W, rx: UnboundedReceiver<WriterCommand>, is_client: bool) -> Self {
        Self {
            io,
            rx,
            is_client,
            hpack: HpackEncoder::new(),
            remote_settings: Settings::default(),
            conn_window: i64::from(crate::http2::settings::DEFAULT_WINDOW_SIZE),
            streams: HashMap::new(),
            ready: VecDeque::new(),
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            tracing::debug!("connection writer stopped: {err}");
        }
        // Anything still buffered will never reach the wire.
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.discard_outbound(id);
        }
        let _ = self.io.shutdown().await;
    }

    async fn run_inner(&mut self) -> Result<(), ProtocolError> {
        if self.is_client {
            self.buf.put_slice(CONNECTION_PREFACE);
        }
        frame::encode_settings(&mut self.buf, &[], false);
        self.flush().await?;

        loop {
            let Some(command) = self.rx.recv().await else {
                break;
            };
            let shutdown = self.handle(command);
            self.drain_ready();
            self.flush().await?;
            if shutdown {
                break;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        self.buf.clear();
        Ok(())
    }

    /// Apply one command. Returns true when the writer should stop.
    fn handle(&mut self, command: WriterCommand) -> bool {
        match command {
            WriterCommand::Headers {
                stream_id,
                headers,
                end_stream,
                gate,
            } => {
                let mut block = BytesMut::new();
                self.hpack.encode(&headers.to_list(), &mut block);
                frame::encode_headers(
                    &mut self.buf,
                    stream_id,
                    &block,
                    end_stream,
                    self.remote_settings.max_frame_size,
                );
                gate.set();
            }
            WriterCommand::Data {
                stream_id,
                data,
                end_stream,
                gate,
                stream,
            } => self.queue_data(stream_id, data, end_stream, gate, stream),
            WriterCommand::Reset {
                stream_id,
                error_code,
            } => {
                frame::encode_rst_stream(&mut self.buf, stream_id, error_code);
                self.discard_outbound(stream_id);
            }
            WriterCommand::WindowUpdate { stream_id, delta } => {
                self.window_update(stream_id, delta)
            }
            WriterCommand::AckData { stream_id, len } => {
                if len > 0 {
                    frame::encode_window_update(&mut self.buf, 0, len);
                    frame::encode_window_update(&mut self.buf, stream_id, len);
                }
            }
            WriterCommand::RemoteSettings { settings } => {
                let old_initial = i64::from(self.remote_settings.initial_window_size);
                for (id, value) in settings {
                    self.remote_settings.apply(id, value);
                }
                let delta = i64::from(self.remote_settings.initial_window_size) - old_initial;
                if delta != 0 {
                    for state in self.streams.values_mut() {
                        state.window += delta;
                    }
                    let blocked: Vec<u32> = self
                        .streams
                        .iter()
                        .filter(|(_, s)| s.blocked)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in blocked {
                        self.unblock(id);
                    }
                }
                frame::encode_settings(&mut self.buf, &[], true);
            }
            WriterCommand::Ping { payload } => {
                frame::encode_ping(&mut self.buf, payload, true);
            }
            WriterCommand::StreamClosed { stream_id } => {
                self.discard_outbound(stream_id);
                self.streams.remove(&stream_id);
            }
            WriterCommand::Shutdown => {
                frame::encode_goaway(&mut self.buf, 0, Http2ErrorCode::NO_ERROR);
                return true;
            }
        }
        false
    }

    fn queue_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        gate: Arc<SendGate>,
        stream: Weak<Http2Stream>,
    ) {
        let closed = stream.upgrade().is_none_or(|s| s.is_local_closed());
        if closed {
            tracing::warn!(stream_id, "stream is closed, dropping {} bytes", data.len());
            gate.set();
            return;
        }

        let initial = i64::from(self.remote_settings.initial_window_size);
        let state = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamSendState {
                window: initial,
                outbound: None,
                blocked: false,
            });
        match &mut state.outbound {
            Some(out) => {
                out.buf.extend_from_slice(&data);
                out.half_close = end_stream;
                // The previous gate's bytes are subsumed by this one.
                let old = std::mem::replace(&mut out.gate, gate);
                old.set();
                out.stream = stream;
            }
            None => {
                state.outbound = Some(OutboundData {
                    buf: BytesMut::from(&data[..]),
                    half_close: end_stream,
                    gate,
                    stream,
                });
            }
        }
        state.blocked = false;
        self.ready.push_back(stream_id);
    }

    fn window_update(&mut self, stream_id: u32, delta: u32) {
        if stream_id == 0 {
            self.conn_window += i64::from(delta);
            let blocked: Vec<u32> = self
                .streams
                .iter()
                .filter(|(_, s)| s.blocked)
                .map(|(id, _)| *id)
                .collect();
            for id in blocked {
                self.unblock(id);
            }
        } else {
            let initial = i64::from(self.remote_settings.initial_window_size);
            let state = self
                .streams
                .entry(stream_id)
                .or_insert_with(|| StreamSendState {
                    window: initial,
                    outbound: None,
                    blocked: false,
                });
            state.window += i64::from(delta);
            let was_blocked = state.blocked;
            if was_blocked {
                self.unblock(stream_id);
            }
        }
    }

    fn unblock(&mut self, stream_id: u32) {
        if let Some(state) = self.streams.get_mut(&stream_id) {
            state.blocked = false;
        }
        self.ready.push_back(stream_id);
    }

    fn discard_outbound(&mut self, stream_id: u32) {
        if let Some(state) = self.streams.get_mut(&stream_id) {
            state.blocked = false;
            if let Some(out) = state.outbound.take() {
                out.gate.set();
            }
        }
    }

    fn drain_ready(&mut self) {
        while let Some(stream_id) = self.ready.pop_front() {
            let max_frame = self.remote_settings.max_frame_size as usize;
            let Some(state) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            if state.blocked || state.outbound.is_none() {
                continue;
            }
            {
                let out = state.outbound.as_mut().expect("outbound checked above");
                if out.stream.upgrade().is_none_or(|s| s.is_local_closed()) {
                    let out = state.outbound.take().expect("outbound present");
                    out.gate.set();
                    continue;
                }

                let window = self.conn_window.min(state.window).max(0) as usize;
                let send_len = window.min(out.buf.len());
                let to_send = out.buf.split_to(send_len);
                let tail_remaining = !out.buf.is_empty();

                if to_send.is_empty() && out.half_close && !tail_remaining {
                    // Half-close with nothing left to send.
                    frame::encode_data(&mut self.buf, stream_id, &[], true);
                } else if !to_send.is_empty() {
                    let mut offset = 0;
                    while offset < to_send.len() {
                        let end = (offset + max_frame).min(to_send.len());
                        let end_stream =
                            out.half_close && !tail_remaining && end == to_send.len();
                        frame::encode_data(
                            &mut self.buf,
                            stream_id,
                            &to_send[offset..end],
                            end_stream,
                        );
                        offset = end;
                    }
                    self.conn_window -= to_send.len() as i64;
                    state.window -= to_send.len() as i64;
                }

                if tail_remaining {
                    state.blocked = true;
                    continue;
                }
            }

            let out = state.outbound.take().expect("outbound present");
            if out.half_close {
                if let Some(stream) = out.stream.upgrade() {
                    stream.close_local();
                }
            }
            out.gate.set();
        }
    }
}

impl<W> std::fmt::Debug for ConnectionWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("is_client", &self.is_client)
            .field("conn_window", &self.conn_window)
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::frame::{FrameCodec, RawFrame, flags, frame_type};
    use crate::http2::settings::DEFAULT_WINDOW_SIZE;
    use tokio::sync::mpsc;
    use tokio_util::codec::FramedRead;

    use futures_util::StreamExt;

    struct Harness {
        tx: mpsc::UnboundedSender<WriterCommand>,
        frames: FramedRead<tokio::io::DuplexStream, FrameCodec>,
    }

    fn spawn_writer() -> Harness {
        let (client_io, server_io) = tokio::io::duplex(4 * 1024 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = ConnectionWriter::new(client_io, rx, true);
        tokio::spawn(writer.run());
        Harness {
            tx,
            frames: FramedRead::new(server_io, FrameCodec::new(true)),
        }
    }

    impl Harness {
        async fn next_frame(&mut self) -> RawFrame {
            tokio::time::timeout(std::time::Duration::from_secs(5), self.frames.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("frame decode failed")
        }

        /// Skip the writer's own SETTINGS frame.
        async fn skip_preamble(&mut self) {
            let frame = self.next_frame().await;
            assert_eq!(frame.typ, frame_type::SETTINGS);
        }
    }

    fn queued(stream: &Arc<Http2Stream>) -> Weak<Http2Stream> {
        Arc::downgrade(stream)
    }

    fn test_stream(
        tx: &mpsc::UnboundedSender<WriterCommand>,
        id: u32,
    ) -> Arc<Http2Stream> {
        use crate::http2::connection::ConnectionHandle;
        use crate::http2::stream::StreamListener;

        struct NullListener;
        impl StreamListener for NullListener {
            fn on_headers(&mut self, _: Http2Headers, _: bool) {}
            fn on_data(&mut self, _: Bytes, _: bool) {}
            fn on_trailers(&mut self, _: Http2Headers) {}
            fn on_reset(&mut self, _: Http2ErrorCode) {}
            fn on_terminated(&mut self) {}
        }

        let handle = ConnectionHandle::new(tx.clone(), tokio::runtime::Handle::current());
        Http2Stream::new(id, Box::new(NullListener), handle)
    }

    #[tokio::test]
    async fn data_within_window_is_written_in_one_pass() {
        let mut harness = spawn_writer();
        harness.skip_preamble().await;

        let stream = test_stream(&harness.tx, 1);
        let gate = SendGate::new();
        harness
            .tx
            .send(WriterCommand::Data {
                stream_id: 1,
                data: Bytes::from(vec![9u8; 1000]),
                end_stream: true,
                gate: gate.clone(),
                stream: queued(&stream),
            })
            .unwrap();

        let frame = harness.next_frame().await;
        assert_eq!(frame.typ, frame_type::DATA);
        assert_eq!(frame.payload.len(), 1000);
        assert!(frame.has_flag(flags::END_STREAM));
        gate.wait().await;
        assert!(stream.is_local_closed());
    }

    #[tokio::test]
    async fn window_starvation_buffers_until_window_update() {
        let mut harness = spawn_writer();
        harness.skip_preamble().await;

        let total = DEFAULT_WINDOW_SIZE as usize + 50_000;
        let stream = test_stream(&harness.tx, 1);
        let gate = SendGate::new();
        harness
            .tx
            .send(WriterCommand::Data {
                stream_id: 1,
                data: Bytes::from(vec![7u8; total]),
                end_stream: true,
                gate: gate.clone(),
                stream: queued(&stream),
            })
            .unwrap();

        // Exactly one window of DATA drains, chunked by max frame size, and
        // none of it carries END_STREAM.
        let mut received = 0usize;
        while received < DEFAULT_WINDOW_SIZE as usize {
            let frame = harness.next_frame().await;
            assert_eq!(frame.typ, frame_type::DATA);
            assert!(!frame.has_flag(flags::END_STREAM));
            assert!(frame.payload.len() <= 16_384);
            received += frame.payload.len();
        }
        assert_eq!(received, DEFAULT_WINDOW_SIZE as usize);
        assert!(!gate.is_set());

        // Open the windows; the exact remainder drains and the last chunk
        // ends the stream.
        harness
            .tx
            .send(WriterCommand::WindowUpdate {
                stream_id: 0,
                delta: 100_000,
            })
            .unwrap();
        harness
            .tx
            .send(WriterCommand::WindowUpdate {
                stream_id: 1,
                delta: 100_000,
            })
            .unwrap();

        let mut tail = 0usize;
        loop {
            let frame = harness.next_frame().await;
            assert_eq!(frame.typ, frame_type::DATA);
            tail += frame.payload.len();
            if frame.has_flag(flags::END_STREAM) {
                break;
            }
        }
        assert_eq!(tail, 50_000);
        gate.wait().await;
    }

    #[tokio::test]
    async fn reset_discards_buffered_remainder() {
        let mut harness = spawn_writer();
        harness.skip_preamble().await;

        let total = DEFAULT_WINDOW_SIZE as usize + 10;
        let stream = test_stream(&harness.tx, 1);
        let gate = SendGate::new();
        harness
            .tx
            .send(WriterCommand::Data {
                stream_id: 1,
                data: Bytes::from(vec![1u8; total]),
                end_stream: false,
                gate: gate.clone(),
                stream: queued(&stream),
            })
            .unwrap();

        let mut received = 0usize;
        while received < DEFAULT_WINDOW_SIZE as usize {
            received += harness.next_frame().await.payload.len();
        }

        harness
            .tx
            .send(WriterCommand::Reset {
                stream_id: 1,
                error_code: Http2ErrorCode::CANCEL,
            })
            .unwrap();
        let frame = harness.next_frame().await;
        assert_eq!(frame.typ, frame_type::RST_STREAM);
        gate.wait().await;

        // A later window update must not resurrect the discarded bytes.
        harness
            .tx
            .send(WriterCommand::WindowUpdate {
                stream_id: 0,
                delta: 100_000,
            })
            .unwrap();
        harness
            .tx
            .send(WriterCommand::Ping { payload: [0; 8] })
            .unwrap();
        let frame = harness.next_frame().await;
        assert_eq!(frame.typ, frame_type::PING);
    }

    #[tokio::test]
    async fn zero_length_end_stream_when_nothing_to_send() {
        let mut harness = spawn_writer();
        harness.skip_preamble().await;

        let stream = test_stream(&harness.tx, 3);
        let gate = SendGate::new();
        harness
            .tx
            .send(WriterCommand::Data {
                stream_id: 3,
                data: Bytes::new(),
                end_stream: true,
                gate: gate.clone(),
                stream: queued(&stream),
            })
            .unwrap();

        let frame = harness.next_frame().await;
        assert_eq!(frame.typ, frame_type::DATA);
        assert!(frame.payload.is_empty());
        assert!(frame.has_flag(flags::END_STREAM));
        gate.wait().await;
    }

    #[tokio::test]
    async fn interleaved_streams_keep_per_stream_order() {
        let mut harness = spawn_writer();
        harness.skip_preamble().await;

        let stream_a = test_stream(&harness.tx, 1);
        let stream_b = test_stream(&harness.tx, 3);
        for round in 0..5u8 {
            for (id, stream) in [(1u32, &stream_a), (3u32, &stream_b)] {
                harness
                    .tx
                    .send(WriterCommand::Data {
                        stream_id: id,
                        data: Bytes::from(vec![round; 100]),
                        end_stream: false,
                        gate: SendGate::new(),
                        stream: queued(stream),
                    })
                    .unwrap();
            }
        }

        let mut seen: HashMap<u32, Vec<u8>> = HashMap::new();
        for _ in 0..10 {
            let frame = harness.next_frame().await;
            assert_eq!(frame.typ, frame_type::DATA);
            seen.entry(frame.stream_id).or_default().push(frame.payload[0]);
        }
        assert_eq!(seen[&1], vec![0, 1, 2, 3, 4]);
        assert_eq!(seen[&3], vec![0, 1, 2, 3, 4]);
    }
}
