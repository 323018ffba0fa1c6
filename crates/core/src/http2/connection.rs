//! Connection wiring: the frame pipeline.
//!
//! Each connection runs three workers:
//!
//! - the **writer actor** ([`super::flow::ConnectionWriter`]), sole owner of
//!   the socket write half and all HTTP/2 send state;
//! - the **reader task**, which cuts inbound bytes into frames, assembles
//!   CONTINUATION sequences, decodes HPACK, answers PING/SETTINGS through
//!   the writer, acknowledges DATA so the peer's window refills, and routes
//!   everything stream-scoped to the dispatch thread;
//! - the **dispatch thread**, a plain thread draining routed frames into the
//!   stream multiplexer so listener callbacks never run on the I/O tasks.
//!
//! [`ConnectionHandle`] is the cloneable "call soon" trampoline: any thread
//! may queue work for the writer actor through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_util::codec::FramedRead;

use crate::error::ProtocolError;
use crate::http2::SendGate;
use crate::http2::flow::{ConnectionWriter, WriterCommand};
use crate::http2::frame::{
    self, DataFrame, FrameCodec, HeadersFrame, Http2ErrorCode, Http2Frame, RawFrame, flags,
    frame_type,
};
use crate::http2::headers::Http2Headers;
use crate::http2::hpack::HpackDecoder;
use crate::http2::multiplexer::StreamMultiplexer;
use crate::http2::stream::Http2Stream;

/// Cloneable handle to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: UnboundedSender<WriterCommand>,
    runtime: Handle,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub(crate) fn new(tx: UnboundedSender<WriterCommand>, runtime: Handle) -> Self {
        Self {
            tx,
            runtime,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Whether the connection is known to be gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn send(&self, command: WriterCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Queue a HEADERS frame. The gate opens once it reaches the socket (or
    /// immediately when the connection is already gone, so nobody hangs).
    pub(crate) fn send_headers(
        &self,
        stream_id: u32,
        headers: Http2Headers,
        end_stream: bool,
    ) -> Arc<SendGate> {
        let gate = SendGate::new();
        if !self.send(WriterCommand::Headers {
            stream_id,
            headers,
            end_stream,
            gate: gate.clone(),
        }) {
            gate.set();
        }
        gate
    }

    /// Queue flow-controlled DATA.
    pub(crate) fn send_data(
        &self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        stream: std::sync::Weak<Http2Stream>,
    ) -> Arc<SendGate> {
        let gate = SendGate::new();
        if !self.send(WriterCommand::Data {
            stream_id,
            data,
            end_stream,
            gate: gate.clone(),
            stream,
        }) {
            gate.set();
        }
        gate
    }

    /// Queue RST_STREAM.
    pub(crate) fn send_reset(&self, stream_id: u32, error_code: Http2ErrorCode) {
        self.send(WriterCommand::Reset {
            stream_id,
            error_code,
        });
    }

    /// Release everything buffered for a dead stream.
    pub(crate) fn stream_closed(&self, stream_id: u32) {
        self.send(WriterCommand::StreamClosed { stream_id });
    }

    /// Tear the connection down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send(WriterCommand::Shutdown);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum DispatchEvent {
    Frame(Http2Frame),
    ConnectionLost,
}

/// Spawn the reader/writer/dispatch workers for an established socket and
/// bind the multiplexer to the new connection.
pub fn spawn(
    socket: TcpStream,
    multiplexer: Arc<StreamMultiplexer>,
    is_client: bool,
    runtime: Handle,
) -> ConnectionHandle {
    let _ = socket.set_nodelay(true);
    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = unbounded_channel();
    let handle = ConnectionHandle::new(tx.clone(), runtime.clone());
    multiplexer.bind(handle.clone());

    runtime.spawn(ConnectionWriter::new(write_half, rx, is_client).run());

    let (dispatch_tx, dispatch_rx) = std::sync::mpsc::channel::<DispatchEvent>();
    {
        let multiplexer = multiplexer.clone();
        let closed = handle.closed.clone();
        std::thread::Builder::new()
            .name("trirpc-h2-dispatch".to_owned())
            .spawn(move || {
                loop {
                    match dispatch_rx.recv() {
                        Ok(DispatchEvent::Frame(frame)) => multiplexer.handle_frame(frame),
                        // A dropped sender means the reader died without a
                        // farewell; treat it as connection loss either way.
                        Ok(DispatchEvent::ConnectionLost) | Err(_) => {
                            closed.store(true, Ordering::Release);
                            multiplexer.connection_lost();
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn dispatch thread");
    }

    let reader = ConnectionReader {
        framed: FramedRead::new(read_half, FrameCodec::new(!is_client)),
        hpack: HpackDecoder::new(),
        pending_headers: None,
        writer: tx,
        dispatch: dispatch_tx,
    };
    runtime.spawn(reader.run());

    handle
}

struct PendingHeaders {
    stream_id: u32,
    end_stream: bool,
    fragments: BytesMut,
}

struct ConnectionReader<R> {
    framed: FramedRead<R, FrameCodec>,
    hpack: HpackDecoder,
    pending_headers: Option<PendingHeaders>,
    writer: UnboundedSender<WriterCommand>,
    dispatch: std::sync::mpsc::Sender<DispatchEvent>,
}

impl<R> ConnectionReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn run(mut self) {
        loop {
            match self.framed.next().await {
                Some(Ok(raw)) => {
                    if let Err(err) = self.process(raw) {
                        tracing::warn!("closing connection: {err}");
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!("read side failed: {err}");
                    break;
                }
                None => break,
            }
        }
        let _ = self.writer.send(WriterCommand::Shutdown);
        let _ = self.dispatch.send(DispatchEvent::ConnectionLost);
    }

    fn route(&self, frame: Http2Frame) {
        let _ = self.dispatch.send(DispatchEvent::Frame(frame));
    }

    fn process(&mut self, raw: RawFrame) -> Result<(), ProtocolError> {
        if self.pending_headers.is_some() && raw.typ != frame_type::CONTINUATION {
            return Err(ProtocolError::InvalidFrame(
                "expected CONTINUATION frame".into(),
            ));
        }

        match raw.typ {
            frame_type::DATA => {
                if raw.stream_id == 0 {
                    return Err(ProtocolError::InvalidFrame("DATA on stream 0".into()));
                }
                let flow_controlled_length = raw.payload.len();
                let end_stream = raw.has_flag(flags::END_STREAM);
                let padded = raw.has_flag(flags::PADDED);
                let stream_id = raw.stream_id;
                let data = frame::strip_padding(raw.payload, padded, false)?;
                if flow_controlled_length > 0 {
                    let _ = self.writer.send(WriterCommand::AckData {
                        stream_id,
                        len: flow_controlled_length as u32,
                    });
                }
                self.route(Http2Frame::Data(DataFrame {
                    stream_id,
                    data,
                    flow_controlled_length,
                    end_stream,
                }));
            }
            frame_type::HEADERS => {
                let end_stream = raw.has_flag(flags::END_STREAM);
                let end_headers = raw.has_flag(flags::END_HEADERS);
                let padded = raw.has_flag(flags::PADDED);
                let priority = raw.has_flag(flags::PRIORITY);
                let stream_id = raw.stream_id;
                let fragment = frame::strip_padding(raw.payload, padded, priority)?;
                if end_headers {
                    self.finish_headers(stream_id, end_stream, &fragment)?;
                } else {
                    self.pending_headers = Some(PendingHeaders {
                        stream_id,
                        end_stream,
                        fragments: BytesMut::from(&fragment[..]),
                    });
                }
            }
            frame_type::CONTINUATION => {
                let Some(pending) = self.pending_headers.as_mut() else {
                    return Err(ProtocolError::InvalidFrame(
                        "CONTINUATION without HEADERS".into(),
                    ));
                };
                if pending.stream_id != raw.stream_id {
                    return Err(ProtocolError::InvalidFrame(
                        "CONTINUATION on the wrong stream".into(),
                    ));
                }
                pending.fragments.extend_from_slice(&raw.payload);
                if raw.has_flag(flags::END_HEADERS) {
                    let pending = self.pending_headers.take().expect("pending checked");
                    self.finish_headers(
                        pending.stream_id,
                        pending.end_stream,
                        &pending.fragments,
                    )?;
                }
            }
            frame_type::RST_STREAM => {
                if raw.payload.len() != 4 {
                    return Err(ProtocolError::InvalidFrame("bad RST_STREAM length".into()));
                }
                let error_code = Http2ErrorCode((&raw.payload[..]).get_u32());
                let _ = self.writer.send(WriterCommand::StreamClosed {
                    stream_id: raw.stream_id,
                });
                self.route(Http2Frame::RstStream {
                    stream_id: raw.stream_id,
                    error_code,
                });
            }
            frame_type::SETTINGS => {
                if raw.has_flag(flags::ACK) {
                    return Ok(());
                }
                let settings = frame::parse_settings(&raw.payload)?;
                let _ = self.writer.send(WriterCommand::RemoteSettings { settings });
            }
            frame_type::PING => {
                if raw.payload.len() != 8 {
                    return Err(ProtocolError::InvalidFrame("bad PING length".into()));
                }
                if !raw.has_flag(flags::ACK) {
                    let mut payload = [0u8; 8];
                    payload.copy_from_slice(&raw.payload);
                    let _ = self.writer.send(WriterCommand::Ping { payload });
                }
            }
            frame_type::WINDOW_UPDATE => {
                if raw.payload.len() != 4 {
                    return Err(ProtocolError::InvalidFrame(
                        "bad WINDOW_UPDATE length".into(),
                    ));
                }
                let delta = (&raw.payload[..]).get_u32() & 0x7fff_ffff;
                if delta == 0 {
                    tracing::debug!(stream_id = raw.stream_id, "ignoring zero window update");
                    return Ok(());
                }
                let _ = self.writer.send(WriterCommand::WindowUpdate {
                    stream_id: raw.stream_id,
                    delta,
                });
            }
            frame_type::GOAWAY => {
                let mut payload = &raw.payload[..];
                if payload.len() < 8 {
                    return Err(ProtocolError::InvalidFrame("bad GOAWAY length".into()));
                }
                let last_stream_id = payload.get_u32() & 0x7fff_ffff;
                let error_code = Http2ErrorCode(payload.get_u32());
                tracing::debug!(last_stream_id, %error_code, "peer sent GOAWAY");
                return Err(ProtocolError::ConnectionClosed);
            }
            frame_type::PUSH_PROMISE => {
                return Err(ProtocolError::InvalidFrame(
                    "push is disabled on this connection".into(),
                ));
            }
            frame_type::PRIORITY => {}
            other => {
                tracing::debug!(frame_type = other, "ignoring unknown frame type");
            }
        }
        Ok(())
    }

    fn finish_headers(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        block: &[u8],
    ) -> Result<(), ProtocolError> {
        let list = self.hpack.decode(block)?;
        self.route(Http2Frame::Headers(HeadersFrame {
            stream_id,
            headers: Http2Headers::from_list(list),
            end_stream,
        }));
        Ok(())
    }
}
