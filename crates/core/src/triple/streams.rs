//! User-visible message streams.
//!
//! A [`ReadStream`] is a finite, non-restartable sequence of messages fed by
//! the connection's dispatch thread and drained by user code, backed by a
//! bounded channel so the I/O side never blocks. A [`WriteStream`] forwards
//! messages into a call; after [`WriteStream::done_writing`] any further
//! write is an error. [`ReadWriteStream`] composes both halves for the
//! streaming call shapes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::time::Duration;

use crate::error::{Result, RpcError};
use crate::status::{RpcCode, RpcStatus};

/// Capacity of the per-stream inbound queue.
const READ_STREAM_CAPACITY: usize = 1000;

/// One successful read from a stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// The next message.
    Message(T),
    /// The stream is exhausted; every later read returns this again.
    Eof,
    /// No message arrived within the timeout.
    TimedOut,
}

enum Item<T> {
    Message(T),
    Eof,
    Error(RpcError),
}

struct ReadShared<T> {
    tx: SyncSender<Item<T>>,
    rx: std::sync::Mutex<Receiver<Item<T>>>,
    // Producer side: terminal item queued, drop everything after it.
    closed: AtomicBool,
    // Consumer side: terminal item consumed.
    finished: AtomicBool,
}

/// The readable half of a call, a lazy sequence of messages.
pub struct ReadStream<T> {
    inner: Arc<ReadShared<T>>,
}

impl<T> Clone for ReadStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ReadStream<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = sync_channel(READ_STREAM_CAPACITY);
        Self {
            inner: Arc::new(ReadShared {
                tx,
                rx: std::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn put(&self, message: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        match self.inner.tx.try_send(Item::Message(message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("read stream is full, dropping a message");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn put_eof(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.try_send(Item::Eof);
    }

    pub(crate) fn put_error(&self, error: RpcError) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.try_send(Item::Error(error));
    }

    /// Read the next message, blocking until one arrives or the stream ends.
    pub fn read(&self) -> Result<ReadOutcome<T>> {
        self.take(None)
    }

    /// Read the next message, waiting at most `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<ReadOutcome<T>> {
        self.take(Some(timeout))
    }

    fn take(&self, timeout: Option<Duration>) -> Result<ReadOutcome<T>> {
        if self.inner.finished.load(Ordering::Acquire) {
            return Ok(ReadOutcome::Eof);
        }
        let rx = self.inner.rx.lock().expect("read stream receiver poisoned");
        let item = match timeout {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(timeout) => rx.recv_timeout(timeout),
        };
        drop(rx);
        match item {
            Ok(Item::Message(message)) => Ok(ReadOutcome::Message(message)),
            Ok(Item::Eof) | Err(RecvTimeoutError::Disconnected) => {
                self.inner.finished.store(true, Ordering::Release);
                Ok(ReadOutcome::Eof)
            }
            Ok(Item::Error(error)) => {
                self.inner.finished.store(true, Ordering::Release);
                Err(error)
            }
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::TimedOut),
        }
    }
}

impl<T: Send + 'static> Iterator for ReadStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read() {
            Ok(ReadOutcome::Message(message)) => Some(Ok(message)),
            Ok(ReadOutcome::Eof) | Ok(ReadOutcome::TimedOut) => None,
            Err(error) => Some(Err(error)),
        }
    }
}

impl<T> std::fmt::Debug for ReadStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Where a write stream delivers its messages.
pub(crate) trait WriteSink<T>: Send + Sync {
    fn write_message(&self, message: T) -> Result<()>;
    fn finish(&self, status: Option<RpcStatus>) -> Result<()>;
    fn cancel(&self, reason: &str);
}

/// The writable half of a call.
pub struct WriteStream<T> {
    sink: Arc<dyn WriteSink<T>>,
    write_done: Arc<AtomicBool>,
}

impl<T> Clone for WriteStream<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            write_done: self.write_done.clone(),
        }
    }
}

impl<T> WriteStream<T> {
    pub(crate) fn new(sink: Arc<dyn WriteSink<T>>) -> Self {
        Self {
            sink,
            write_done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the stream still accepts messages.
    pub fn can_write_more(&self) -> bool {
        !self.write_done.load(Ordering::Acquire)
    }

    /// Enqueue one message.
    pub fn write(&self, message: T) -> Result<()> {
        if !self.can_write_more() {
            return Err(RpcError::new(RpcCode::Internal, "write after done writing"));
        }
        self.sink.write_message(message)
    }

    /// Signal that no further messages follow. A second call is an error and
    /// emits nothing.
    pub fn done_writing(&self) -> Result<()> {
        if self.write_done.swap(true, Ordering::AcqRel) {
            return Err(RpcError::new(RpcCode::Internal, "done writing multiple times"));
        }
        self.sink.finish(None)
    }

    /// Terminate with an explicit status (server side error path).
    pub(crate) fn done_writing_with(&self, status: RpcStatus) -> Result<()> {
        if self.write_done.swap(true, Ordering::AcqRel) {
            return Err(RpcError::new(RpcCode::Internal, "done writing multiple times"));
        }
        self.sink.finish(Some(status))
    }

    /// Cancel the call this stream writes into.
    pub fn cancel(&self, reason: &str) {
        self.write_done.store(true, Ordering::Release);
        self.sink.cancel(reason);
    }
}

impl<T> std::fmt::Debug for WriteStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStream")
            .field("can_write_more", &self.can_write_more())
            .finish()
    }
}

/// Both halves of a streaming call: writes `W`, reads `R`.
pub struct ReadWriteStream<W, R> {
    write: WriteStream<W>,
    read: ReadStream<R>,
}

impl<W, R> Clone for ReadWriteStream<W, R> {
    fn clone(&self) -> Self {
        Self {
            write: self.write.clone(),
            read: self.read.clone(),
        }
    }
}

impl<W, R: Send + 'static> ReadWriteStream<W, R> {
    pub(crate) fn new(write: WriteStream<W>, read: ReadStream<R>) -> Self {
        Self { write, read }
    }

    /// Read the next inbound message.
    pub fn read(&self) -> Result<ReadOutcome<R>> {
        self.read.read()
    }

    /// Read the next inbound message, waiting at most `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<ReadOutcome<R>> {
        self.read.read_timeout(timeout)
    }

    /// Whether the stream still accepts messages.
    pub fn can_write_more(&self) -> bool {
        self.write.can_write_more()
    }

    /// Enqueue one outbound message.
    pub fn write(&self, message: W) -> Result<()> {
        self.write.write(message)
    }

    /// Signal that no further messages follow.
    pub fn done_writing(&self) -> Result<()> {
        self.write.done_writing()
    }

    pub(crate) fn done_writing_with(&self, status: RpcStatus) -> Result<()> {
        self.write.done_writing_with(status)
    }

    /// Cancel the underlying call.
    pub fn cancel(&self, reason: &str) {
        self.write.cancel(reason);
    }

    /// The readable half alone.
    pub fn reader(&self) -> ReadStream<R> {
        self.read.clone()
    }
}

impl<W, R: Send + 'static> Iterator for ReadWriteStream<W, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read.next()
    }
}

impl<W, R> std::fmt::Debug for ReadWriteStream<W, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<u32>>,
        finished: Mutex<Vec<Option<RpcCode>>>,
    }

    impl WriteSink<u32> for RecordingSink {
        fn write_message(&self, message: u32) -> Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }

        fn finish(&self, status: Option<RpcStatus>) -> Result<()> {
            self.finished.lock().unwrap().push(status.map(|s| s.code()));
            Ok(())
        }

        fn cancel(&self, _reason: &str) {}
    }

    #[test]
    fn read_stream_delivers_in_order_then_eof_forever() {
        let stream: ReadStream<u32> = ReadStream::new();
        stream.put(1);
        stream.put(2);
        stream.put_eof();
        stream.put(3);

        assert_eq!(stream.read().unwrap(), ReadOutcome::Message(1));
        assert_eq!(stream.read().unwrap(), ReadOutcome::Message(2));
        assert_eq!(stream.read().unwrap(), ReadOutcome::Eof);
        assert_eq!(stream.read().unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn read_stream_surfaces_error_once_then_eof() {
        let stream: ReadStream<u32> = ReadStream::new();
        stream.put(7);
        stream.put_error(RpcError::new(RpcCode::Internal, "boom"));

        assert_eq!(stream.read().unwrap(), ReadOutcome::Message(7));
        let err = stream.read().unwrap_err();
        assert_eq!(err.code, RpcCode::Internal);
        assert_eq!(stream.read().unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn read_timeout_reports_timed_out() {
        let stream: ReadStream<u32> = ReadStream::new();
        assert_eq!(
            stream.read_timeout(Duration::from_millis(10)).unwrap(),
            ReadOutcome::TimedOut
        );
    }

    #[test]
    fn iteration_stops_at_eof() {
        let mut stream: ReadStream<u32> = ReadStream::new();
        for n in 0..3 {
            stream.put(n);
        }
        stream.put_eof();
        let collected: Vec<u32> = (&mut stream).map(|r| r.unwrap()).collect();
        assert_eq!(collected, vec![0, 1, 2]);
        assert!(stream.next().is_none());
    }

    #[test]
    fn write_after_done_writing_fails() {
        let sink = Arc::new(RecordingSink::default());
        let stream = WriteStream::new(sink.clone());
        stream.write(5).unwrap();
        stream.done_writing().unwrap();
        assert!(!stream.can_write_more());
        assert!(stream.write(6).is_err());
        assert!(stream.done_writing().is_err());
        assert_eq!(*sink.messages.lock().unwrap(), vec![5]);
        // A rejected second done_writing emits nothing.
        assert_eq!(sink.finished.lock().unwrap().len(), 1);
    }
}
