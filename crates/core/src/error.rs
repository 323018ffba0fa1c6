//! Error types used throughout the runtime.
//!
//! Two error families exist with a deliberate boundary between them:
//!
//! - [`RpcError`] is the user-visible failure of a single call. It carries a
//!   gRPC status code and a message, and is what surfaces from callables,
//!   [`read`](crate::triple::streams::ReadStream::read) and write streams.
//! - [`ProtocolError`] is an HTTP/2 level failure (malformed frame, HPACK
//!   corruption, closed stream). Protocol errors on a single stream are
//!   recovered locally and converted to an `RpcError`; only connection-level
//!   ones tear the connection down.

use std::error::Error as StdError;
use std::io::Error as IoError;

use crate::status::{RpcCode, RpcStatus};

/// A boxed error type for dynamic error handling.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// Result type which has [`RpcError`] as its error type.
pub type Result<T> = std::result::Result<T, RpcError>;

/// The failure of a single RPC, as seen by the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rpc failed: code={}, message={message}", code.code())]
pub struct RpcError {
    /// The gRPC status code.
    pub code: RpcCode,
    /// Human readable description, possibly empty.
    pub message: String,
}

impl RpcError {
    /// Create a new error from a code and message.
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Rebuild the status this error was derived from.
    pub fn status(&self) -> RpcStatus {
        RpcStatus::new(self.code).with_description(self.message.clone())
    }
}

impl From<RpcStatus> for RpcError {
    fn from(status: RpcStatus) -> Self {
        status.to_error()
    }
}

/// An HTTP/2 connection or stream level failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Transport I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] IoError),
    /// The peer did not open with the HTTP/2 connection preface.
    #[error("invalid connection preface")]
    BadPreface,
    /// A frame violated the wire format.
    #[error("malformed frame: {0}")]
    InvalidFrame(String),
    /// A frame exceeded the advertised maximum frame size.
    #[error("frame of {length} bytes exceeds maximum frame size {max}")]
    FrameTooLarge {
        /// Declared payload length.
        length: u32,
        /// The limit in force.
        max: u32,
    },
    /// The header block could not be decoded.
    #[error("header compression error: {0}")]
    Hpack(String),
    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,
    /// An operation was attempted on a stream that can no longer send.
    #[error("stream {0} is closed for sending")]
    StreamClosed(u32),
    /// HEADERS was sent twice on the same stream.
    #[error("headers have already been sent on stream {0}")]
    HeadersAlreadySent(u32),
    /// DATA or trailers were sent before HEADERS.
    #[error("headers have not been sent on stream {0}")]
    HeadersNotSent(u32),
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        let code = match err {
            ProtocolError::ConnectionClosed | ProtocolError::Io(_) => RpcCode::Unavailable,
            _ => RpcCode::Internal,
        };
        RpcError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_maps_to_status_code() {
        let err: RpcError = ProtocolError::ConnectionClosed.into();
        assert_eq!(err.code, RpcCode::Unavailable);

        let err: RpcError = ProtocolError::HeadersNotSent(5).into();
        assert_eq!(err.code, RpcCode::Internal);
        assert!(err.message.contains("stream 5"));
    }
}
