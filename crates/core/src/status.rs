//! The gRPC status model shared by both call directions.
//!
//! A [`RpcStatus`] is the terminal outcome of every call: a [`RpcCode`], an
//! optional description (truncated to [`MAX_DESCRIPTION_LEN`]), and an
//! optional cause kept for local diagnostics only. Statuses travel on the
//! wire in `grpc-status`/`grpc-message` trailers; responses that die before
//! trailers are mapped from their HTTP status code instead.

use std::fmt;

use http::StatusCode;

use crate::error::{BoxedError, RpcError};

/// Longest description kept on a status.
pub const MAX_DESCRIPTION_LEN: usize = 512;

/// Longest `grpc-message` value rendered into trailers.
pub const MAX_GRPC_MESSAGE_LEN: usize = 1024;

/// The gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcCode {
    /// Not an error.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error, e.g. a missing `grpc-status` trailer.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity the client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or not supported.
    Unimplemented = 12,
    /// Some invariant expected by the underlying system was broken.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl RpcCode {
    /// Numeric wire value of the code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Resolve a wire value back to a code. Out-of-range values become
    /// [`RpcCode::Unknown`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The terminal status of an RPC.
#[derive(Debug)]
pub struct RpcStatus {
    code: RpcCode,
    description: Option<String>,
    cause: Option<BoxedError>,
}

impl RpcStatus {
    /// Create a status with no description.
    pub fn new(code: RpcCode) -> Self {
        Self {
            code,
            description: None,
            cause: None,
        }
    }

    /// The status code.
    pub fn code(&self) -> RpcCode {
        self.code
    }

    /// The description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The local cause, if any. Never serialized.
    pub fn cause(&self) -> Option<&BoxedError> {
        self.cause.as_ref()
    }

    /// Attach a description, truncated to [`MAX_DESCRIPTION_LEN`].
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(limit_desc(&description.into(), MAX_DESCRIPTION_LEN));
        self
    }

    /// Attach a cause.
    pub fn with_cause(mut self, cause: impl Into<BoxedError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Append a line to the description, keeping the length limit.
    pub fn append_description(&mut self, description: &str) {
        let joined = match self.description.take() {
            Some(existing) => format!("{existing}\n{description}"),
            None => description.to_owned(),
        };
        self.description = Some(limit_desc(&joined, MAX_DESCRIPTION_LEN));
    }

    /// Convert to the user-visible error.
    pub fn to_error(&self) -> RpcError {
        RpcError::new(self.code, self.description.clone().unwrap_or_default())
    }

    /// Build a status from a raw `grpc-status` wire value.
    pub fn from_rpc_code(code: u32) -> Self {
        Self::new(RpcCode::from_code(code))
    }

    /// Map an HTTP status code to a gRPC status, used when a response dies
    /// before carrying `grpc-status`.
    pub fn from_http_code(status: StatusCode) -> Self {
        let code = if status.is_informational()
            || status == StatusCode::BAD_REQUEST
            || status == StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        {
            RpcCode::Internal
        } else if status == StatusCode::UNAUTHORIZED {
            RpcCode::Unauthenticated
        } else if status == StatusCode::FORBIDDEN {
            RpcCode::PermissionDenied
        } else if status == StatusCode::NOT_FOUND {
            RpcCode::NotFound
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::BAD_GATEWAY
            || status == StatusCode::SERVICE_UNAVAILABLE
            || status == StatusCode::GATEWAY_TIMEOUT
        {
            RpcCode::Unavailable
        } else {
            RpcCode::Unknown
        };
        Self::new(code)
    }

    /// Render the `grpc-message` trailer value.
    pub(crate) fn message_for_trailers(&self) -> String {
        limit_desc(self.description.as_deref().unwrap_or(""), MAX_GRPC_MESSAGE_LEN)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status(code={}", self.code)?;
        if let Some(desc) = &self.description {
            write!(f, ", description={desc}")?;
        }
        write!(f, ")")
    }
}

/// Truncate a description to `limit` chars, marking the cut with an ellipsis.
pub(crate) fn limit_desc(description: &str, limit: usize) -> String {
    if description.chars().count() > limit {
        let cut: String = description.chars().take(limit).collect();
        format!("{cut}...")
    } else {
        description.to_owned()
    }
}
