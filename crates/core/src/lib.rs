//! The core crate of the trirpc RPC runtime.
//!
//! trirpc speaks the Triple wire protocol — gRPC over HTTP/2 — as used by
//! Apache Dubbo. This crate is the whole protocol engine: the HTTP/2 frame
//! pipeline, stream multiplexer, ordered frame writer with flow control,
//! the gRPC message framing codec, the client/server call state machines,
//! and the synchronous user-facing call surface.
//!
//! # A unary call
//!
//! ```no_run
//! use trirpc_core::handler::{RpcMethodHandler, RpcServiceHandler};
//! use trirpc_core::invocation::{raw_deserializer, raw_serializer};
//! use trirpc_core::{Client, Server};
//!
//! let server = Server::builder()
//!     .bind("127.0.0.1:0")
//!     .register(RpcServiceHandler::new(
//!         "demo.Echo",
//!         vec![RpcMethodHandler::unary(
//!             "echo",
//!             |request: Vec<u8>| Ok(request),
//!             raw_deserializer(),
//!             raw_serializer(),
//!         )],
//!     ))
//!     .start()
//!     .unwrap();
//!
//! let client = Client::connect(server.local_addr().to_string(), "demo.Echo").unwrap();
//! let echo = client.unary("echo", raw_serializer(), raw_deserializer());
//! assert_eq!(echo.call(b"hello".to_vec()).unwrap(), b"hello");
//! ```

pub mod client;
pub mod codec;
pub mod compression;
mod error;
pub mod handler;
pub mod http2;
pub mod invocation;
pub mod server;
pub mod status;
pub mod triple;

pub use self::client::{Client, ClientBuilder};
pub use self::error::{BoxedError, ProtocolError, Result, RpcError};
pub use self::handler::{RpcMethodHandler, RpcServiceHandler};
pub use self::server::{Server, ServerBuilder};
pub use self::status::{RpcCode, RpcStatus};
pub use self::triple::streams::{ReadOutcome, ReadStream, ReadWriteStream, WriteStream};

/// The usual imports for applications built on trirpc.
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder};
    pub use crate::compression::CompressionRegistry;
    pub use crate::error::{BoxedError, Result, RpcError};
    pub use crate::handler::{RpcMethodHandler, RpcServiceHandler};
    pub use crate::invocation::{
        DeserializeFn, RpcType, SerializeFn, deserialize_with, raw_deserializer, raw_serializer,
        serialize_with,
    };
    pub use crate::server::{Server, ServerBuilder};
    pub use crate::status::{RpcCode, RpcStatus};
    pub use crate::triple::streams::{ReadOutcome, ReadStream, ReadWriteStream, WriteStream};
}
