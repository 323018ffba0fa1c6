//! Call descriptors: RPC shapes, per-method codecs, and the immutable
//! invocation handed from a callable to its invoker.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BoxedError;

/// Serializes a message of type `T` to wire bytes.
pub type SerializeFn<T> = Arc<dyn Fn(&T) -> std::result::Result<Vec<u8>, BoxedError> + Send + Sync>;

/// Deserializes wire bytes to a message of type `T`.
pub type DeserializeFn<T> =
    Arc<dyn Fn(&[u8]) -> std::result::Result<T, BoxedError> + Send + Sync>;

/// Wrap a closure as a [`SerializeFn`].
pub fn serialize_with<T, F>(f: F) -> SerializeFn<T>
where
    F: Fn(&T) -> std::result::Result<Vec<u8>, BoxedError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`DeserializeFn`].
pub fn deserialize_with<T, F>(f: F) -> DeserializeFn<T>
where
    F: Fn(&[u8]) -> std::result::Result<T, BoxedError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identity serializer for methods that move raw bytes.
pub fn raw_serializer() -> SerializeFn<Vec<u8>> {
    Arc::new(|payload| Ok(payload.clone()))
}

/// Identity deserializer for methods that move raw bytes.
pub fn raw_deserializer() -> DeserializeFn<Vec<u8>> {
    Arc::new(|payload| Ok(payload.to_vec()))
}

/// The shape of an RPC, told apart by which sides send a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcType {
    /// The client sends a stream of messages.
    pub client_stream: bool,
    /// The server sends a stream of messages.
    pub server_stream: bool,
}

impl RpcType {
    /// One request, one response.
    pub const UNARY: Self = Self {
        client_stream: false,
        server_stream: false,
    };
    /// A stream of requests, one response.
    pub const CLIENT_STREAM: Self = Self {
        client_stream: true,
        server_stream: false,
    };
    /// One request, a stream of responses.
    pub const SERVER_STREAM: Self = Self {
        client_stream: false,
        server_stream: true,
    };
    /// Streams in both directions.
    pub const BI_STREAM: Self = Self {
        client_stream: true,
        server_stream: true,
    };

    /// Human readable name of the shape.
    pub fn name(self) -> &'static str {
        match (self.client_stream, self.server_stream) {
            (false, false) => "UnaryCall",
            (true, false) => "ClientStreamCall",
            (false, true) => "ServerStreamCall",
            (true, true) => "BiStreamCall",
        }
    }
}

/// Per-method contract seen from the client side: name, shape, and the codec
/// pair for each direction.
pub struct MethodDescriptor<Req, Resp> {
    method_name: String,
    rpc_type: RpcType,
    request_serializer: SerializeFn<Req>,
    response_deserializer: DeserializeFn<Resp>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    /// Create a descriptor.
    pub fn new(
        method_name: impl Into<String>,
        rpc_type: RpcType,
        request_serializer: SerializeFn<Req>,
        response_deserializer: DeserializeFn<Resp>,
    ) -> Self {
        Self {
            method_name: method_name.into(),
            rpc_type,
            request_serializer,
            response_deserializer,
        }
    }

    /// The method name as it appears on the `:path`.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// The RPC shape.
    pub fn rpc_type(&self) -> RpcType {
        self.rpc_type
    }

    pub(crate) fn request_serializer(&self) -> SerializeFn<Req> {
        self.request_serializer.clone()
    }

    pub(crate) fn response_deserializer(&self) -> DeserializeFn<Resp> {
        self.response_deserializer.clone()
    }
}

impl<Req, Resp> std::fmt::Debug for MethodDescriptor<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("method_name", &self.method_name)
            .field("rpc_type", &self.rpc_type.name())
            .finish()
    }
}

/// An immutable call request: which service and method to hit, plus the
/// string attachments transmitted on the wire as headers. Live objects
/// (descriptors, codecs) stay local and are never serialized.
#[derive(Debug, Clone, Default)]
pub struct RpcInvocation {
    service_name: String,
    method_name: String,
    attachments: HashMap<String, String>,
}

impl RpcInvocation {
    /// Create an invocation for `service`/`method`.
    pub fn new(service_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            attachments: HashMap::new(),
        }
    }

    /// Add a wire attachment.
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// The target service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The target method name.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Attachments transmitted as headers.
    pub fn attachments(&self) -> &HashMap<String, String> {
        &self.attachments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_type_names() {
        assert_eq!(RpcType::UNARY.name(), "UnaryCall");
        assert_eq!(RpcType::CLIENT_STREAM.name(), "ClientStreamCall");
        assert_eq!(RpcType::SERVER_STREAM.name(), "ServerStreamCall");
        assert_eq!(RpcType::BI_STREAM.name(), "BiStreamCall");
        assert!(RpcType::BI_STREAM.client_stream && RpcType::BI_STREAM.server_stream);
    }

    #[test]
    fn raw_codec_round_trip() {
        let ser = raw_serializer();
        let de = raw_deserializer();
        let payload = vec![1u8, 2, 3];
        assert_eq!(de(&ser(&payload).unwrap()).unwrap(), payload);
    }
}
