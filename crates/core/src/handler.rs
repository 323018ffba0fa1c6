//! Service and method handlers, and the router resolving `(service,
//! method)` to an implementation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BoxedError;
use crate::invocation::{DeserializeFn, RpcType, SerializeFn};
use crate::status::{RpcCode, RpcStatus};
use crate::triple::call::server::{MethodBody, ServerMethod, TypedMethod};
use crate::triple::streams::ReadWriteStream;

/// One callable method exposed by a service.
///
/// The constructors erase the request/response types behind the internal
/// executor; the router only sees names and RPC shapes.
pub struct RpcMethodHandler {
    method_name: String,
    executor: Arc<dyn ServerMethod>,
}

impl RpcMethodHandler {
    /// A unary method: one request in, one response out.
    pub fn unary<Req, Resp, F>(
        method_name: impl Into<String>,
        method: F,
        request_deserializer: DeserializeFn<Req>,
        response_serializer: SerializeFn<Resp>,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req) -> std::result::Result<Resp, BoxedError> + Send + Sync + 'static,
    {
        Self {
            method_name: method_name.into(),
            executor: Arc::new(TypedMethod::new(
                MethodBody::Unary(Box::new(method)),
                request_deserializer,
                response_serializer,
            )),
        }
    }

    /// A client-streaming method: reads requests until EOF, returns one
    /// response.
    pub fn client_stream<Req, Resp, F>(
        method_name: impl Into<String>,
        method: F,
        request_deserializer: DeserializeFn<Req>,
        response_serializer: SerializeFn<Resp>,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(&ReadWriteStream<Resp, Req>) -> std::result::Result<Resp, BoxedError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            method_name: method_name.into(),
            executor: Arc::new(TypedMethod::new(
                MethodBody::ClientStream(Box::new(method)),
                request_deserializer,
                response_serializer,
            )),
        }
    }

    /// A server-streaming method: one request in, an iterable of responses
    /// out.
    pub fn server_stream<Req, Resp, F>(
        method_name: impl Into<String>,
        method: F,
        request_deserializer: DeserializeFn<Req>,
        response_serializer: SerializeFn<Resp>,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req) -> std::result::Result<Vec<Resp>, BoxedError> + Send + Sync + 'static,
    {
        Self {
            method_name: method_name.into(),
            executor: Arc::new(TypedMethod::new(
                MethodBody::ServerStream(Box::new(method)),
                request_deserializer,
                response_serializer,
            )),
        }
    }

    /// A bidirectional method: the handler reads and writes concurrently,
    /// then returns any remaining responses.
    pub fn bi_stream<Req, Resp, F>(
        method_name: impl Into<String>,
        method: F,
        request_deserializer: DeserializeFn<Req>,
        response_serializer: SerializeFn<Resp>,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(&ReadWriteStream<Resp, Req>) -> std::result::Result<Vec<Resp>, BoxedError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            method_name: method_name.into(),
            executor: Arc::new(TypedMethod::new(
                MethodBody::BiStream(Box::new(method)),
                request_deserializer,
                response_serializer,
            )),
        }
    }

    /// The method name as routed.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// The shape of the method.
    pub fn rpc_type(&self) -> RpcType {
        self.executor.rpc_type()
    }

    pub(crate) fn executor(&self) -> &Arc<dyn ServerMethod> {
        &self.executor
    }
}

impl std::fmt::Debug for RpcMethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethodHandler")
            .field("method_name", &self.method_name)
            .field("rpc_type", &self.rpc_type().name())
            .finish()
    }
}

/// A named service grouping its method handlers.
#[derive(Debug)]
pub struct RpcServiceHandler {
    service_name: String,
    method_handlers: HashMap<String, RpcMethodHandler>,
}

impl RpcServiceHandler {
    /// Group `method_handlers` under `service_name`.
    pub fn new(service_name: impl Into<String>, method_handlers: Vec<RpcMethodHandler>) -> Self {
        let mut handlers = HashMap::with_capacity(method_handlers.len());
        for handler in method_handlers {
            handlers.insert(handler.method_name().to_owned(), handler);
        }
        Self {
            service_name: service_name.into(),
            method_handlers: handlers,
        }
    }

    /// The service name as routed.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The method handlers keyed by method name.
    pub fn method_handlers(&self) -> &HashMap<String, RpcMethodHandler> {
        &self.method_handlers
    }
}

/// Maps `(service, method)` to a handler; misses carry the UNIMPLEMENTED
/// status to answer with.
#[derive(Debug, Default)]
pub struct ServiceRouter {
    services: HashMap<String, RpcServiceHandler>,
}

impl ServiceRouter {
    /// Build a router over the registered services.
    pub fn new(services: Vec<RpcServiceHandler>) -> Self {
        let mut map = HashMap::with_capacity(services.len());
        for service in services {
            map.insert(service.service_name().to_owned(), service);
        }
        Self { services: map }
    }

    /// Resolve one route.
    pub fn resolve(
        &self,
        service_name: &str,
        method_name: &str,
    ) -> std::result::Result<&RpcMethodHandler, RpcStatus> {
        let Some(service) = self.services.get(service_name) else {
            return Err(RpcStatus::new(RpcCode::Unimplemented)
                .with_description(format!("service '{service_name}' is not found")));
        };
        service.method_handlers.get(method_name).ok_or_else(|| {
            RpcStatus::new(RpcCode::Unimplemented).with_description(format!(
                "method '{method_name}' is not found in service '{service_name}'"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{raw_deserializer, raw_serializer};

    fn echo_service() -> RpcServiceHandler {
        RpcServiceHandler::new(
            "demo.Echo",
            vec![RpcMethodHandler::unary(
                "echo",
                |req: Vec<u8>| Ok(req),
                raw_deserializer(),
                raw_serializer(),
            )],
        )
    }

    #[test]
    fn resolves_registered_method() {
        let router = ServiceRouter::new(vec![echo_service()]);
        let handler = router.resolve("demo.Echo", "echo").unwrap();
        assert_eq!(handler.method_name(), "echo");
        assert_eq!(handler.rpc_type(), RpcType::UNARY);
    }

    #[test]
    fn unknown_routes_are_unimplemented() {
        let router = ServiceRouter::new(vec![echo_service()]);
        let status = router.resolve("demo.Missing", "echo").unwrap_err();
        assert_eq!(status.code(), RpcCode::Unimplemented);
        assert!(status.description().unwrap().contains("demo.Missing"));

        let status = router.resolve("demo.Echo", "missing").unwrap_err();
        assert_eq!(status.code(), RpcCode::Unimplemented);
        assert!(status.description().unwrap().contains("missing"));
    }
}
