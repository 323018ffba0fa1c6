//! The Triple protocol layer: call state machines, protocol streams, user
//! streams, and request metadata.

pub mod call;
pub mod metadata;
pub mod stream;
pub mod streams;

/// Header names used on the wire.
pub(crate) mod header_name {
    pub(crate) const CONTENT_TYPE: &str = "content-type";
    pub(crate) const GRPC_STATUS: &str = "grpc-status";
    pub(crate) const GRPC_MESSAGE: &str = "grpc-message";
    pub(crate) const GRPC_ENCODING: &str = "grpc-encoding";
    pub(crate) const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
    pub(crate) const GRPC_TIMEOUT: &str = "grpc-timeout";
    pub(crate) const TE: &str = "te";
    pub(crate) const SERVICE_VERSION: &str = "tri-service-version";
    pub(crate) const SERVICE_GROUP: &str = "tri-service-group";
    pub(crate) const CONSUMER_APP_NAME: &str = "tri-consumer-appname";
}

/// Header values used on the wire.
pub(crate) mod header_value {
    pub(crate) const APPLICATION_GRPC: &str = "application/grpc";
    pub(crate) const APPLICATION_GRPC_PROTO: &str = "application/grpc+proto";
    pub(crate) const TEXT_PLAIN_UTF8: &str = "text/plain; encoding=utf-8";
    pub(crate) const TRAILERS: &str = "trailers";
    pub(crate) const HTTP: &str = "http";
    pub(crate) const HTTPS: &str = "https";
}

/// The default service version that is left off the wire.
pub(crate) const DEFAULT_SERVICE_VERSION: &str = "1.0.0";
