//! Outbound request metadata.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;

use crate::compression::{Compressor, IDENTITY, Identity};
use crate::http2::headers::Http2Headers;
use crate::triple::{DEFAULT_SERVICE_VERSION, header_name, header_value};

/// Everything needed to open a call: rendered into the HTTP/2 request
/// header block by [`RequestMetadata::to_headers`].
pub struct RequestMetadata {
    /// `http` or `https`.
    pub scheme: String,
    /// `host:port` of the peer.
    pub address: String,
    /// Target service name.
    pub service: String,
    /// Target method name.
    pub method: String,
    /// Service group, if any.
    pub group: Option<String>,
    /// Service version; `1.0.0` stays off the wire.
    pub version: Option<String>,
    /// Consumer application name.
    pub application: Option<String>,
    /// gRPC-encoded timeout (e.g. `3S`). Transmitted but no local timer is
    /// armed at this layer.
    pub timeout: Option<String>,
    /// Encodings we accept in responses.
    pub accept_encoding: Option<String>,
    /// The compressor for outbound messages.
    pub compressor: Arc<dyn Compressor>,
    /// Free-form headers.
    pub attachments: HashMap<String, String>,
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            scheme: header_value::HTTP.to_owned(),
            address: String::new(),
            service: String::new(),
            method: String::new(),
            group: None,
            version: None,
            application: None,
            timeout: None,
            accept_encoding: None,
            compressor: Arc::new(Identity),
            attachments: HashMap::new(),
        }
    }
}

impl RequestMetadata {
    /// Render the request header block.
    pub fn to_headers(&self) -> Http2Headers {
        let mut headers = Http2Headers::new();
        headers.set_scheme(self.scheme.clone());
        headers.set_authority(self.address.clone());
        headers.set_method(Method::POST.as_str());
        headers.set_path(format!("/{}/{}", self.service, self.method));
        headers.add(
            header_name::CONTENT_TYPE,
            header_value::APPLICATION_GRPC_PROTO,
        );
        headers.add(header_name::TE, header_value::TRAILERS);

        if let Some(version) = &self.version {
            if version != DEFAULT_SERVICE_VERSION {
                headers.add(header_name::SERVICE_VERSION, version.clone());
            }
        }
        if let Some(timeout) = &self.timeout {
            headers.add(header_name::GRPC_TIMEOUT, timeout.clone());
        }
        if let Some(group) = &self.group {
            headers.add(header_name::SERVICE_GROUP, group.clone());
        }
        if let Some(application) = &self.application {
            headers.add(header_name::CONSUMER_APP_NAME, application.clone());
        }
        if let Some(accept) = &self.accept_encoding {
            headers.add(header_name::GRPC_ACCEPT_ENCODING, accept.clone());
        }
        if self.compressor.message_encoding() != IDENTITY {
            headers.add(
                header_name::GRPC_ENCODING,
                self.compressor.message_encoding(),
            );
        }
        for (key, value) in &self.attachments {
            headers.add(key, value.clone());
        }
        headers
    }
}

impl std::fmt::Debug for RequestMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMetadata")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("address", &self.address)
            .field("compressor", &self.compressor.message_encoding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Gzip;

    #[test]
    fn renders_required_request_headers() {
        let metadata = RequestMetadata {
            address: "127.0.0.1:50051".to_owned(),
            service: "org.apache.dubbo.samples.data.Greeter".to_owned(),
            method: "sayHello".to_owned(),
            ..Default::default()
        };
        let headers = metadata.to_headers();
        assert_eq!(headers.method(), Some("POST"));
        assert_eq!(headers.scheme(), Some("http"));
        assert_eq!(
            headers.path(),
            Some("/org.apache.dubbo.samples.data.Greeter/sayHello")
        );
        assert_eq!(headers.get("content-type"), Some("application/grpc+proto"));
        assert_eq!(headers.get("te"), Some("trailers"));
        assert_eq!(headers.get("grpc-encoding"), None);
    }

    #[test]
    fn default_version_stays_off_the_wire() {
        let metadata = RequestMetadata {
            version: Some("1.0.0".to_owned()),
            ..Default::default()
        };
        assert_eq!(metadata.to_headers().get("tri-service-version"), None);

        let metadata = RequestMetadata {
            version: Some("2.1.0".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            metadata.to_headers().get("tri-service-version"),
            Some("2.1.0")
        );
    }

    #[test]
    fn non_identity_compressor_advertises_encoding() {
        let metadata = RequestMetadata {
            compressor: Arc::new(Gzip),
            timeout: Some("3S".to_owned()),
            group: Some("g1".to_owned()),
            ..Default::default()
        };
        let headers = metadata.to_headers();
        assert_eq!(headers.get("grpc-encoding"), Some("gzip"));
        assert_eq!(headers.get("grpc-timeout"), Some("3S"));
        assert_eq!(headers.get("tri-service-group"), Some("g1"));
    }
}
