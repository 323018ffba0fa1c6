//! Message compression extensions.
//!
//! Compressors and decompressors are resolved by their gRPC encoding name
//! (`grpc-encoding` header). The registry is built at construction time and
//! handed to every connection; looking up an unregistered name yields an
//! [`ExtensionError`] which surfaces to the peer as `UNIMPLEMENTED`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::BoxedError;
use crate::status::{RpcCode, RpcStatus};

/// Encoding name of the no-op codec.
pub const IDENTITY: &str = "identity";

/// Compresses outbound message payloads.
pub trait Compressor: Send + Sync + 'static {
    /// The encoding name advertised in `grpc-encoding`.
    fn message_encoding(&self) -> &'static str;

    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError>;
}

/// Decompresses inbound message payloads.
pub trait Decompressor: Send + Sync + 'static {
    /// The encoding name this codec answers to.
    fn message_encoding(&self) -> &'static str;

    /// Decompress a payload.
    fn decompress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError>;
}

impl std::fmt::Debug for dyn Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Compressor")
            .field("message_encoding", &self.message_encoding())
            .finish()
    }
}

/// The `identity` codec: bytes pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Compressor for Identity {
    fn message_encoding(&self) -> &'static str {
        IDENTITY
    }

    fn compress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError> {
        Ok(data.to_vec())
    }
}

impl Decompressor for Identity {
    fn message_encoding(&self) -> &'static str {
        IDENTITY
    }

    fn decompress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError> {
        Ok(data.to_vec())
    }
}

/// The `gzip` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gzip;

impl Compressor for Gzip {
    fn message_encoding(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }
}

impl Decompressor for Gzip {
    fn message_encoding(&self) -> &'static str {
        "gzip"
    }

    fn decompress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// The `bzip2` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bzip2;

impl Compressor for Bzip2 {
    fn message_encoding(&self) -> &'static str {
        "bzip2"
    }

    fn compress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError> {
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }
}

impl Decompressor for Bzip2 {
    fn message_encoding(&self) -> &'static str {
        "bzip2"
    }

    fn decompress(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxedError> {
        let mut decoder = bzip2::read::BzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Lookup of an unregistered extension name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no {kind} registered for encoding '{name}'")]
pub struct ExtensionError {
    /// What kind of extension was asked for.
    pub kind: &'static str,
    /// The requested encoding name.
    pub name: String,
}

impl From<ExtensionError> for RpcStatus {
    fn from(err: ExtensionError) -> Self {
        RpcStatus::new(RpcCode::Unimplemented).with_description(err.to_string())
    }
}

/// Name-keyed registry of compression extensions.
///
/// `identity`, `gzip` and `bzip2` are registered out of the box.
pub struct CompressionRegistry {
    compressors: HashMap<&'static str, Arc<dyn Compressor>>,
    decompressors: HashMap<&'static str, Arc<dyn Decompressor>>,
}

impl CompressionRegistry {
    /// A registry with only the built-in codecs.
    pub fn new() -> Self {
        let mut registry = Self {
            compressors: HashMap::new(),
            decompressors: HashMap::new(),
        };
        registry.register_compressor(Arc::new(Identity));
        registry.register_decompressor(Arc::new(Identity));
        registry.register_compressor(Arc::new(Gzip));
        registry.register_decompressor(Arc::new(Gzip));
        registry.register_compressor(Arc::new(Bzip2));
        registry.register_decompressor(Arc::new(Bzip2));
        registry
    }

    /// Register (or replace) a compressor under its encoding name.
    pub fn register_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors
            .insert(compressor.message_encoding(), compressor);
    }

    /// Register (or replace) a decompressor under its encoding name.
    pub fn register_decompressor(&mut self, decompressor: Arc<dyn Decompressor>) {
        self.decompressors
            .insert(decompressor.message_encoding(), decompressor);
    }

    /// Look up a compressor by encoding name.
    pub fn compressor(
        &self,
        name: &str,
    ) -> std::result::Result<Arc<dyn Compressor>, ExtensionError> {
        self.compressors.get(name).cloned().ok_or(ExtensionError {
            kind: "compressor",
            name: name.to_owned(),
        })
    }

    /// Look up a decompressor by encoding name.
    pub fn decompressor(
        &self,
        name: &str,
    ) -> std::result::Result<Arc<dyn Decompressor>, ExtensionError> {
        self.decompressors.get(name).cloned().ok_or(ExtensionError {
            kind: "decompressor",
            name: name.to_owned(),
        })
    }
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionRegistry")
            .field("compressors", &self.compressors.keys().collect::<Vec<_>>())
            .field(
                "decompressors",
                &self.decompressors.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(c: &dyn Compressor, d: &dyn Decompressor, payload: &[u8]) {
        let compressed = c.compress(payload).unwrap();
        let restored = d.decompress(&compressed).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn builtin_codecs_round_trip() {
        let payloads: [&[u8]; 3] = [b"", b"hello world", &[0u8; 70_000]];
        for payload in payloads {
            round_trip(&Identity, &Identity, payload);
            round_trip(&Gzip, &Gzip, payload);
            round_trip(&Bzip2, &Bzip2, payload);
        }
    }

    #[test]
    fn gzip_actually_shrinks_repetitive_input() {
        let payload = vec![b'a'; 100_000];
        let compressed = Gzip.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len() / 10);
    }

    #[test]
    fn unknown_name_is_an_extension_error() {
        let registry = CompressionRegistry::new();
        let err = registry.compressor("zstd").unwrap_err();
        assert_eq!(err.name, "zstd");
        let status: RpcStatus = err.into();
        assert_eq!(status.code(), RpcCode::Unimplemented);
    }

    #[test]
    fn builtin_names_resolve() {
        let registry = CompressionRegistry::new();
        for name in [IDENTITY, "gzip", "bzip2"] {
            assert_eq!(registry.compressor(name).unwrap().message_encoding(), name);
            assert_eq!(
                registry.decompressor(name).unwrap().message_encoding(),
                name
            );
        }
    }
}
