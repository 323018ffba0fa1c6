//! Trirpc is a Dubbo-compatible RPC runtime speaking the Triple wire
//! protocol (gRPC over HTTP/2).
//!
//! This crate re-exports [`trirpc_core`]; the protocol engine is documented
//! there.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub use trirpc_core as core;
#[doc(no_inline)]
pub use trirpc_core::*;

/// The usual imports for applications built on trirpc.
pub mod prelude {
    #[doc(no_inline)]
    pub use trirpc_core::prelude::*;
}
