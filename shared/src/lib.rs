//! Backstream shared library
//!
//! Wire protocol, codecs, the tunnel connection and the connection pool
//! used by both the edge proxy and the backend agent.

pub mod codec;
pub mod conn;
pub mod convert;
pub mod error;
pub mod pool;
pub mod protocol;

pub use error::{Error, Result};

/// Header carrying the tenant identifier, read on tunnel upgrade and on
/// every proxy request.
pub const HEADER_CLIENT_ID: &str = "x-backstream-client-id";

/// Optional header bounding a single proxy exchange (e.g. "1500ms", "2s").
pub const HEADER_REQUEST_TIMEOUT: &str = "x-backstream-request-timeout";
