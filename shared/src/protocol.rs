//! Wire types for tunnel communication.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum message size accepted from a peer (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Envelope variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Fire-and-forget, never replied to.
    Notify,
    /// Expects a `Response` carrying the same id.
    Request,
    /// Answers the `Request` with the same id.
    Response,
}

/// Envelope around an opaque payload, tagged with a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Header multimap: per-key value order and duplicates are preserved; the
/// ordered map keeps re-encoding deterministic.
pub type Headers = BTreeMap<String, Vec<String>>;

/// One HTTP request crossing the tunnel. Path and query stay
/// percent-encoded exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHttpRequest {
    pub method: String,
    pub raw_path: String,
    pub raw_query: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

/// One HTTP response crossing the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}
