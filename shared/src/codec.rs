//! Envelope and event codecs.
//!
//! Two interchangeable wire formats carry every tunnel message: a compact
//! bincode form sent as binary websocket frames and a JSON form sent as
//! text frames. Both ends of a tunnel must agree on the format.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Compact bincode encoding, binary frames.
    #[default]
    Binary,
    /// Human-readable JSON encoding, text frames.
    Json,
}

impl WireFormat {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireFormat::Binary => Ok(bincode::serialize(value)?),
            WireFormat::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            WireFormat::Binary => Ok(bincode::deserialize(data)?),
            WireFormat::Json => Ok(serde_json::from_slice(data)?),
        }
    }

    /// Whether messages go out as binary or text websocket frames.
    pub fn is_binary(&self) -> bool {
        matches!(self, WireFormat::Binary)
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "binary" => Ok(WireFormat::Binary),
            "json" => Ok(WireFormat::Json),
            other => Err(format!("unknown wire format '{other}', expected 'binary' or 'json'")),
        }
    }
}
