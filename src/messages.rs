//! # Wire Contracts
//!
//! Request-type names and payload shapes shared by every nest. Payloads are
//! carried as `serde_json::Value`; structured request types decode into the
//! typed records below.
//!
//! | Type | Payload | Response |
//! |------|---------|----------|
//! | `ping` | none | `"pong"` |
//! | `note` | string | acknowledgement text |
//! | `gossip` | string | none |
//! | `connections` | [`ConnectionsPayload`] | none |
//! | `route` | [`RoutePayload`] | response of the forwarded type |
//! | `storage` | key string | stored value or `null` |

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::MeshError;

pub const PING: &str = "ping";
pub const NOTE: &str = "note";
pub const GOSSIP: &str = "gossip";
pub const CONNECTIONS: &str = "connections";
pub const ROUTE: &str = "route";
pub const STORAGE: &str = "storage";

/// A nest announcing (or relaying) the neighbor list of `name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsPayload {
    pub name: String,
    pub neighbors: Vec<String>,
}

/// A request to be carried hop by hop until `target` is a direct neighbor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutePayload {
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
}

/// Decode a structured payload, mapping serde failures to `MalformedPayload`.
pub fn decode<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, MeshError> {
    serde_json::from_value(payload).map_err(|e| MeshError::malformed(kind, e))
}

/// Encode a structured payload.
pub fn encode<T: Serialize>(kind: &str, payload: &T) -> Result<Value, MeshError> {
    serde_json::to_value(payload).map_err(|e| MeshError::malformed(kind, e))
}

/// Borrow a string payload (`note`, `gossip`, `storage`).
pub fn expect_str<'a>(kind: &str, payload: &'a Value) -> Result<&'a str, MeshError> {
    payload
        .as_str()
        .ok_or_else(|| MeshError::malformed(kind, format!("expected a string, got {payload}")))
}
