//! Failure kinds surfaced by the mesh protocols.
//!
//! Operations return `anyhow::Result`; protocol failures are wrapped
//! `MeshError` values that callers recover with `downcast_ref`. Errors raised
//! by application handlers travel unchanged as the rejection reason.

use std::fmt;

/// Structured failure kinds of the mesh layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// A reliable request used every attempt without any response.
    Timeout { target: String, attempts: u32 },
    /// No path to the target exists in the local topology view.
    /// Raised while planning, before anything is sent.
    NoRoute { target: String },
    /// Every known source was asked for the key and none had it.
    NotFound { key: String },
    /// No handler is registered for the request type.
    UnknownType(String),
    /// A payload did not match the wire contract of its request type.
    MalformedPayload { kind: String, reason: String },
    /// The transport was asked to deliver to a nest that is not a direct neighbor.
    NotNeighbor { from: String, target: String },
    /// A handler task panicked instead of producing a result.
    HandlerPanicked { kind: String },
    /// Pointer chasing came back to a nest it had already visited.
    PointerCycle { key: String, at: String },
}

impl MeshError {
    pub fn malformed(kind: &str, reason: impl fmt::Display) -> Self {
        Self::MalformedPayload {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns the `MeshError` carried by an `anyhow::Error`, if any.
    pub fn of(err: &anyhow::Error) -> Option<&MeshError> {
        err.downcast_ref::<MeshError>()
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { target, attempts } => {
                write!(f, "request to {target} timed out after {attempts} attempts")
            }
            Self::NoRoute { target } => write!(f, "no route to {target}"),
            Self::NotFound { key } => write!(f, "{key:?} not found in any known storage"),
            Self::UnknownType(kind) => write!(f, "unknown request type {kind:?}"),
            Self::MalformedPayload { kind, reason } => {
                write!(f, "malformed {kind:?} payload: {reason}")
            }
            Self::NotNeighbor { from, target } => {
                write!(f, "{target} is not a neighbor of {from}")
            }
            Self::HandlerPanicked { kind } => write!(f, "handler for {kind:?} panicked"),
            Self::PointerCycle { key, at } => {
                write!(f, "pointer chain for {key:?} loops back to {at}")
            }
        }
    }
}

impl std::error::Error for MeshError {}
