//! Trait seams for the collaborators the mesh is built on.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Transport`] | deliver one request to a direct neighbor |
//! | [`Storage`] | a nest's local key/value read primitive |
//!
//! Everything above these traits (retry, gossip, topology, routing, lookup)
//! is transport-agnostic, so tests can swap in recording or silent mocks.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Single-hop delivery of a typed request.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `(kind, payload)` from `from` to its neighbor `target` and
    /// return the response.
    ///
    /// The future resolves at most once. An unreliable transport may never
    /// resolve it (a lost message); callers bound that with their own timers.
    async fn send(&self, from: &str, target: &str, kind: &str, payload: Value) -> Result<Value>;
}

/// Local storage read primitive of one nest.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Read `key`, returning `None` when nothing is stored under it.
    async fn read(&self, key: &str) -> Option<Value>;
}
