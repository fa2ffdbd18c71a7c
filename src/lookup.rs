//! # Distributed Lookup
//!
//! Best-effort key resolution across the mesh. Local storage is consulted
//! first; after that every other nest in the local topology view is a
//! candidate, asked one at a time in random order through the router. A
//! candidate that fails, times out or has no route counts as a miss, so one
//! unreachable nest never aborts the lookup.

use std::collections::HashSet;

use anyhow::Result;
use futures::future::try_join_all;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::messages::{self, STORAGE};
use crate::nest::Nest;

impl Nest {
    /// Read `key` at the nest `source`: a local read when `source` is this
    /// nest, a routed `storage` request otherwise. `None` when absent.
    pub async fn any_storage(&self, source: &str, key: &str) -> Result<Option<Value>> {
        if source == self.name() {
            return Ok(self.read_local(key).await);
        }
        let value = self.route_request(source, STORAGE, Value::from(key)).await?;
        Ok((!value.is_null()).then_some(value))
    }

    /// Resolve `key` from local storage or any other known nest.
    ///
    /// Fails with [`MeshError::NotFound`] once every candidate has been
    /// asked without a non-null answer.
    pub async fn find_in_storage(&self, key: &str) -> Result<Value> {
        if let Some(value) = self.read_local(key).await {
            return Ok(value);
        }

        let mut candidates: Vec<String> = self
            .network()
            .await
            .into_iter()
            .filter(|name| name != self.name())
            .collect();

        while !candidates.is_empty() {
            let picked = self.random_index(candidates.len()).await;
            let source = candidates.swap_remove(picked);
            match self.any_storage(&source, key).await {
                Ok(Some(value)) => {
                    debug!(nest = %self.name(), key, source = %source, "found value");
                    return Ok(value);
                }
                Ok(None) => trace!(nest = %self.name(), key, source = %source, "not stored there"),
                Err(e) => debug!(
                    nest = %self.name(),
                    key,
                    source = %source,
                    error = %e,
                    "lookup source failed"
                ),
            }
        }

        Err(MeshError::NotFound { key: key.to_string() }.into())
    }

    /// Ask every known nest, this one included, for `key` at once.
    ///
    /// Pairs come back in [`Nest::network`] order. Any single failure fails
    /// the whole collection.
    pub async fn collect_from_network(&self, key: &str) -> Result<Vec<(String, Option<Value>)>> {
        let sources = self.network().await;
        let reads = sources.into_iter().map(|source| async move {
            let value = self.any_storage(&source, key).await?;
            Ok::<_, anyhow::Error>((source, value))
        });
        try_join_all(reads).await
    }

    /// Chase a chain of nest names stored under `key`, starting here, until a
    /// nest names itself. Returns that nest's name.
    pub async fn follow_pointer(&self, key: &str) -> Result<String> {
        let mut at = self.name().to_string();
        let mut visited = HashSet::from([at.clone()]);

        loop {
            let value = self.any_storage(&at, key).await?;
            let Some(next) = value.as_ref().and_then(Value::as_str) else {
                return Err(MeshError::NotFound { key: key.to_string() }.into());
            };
            if next == at {
                return Ok(at);
            }
            if !visited.insert(next.to_string()) {
                return Err(MeshError::PointerCycle {
                    key: key.to_string(),
                    at: next.to_string(),
                }
                .into());
            }
            trace!(nest = %self.name(), key, from = %at, to = next, "following pointer");
            at = next.to_string();
        }
    }
}

pub(crate) async fn handle_storage(nest: Nest, payload: Value, _source: String) -> Result<Value> {
    let key = messages::expect_str(STORAGE, &payload)?;
    Ok(nest.read_local(key).await.unwrap_or(Value::Null))
}
