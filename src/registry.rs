//! Request registry: maps request-type names to handlers.
//!
//! One registry is shared by every nest of a mesh, so a request type means
//! the same thing everywhere. Handlers run in their own task: a handler that
//! fails or panics produces exactly one failed result and never takes the
//! dispatching nest down with it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::messages::{self, NOTE, PING};
use crate::nest::Nest;
use crate::{gossip, lookup, router, topology};

pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// A request handler: `(nest it runs on, payload, source neighbor) -> response`.
pub type Handler = Arc<dyn Fn(Nest, Value, String) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct RequestRegistry {
    handlers: HashMap<String, Handler>,
}

impl RequestRegistry {
    /// A registry with no request types.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the mesh's built-in request types: `ping`, `note`,
    /// `gossip`, `connections`, `route` and `storage`.
    pub fn with_default_types() -> Self {
        let mut registry = Self::new();
        registry.register_sync_type(PING, |_, _, _| Ok(Value::from("pong")));
        registry.register_sync_type(NOTE, handle_note);
        registry.register_type(messages::GOSSIP, gossip::handle_gossip);
        registry.register_type(messages::CONNECTIONS, topology::handle_connections);
        registry.register_type(messages::ROUTE, router::handle_route);
        registry.register_type(messages::STORAGE, lookup::handle_storage);
        registry
    }

    /// Register an asynchronous handler, replacing any existing one.
    pub fn register_type<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Nest, Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        debug!("registering handler for request type {name}");
        let handler: Handler =
            Arc::new(move |nest, payload, source| handler(nest, payload, source).boxed());
        self.handlers.insert(name.to_string(), handler);
    }

    /// Register a synchronous handler, replacing any existing one.
    pub fn register_sync_type<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&Nest, Value, &str) -> Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register_type(name, move |nest, payload, source| {
            let handler = handler.clone();
            async move { handler(&nest, payload, &source) }
        });
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn type_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `kind` as `nest`. Unknown types fail with
    /// [`MeshError::UnknownType`]; a panicking handler fails with
    /// [`MeshError::HandlerPanicked`].
    pub async fn dispatch(
        &self,
        nest: &Nest,
        kind: &str,
        payload: Value,
        source: &str,
    ) -> Result<Value> {
        let Some(handler) = self.handlers.get(kind).cloned() else {
            warn!(nest = %nest.name(), kind, source, "no handler for request type");
            return Err(MeshError::UnknownType(kind.to_string()).into());
        };

        let nest = nest.clone();
        let source = source.to_string();
        let task = tokio::spawn(async move { handler(nest, payload, source).await });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(MeshError::HandlerPanicked {
                kind: kind.to_string(),
            }
            .into()),
            Err(_) => Err(anyhow!("handler for {kind:?} was cancelled")),
        }
    }
}

fn handle_note(nest: &Nest, payload: Value, source: &str) -> Result<Value> {
    let note = messages::expect_str(NOTE, &payload)?;
    info!(nest = %nest.name(), from = source, "received note: {note}");
    Ok(Value::from(format!("Message received by {}", nest.name())))
}
