//! # Nest Handle
//!
//! A [`Nest`] is one named participant of the mesh: fixed neighbor links,
//! private state, and shared access to the transport, its local storage and
//! the request registry. The handle is cheap to clone; handlers receive a
//! clone of the nest they run on.
//!
//! The protocol operations live next to their components as further
//! `impl Nest` blocks:
//!
//! | Module | Operations |
//! |--------|-----------|
//! | `reliable` | `request`, `neighbor_liveness`, `available_neighbors` |
//! | `gossip` | `broadcast_gossip` |
//! | `topology` | `start`, `broadcast_connections` |
//! | `router` | `route_request`, `next_hop` |
//! | `lookup` | `find_in_storage`, `any_storage`, `collect_from_network`, `follow_pointer` |

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::protocols::{Storage, Transport};
use crate::registry::RequestRegistry;
use crate::state::{Connections, NestState};

/// Interval after which an unanswered attempt is retried.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Attempts per reliable request before it fails with a timeout.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Capacity of the per-nest queue of received gossip.
pub const DEFAULT_GOSSIP_CHANNEL_SIZE: usize = 1000;

/// Tunables shared by every nest of a mesh.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Per-attempt timer of a reliable request.
    pub retry_interval: Duration,
    /// Attempts before a reliable request is rejected with a timeout.
    pub max_attempts: u32,
    /// Received gossip beyond this many unread events is dropped from the queue.
    pub gossip_channel_size: usize,
    /// Seed for the per-nest candidate RNG. `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            gossip_channel_size: DEFAULT_GOSSIP_CHANNEL_SIZE,
            seed: None,
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.retry_interval.is_zero() {
            bail!("retry_interval must be non-zero");
        }
        if self.gossip_channel_size == 0 {
            bail!("gossip_channel_size must be non-zero");
        }
        Ok(())
    }
}

/// A gossip message delivered to this nest for the first time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedGossip {
    pub message: String,
    /// The neighbor it arrived from.
    pub from: String,
}

/// A receiver that can be taken exactly once.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Clone)]
pub struct Nest {
    inner: Arc<NestInner>,
}

struct NestInner {
    name: String,
    neighbors: Vec<String>,
    state: NestState,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    registry: Arc<RequestRegistry>,
    config: MeshConfig,
    rng: Mutex<StdRng>,
    gossip_tx: mpsc::Sender<ReceivedGossip>,
    gossip_rx: TakeOnce<ReceivedGossip>,
}

impl Nest {
    /// Create a nest and spawn its state actor. Must be called inside a
    /// tokio runtime.
    ///
    /// The nest does not announce itself until [`Nest::start`] is called, so
    /// a whole mesh can be wired before any traffic flows.
    pub fn new(
        name: impl Into<String>,
        neighbors: Vec<String>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        registry: Arc<RequestRegistry>,
        config: MeshConfig,
    ) -> Self {
        let name = name.into();
        let state = NestState::spawn(&name, &neighbors);
        let rng = nest_rng(&name, config.seed);
        let (gossip_tx, gossip_rx) = mpsc::channel(config.gossip_channel_size.max(1));

        Self {
            inner: Arc::new(NestInner {
                name,
                neighbors,
                state,
                transport,
                storage,
                registry,
                config,
                rng: Mutex::new(rng),
                gossip_tx,
                gossip_rx: Mutex::new(Some(gossip_rx)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn neighbors(&self) -> &[String] {
        &self.inner.neighbors
    }

    pub fn is_neighbor(&self, name: &str) -> bool {
        self.inner.neighbors.iter().any(|n| n == name)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.inner.registry
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn state(&self) -> &NestState {
        &self.inner.state
    }

    /// Inbound entry point: run the handler registered for `kind` as this
    /// nest, on behalf of the neighbor `source`.
    pub async fn handle_request(&self, kind: &str, payload: Value, source: &str) -> Result<Value> {
        trace!(nest = %self.name(), kind, source, "inbound request");
        self.inner.registry.dispatch(self, kind, payload, source).await
    }

    /// Snapshot of this nest's believed topology.
    pub async fn connections(&self) -> Connections {
        self.inner.state.snapshot().await
    }

    /// Names of every nest this nest knows about, itself included, sorted.
    pub async fn network(&self) -> Vec<String> {
        self.connections().await.into_keys().collect()
    }

    pub async fn has_seen(&self, message: &str) -> bool {
        self.inner.state.has_seen(message).await
    }

    /// Read `key` from this nest's own storage. A stored `null` reads as
    /// absent.
    pub async fn read_local(&self, key: &str) -> Option<Value> {
        self.inner
            .storage
            .read(key)
            .await
            .filter(|value| !value.is_null())
    }

    /// Take the receiver of gossip delivered to this nest. Returns `None`
    /// after the first call.
    pub async fn messages(&self) -> Option<mpsc::Receiver<ReceivedGossip>> {
        self.inner.gossip_rx.lock().await.take()
    }

    pub(crate) fn report_gossip(&self, message: &str, from: &str) {
        let event = ReceivedGossip {
            message: message.to_string(),
            from: from.to_string(),
        };
        if self.inner.gossip_tx.try_send(event).is_err() {
            trace!(nest = %self.name(), "gossip queue full or unread, event dropped");
        }
    }

    /// Uniform index in `0..len` from this nest's RNG. `len` must be non-zero.
    pub(crate) async fn random_index(&self, len: usize) -> usize {
        self.inner.rng.lock().await.random_range(0..len)
    }

    /// Stop the state actor. Later state operations fail or return empty views.
    pub async fn shutdown(&self) {
        self.inner.state.quit().await;
    }

    pub(crate) fn downgrade(&self) -> WeakNest {
        WeakNest(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Nest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nest")
            .field("name", &self.inner.name)
            .field("neighbors", &self.inner.neighbors)
            .finish()
    }
}

/// Non-owning reference held by transports, so a nest and the network that
/// delivers to it do not keep each other alive.
#[derive(Clone)]
pub(crate) struct WeakNest(Weak<NestInner>);

impl WeakNest {
    pub(crate) fn upgrade(&self) -> Option<Nest> {
        self.0.upgrade().map(|inner| Nest { inner })
    }
}

fn nest_rng(name: &str, seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => {
            let digest = blake3::hash(name.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest.as_bytes()[..8]);
            StdRng::seed_from_u64(seed ^ u64::from_le_bytes(bytes))
        }
        None => StdRng::from_os_rng(),
    }
}
