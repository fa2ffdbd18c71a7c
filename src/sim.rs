//! # Simulated Mesh
//!
//! An in-memory [`Transport`] and the wiring that puts nests on it.
//!
//! [`SimNetwork`] behaves like an unreliable radio between neighboring
//! nests: every message waits a random latency in each direction, requests
//! and responses can be lost, and nests marked unreachable never answer. A
//! lost message simply never completes, which is what the reliable request
//! layer retries around. The receiving handler runs in its own task, so a
//! sender that gives up never cancels work already underway at the receiver.
//!
//! [`MeshBuilder`] creates one [`Nest`] per name in an edge list, registers
//! every nest with the network and only then starts them, so the first
//! topology announcements always find their receivers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::error::MeshError;
use crate::nest::{MeshConfig, Nest, WeakNest};
use crate::protocols::Transport;
use crate::registry::RequestRegistry;
use crate::state::Connections;
use crate::storage::MemoryStorage;

/// Shortest one-way delay of a simulated link.
pub const DEFAULT_MIN_LATENCY: Duration = Duration::from_millis(5);

/// Longest one-way delay of a simulated link.
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(25);

/// Probability that a single request or response is lost.
pub const DEFAULT_DROP_RATE: f64 = 0.0;

/// Deliveries kept in the log; older entries are discarded first.
pub const DEFAULT_DELIVERY_LOG_SIZE: usize = 10_000;

/// Poll interval of [`Mesh::wait_for_convergence`].
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Loss probability per message and direction, in `0.0..=1.0`.
    pub drop_rate: f64,
    /// Seed for latency and loss. `None` draws from the OS.
    pub seed: Option<u64>,
    /// Most recent deliveries kept by [`SimNetwork::deliveries`]. `0` keeps none.
    pub delivery_log_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            min_latency: DEFAULT_MIN_LATENCY,
            max_latency: DEFAULT_MAX_LATENCY,
            drop_rate: DEFAULT_DROP_RATE,
            seed: None,
            delivery_log_size: DEFAULT_DELIVERY_LOG_SIZE,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_latency > self.max_latency {
            bail!(
                "min_latency {:?} exceeds max_latency {:?}",
                self.min_latency,
                self.max_latency
            );
        }
        if !(0.0..=1.0).contains(&self.drop_rate) {
            bail!("drop_rate must be within 0.0..=1.0, got {}", self.drop_rate);
        }
        Ok(())
    }
}

/// One request that reached its receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub kind: String,
}

pub struct SimNetwork {
    config: SimConfig,
    nests: RwLock<HashMap<String, WeakNest>>,
    unreachable: RwLock<HashSet<String>>,
    rng: Mutex<StdRng>,
    deliveries: Mutex<VecDeque<Delivery>>,
}

/// Fate of one request/response exchange, drawn up front.
struct LinkFate {
    outbound: Duration,
    request_lost: bool,
    inbound: Duration,
    response_lost: bool,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            nests: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            rng: Mutex::new(rng),
            deliveries: Mutex::new(VecDeque::new()),
        }
    }

    /// Make `nest` addressable by name. The network holds it weakly.
    pub async fn register(&self, nest: &Nest) {
        self.nests
            .write()
            .await
            .insert(nest.name().to_string(), nest.downgrade());
    }

    /// While `unreachable`, requests to `name` are swallowed without answer.
    pub async fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut set = self.unreachable.write().await;
        if unreachable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// The most recent deliveries, oldest first, at most
    /// [`SimConfig::delivery_log_size`] of them.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.iter().cloned().collect()
    }

    pub async fn clear_deliveries(&self) {
        self.deliveries.lock().await.clear();
    }

    async fn record(&self, delivery: Delivery) {
        let capacity = self.config.delivery_log_size;
        if capacity == 0 {
            return;
        }
        let mut log = self.deliveries.lock().await;
        while log.len() >= capacity {
            log.pop_front();
        }
        log.push_back(delivery);
    }

    async fn lookup(&self, name: &str) -> Result<Nest> {
        self.nests
            .read()
            .await
            .get(name)
            .and_then(WeakNest::upgrade)
            .with_context(|| format!("no nest named {name} on this network"))
    }

    async fn draw_fate(&self) -> LinkFate {
        let mut rng = self.rng.lock().await;
        let (min, max) = (self.config.min_latency, self.config.max_latency);
        let mut latency = || {
            if min == max {
                min
            } else {
                rng.random_range(min..=max)
            }
        };
        let outbound = latency();
        let inbound = latency();
        let drop_rate = self.config.drop_rate.clamp(0.0, 1.0);
        LinkFate {
            outbound,
            request_lost: drop_rate > 0.0 && rng.random_bool(drop_rate),
            inbound,
            response_lost: drop_rate > 0.0 && rng.random_bool(drop_rate),
        }
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn send(&self, from: &str, target: &str, kind: &str, payload: Value) -> Result<Value> {
        let sender = self.lookup(from).await?;
        if !sender.is_neighbor(target) {
            return Err(MeshError::NotNeighbor {
                from: from.to_string(),
                target: target.to_string(),
            }
            .into());
        }
        let receiver = self.lookup(target).await?;
        let fate = self.draw_fate().await;

        tokio::time::sleep(fate.outbound).await;
        if fate.request_lost || self.unreachable.read().await.contains(target) {
            trace!(from, to = target, kind, "request lost");
            return std::future::pending().await;
        }

        self.record(Delivery {
            from: from.to_string(),
            to: target.to_string(),
            kind: kind.to_string(),
        })
        .await;

        let (tx, rx) = oneshot::channel();
        let source = from.to_string();
        let kind_owned = kind.to_string();
        tokio::spawn(async move {
            let result = receiver.handle_request(&kind_owned, payload, &source).await;
            let _ = tx.send(result);
        });
        let result = rx
            .await
            .with_context(|| format!("{target} dropped the {kind:?} request"))?;

        tokio::time::sleep(fate.inbound).await;
        if fate.response_lost {
            trace!(from = target, to = from, kind, "response lost");
            return std::future::pending().await;
        }
        result
    }
}

/// Undirected edges to per-nest neighbor lists, in order of first
/// appearance. Duplicate edges and self-loops are ignored.
pub fn adjacency(edges: &[(String, String)]) -> Vec<(String, Vec<String>)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut nests: Vec<(String, Vec<String>)> = Vec::new();

    for (a, b) in edges {
        if a == b {
            continue;
        }
        for name in [a, b] {
            if !index.contains_key(name.as_str()) {
                index.insert(name.as_str(), nests.len());
                nests.push((name.clone(), Vec::new()));
            }
        }
        for (from, to) in [(a, b), (b, a)] {
            let neighbors = &mut nests[index[from.as_str()]].1;
            if !neighbors.contains(to) {
                neighbors.push(to.clone());
            }
        }
    }
    nests
}

/// Parse an edge list with one `Name-Name` pair per line. Blank lines and
/// everything after a `#` are ignored.
pub fn parse_edges(text: &str) -> Result<Vec<(String, String)>> {
    let mut edges = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let Some((a, b)) = line.split_once('-') else {
            bail!("line {}: expected `Name-Name`, got {line:?}", number + 1);
        };
        let (a, b) = (a.trim(), b.trim());
        if a.is_empty() || b.is_empty() {
            bail!("line {}: empty nest name in {line:?}", number + 1);
        }
        edges.push((a.to_string(), b.to_string()));
    }
    Ok(edges)
}

const CROW_TECH: &[(&str, &str)] = &[
    ("Church Tower", "Sportsgrounds"),
    ("Church Tower", "Big Maple"),
    ("Big Maple", "Sportsgrounds"),
    ("Big Maple", "Woods"),
    ("Big Maple", "Fabienne's Garden"),
    ("Fabienne's Garden", "Woods"),
    ("Fabienne's Garden", "Cow Pasture"),
    ("Cow Pasture", "Big Oak"),
    ("Big Oak", "Butcher Shop"),
    ("Butcher Shop", "Tall Poplar"),
    ("Tall Poplar", "Sportsgrounds"),
    ("Tall Poplar", "Chateau"),
    ("Chateau", "Great Pine"),
    ("Great Pine", "Jacques' Farm"),
    ("Jacques' Farm", "Hawthorn"),
    ("Great Pine", "Hawthorn"),
    ("Hawthorn", "Gilles' Garden"),
    ("Great Pine", "Gilles' Garden"),
    ("Gilles' Garden", "Big Oak"),
    ("Gilles' Garden", "Butcher Shop"),
    ("Chateau", "Butcher Shop"),
];

/// The crow village used by the demo binary.
pub fn crow_tech_edges() -> Vec<(String, String)> {
    CROW_TECH
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

#[derive(Default)]
pub struct MeshBuilder {
    edges: Vec<(String, String)>,
    registry: Option<RequestRegistry>,
    storage: HashMap<String, Vec<(String, Value)>>,
    config: MeshConfig,
    sim: SimConfig,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.edges.push((a.into(), b.into()));
        self
    }

    pub fn edges(mut self, edges: impl IntoIterator<Item = (String, String)>) -> Self {
        self.edges.extend(edges);
        self
    }

    /// Use `registry` instead of [`RequestRegistry::with_default_types`].
    pub fn registry(mut self, registry: RequestRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Pre-load `key = value` into the storage of `nest`.
    pub fn store(mut self, nest: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        self.storage
            .entry(nest.into())
            .or_default()
            .push((key.into(), value));
        self
    }

    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sim_config(mut self, sim: SimConfig) -> Self {
        self.sim = sim;
        self
    }

    /// Create, register and start every nest.
    pub async fn build(mut self) -> Result<Mesh> {
        self.config.validate()?;
        self.sim.validate()?;

        let wiring = adjacency(&self.edges);
        if wiring.is_empty() {
            bail!("a mesh needs at least one edge");
        }
        if let Some(stray) = self
            .storage
            .keys()
            .find(|name| !wiring.iter().any(|(n, _)| n == *name))
        {
            bail!("storage given for {stray}, which is not part of the mesh");
        }

        let network = Arc::new(SimNetwork::new(self.sim.clone()));
        let registry = Arc::new(
            self.registry
                .take()
                .unwrap_or_else(RequestRegistry::with_default_types),
        );

        let mut nests = Vec::with_capacity(wiring.len());
        for (name, neighbors) in wiring {
            let entries = self.storage.remove(&name).unwrap_or_default();
            let nest = Nest::new(
                name,
                neighbors,
                network.clone(),
                Arc::new(MemoryStorage::with_entries(entries)),
                registry.clone(),
                self.config.clone(),
            );
            network.register(&nest).await;
            nests.push(nest);
        }

        for nest in &nests {
            nest.start().await?;
        }
        info!(nests = nests.len(), "mesh started");

        Ok(Mesh { nests, network })
    }
}

/// Owns the nests of a simulated mesh.
pub struct Mesh {
    nests: Vec<Nest>,
    network: Arc<SimNetwork>,
}

impl Mesh {
    pub fn builder() -> MeshBuilder {
        MeshBuilder::new()
    }

    pub fn nest(&self, name: &str) -> Option<&Nest> {
        self.nests.iter().find(|nest| nest.name() == name)
    }

    /// Nests in order of first appearance in the edge list.
    pub fn nests(&self) -> &[Nest] {
        &self.nests
    }

    pub fn sim(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    pub async fn set_unreachable(&self, name: &str, unreachable: bool) {
        self.network.set_unreachable(name, unreachable).await;
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.network.deliveries().await
    }

    /// The real wiring, as every view should eventually hold it.
    pub fn wiring(&self) -> Connections {
        self.nests
            .iter()
            .map(|nest| (nest.name().to_string(), nest.neighbors().to_vec()))
            .collect()
    }

    /// Whether every nest's topology view equals the real wiring.
    pub async fn is_converged(&self) -> bool {
        let wiring = self.wiring();
        for nest in &self.nests {
            if nest.connections().await != wiring {
                return false;
            }
        }
        true
    }

    /// Poll until [`Mesh::is_converged`] holds, or fail after `timeout`.
    pub async fn wait_for_convergence(&self, timeout: Duration) -> Result<()> {
        let poll = async {
            while !self.is_converged().await {
                tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .with_context(|| format!("topology did not converge within {timeout:?}"))?;
        debug!(nests = self.nests.len(), "topology converged");
        Ok(())
    }

    pub async fn shutdown(&self) {
        for nest in &self.nests {
            nest.shutdown().await;
        }
    }
}
