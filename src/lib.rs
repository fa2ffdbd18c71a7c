//! # Rookery - Crow-Nest Mesh Messaging
//!
//! Rookery simulates a village of named nests joined by fixed neighbor
//! links. On top of a bare, lossy send primitive it layers:
//!
//! - **Reliable requests**: bounded retry with a per-attempt timer
//! - **Typed dispatch**: one shared registry of request handlers
//! - **Gossip**: flooding with per-nest loop suppression
//! - **Topology**: every nest converges on a view of the whole graph
//! - **Routing**: breadth-first next-hop planning and hop-by-hop forwarding
//! - **Lookup**: randomized failover search of every nest's storage
//!
//! ## Architecture
//!
//! Each [`Nest`] is a cheap-to-clone handle. Its mutable state (the gossip
//! seen-set and the topology view) is owned by a private actor task and
//! changed only through commands processed in order, so concurrent handlers
//! on one nest never race. Transports and storage plug in through the traits
//! in `protocols`; `sim` provides the in-memory versions.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `nest` | The `Nest` handle and `MeshConfig` |
//! | `state` | Per-nest state actor |
//! | `registry` | Request type to handler mapping and dispatch |
//! | `reliable` | Request with retry and timeout, neighbor liveness |
//! | `gossip` | Loop-suppressed flooding |
//! | `topology` | Connections broadcast until convergence |
//! | `router` | `find_route` and multi-hop forwarding |
//! | `lookup` | Distributed storage lookup, fan-out, pointer chasing |
//! | `storage` | In-memory storage |
//! | `sim` | Simulated lossy network and mesh builder |
//! | `protocols` | `Transport` and `Storage` trait definitions |
//! | `messages` | Request type names and wire payloads |
//! | `error` | `MeshError` |

mod error;
mod gossip;
mod lookup;
mod messages;
mod nest;
mod protocols;
mod registry;
mod reliable;
mod router;
mod sim;
mod state;
mod storage;
mod topology;

pub use error::MeshError;
pub use messages::{
    ConnectionsPayload, RoutePayload, CONNECTIONS, GOSSIP, NOTE, PING, ROUTE, STORAGE,
};
pub use nest::{
    MeshConfig, Nest, ReceivedGossip, DEFAULT_GOSSIP_CHANNEL_SIZE, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_INTERVAL,
};
pub use protocols::{Storage, Transport};
pub use registry::{Handler, HandlerFuture, RequestRegistry};
pub use router::find_route;
pub use sim::{
    adjacency, crow_tech_edges, parse_edges, Delivery, Mesh, MeshBuilder, SimConfig, SimNetwork,
    DEFAULT_DELIVERY_LOG_SIZE, DEFAULT_DROP_RATE, DEFAULT_MAX_LATENCY, DEFAULT_MIN_LATENCY,
};
pub use state::Connections;
pub use storage::MemoryStorage;
