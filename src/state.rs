//! Per-nest mutable state.
//!
//! A nest's gossip seen-set and its view of the topology are owned by a
//! private actor task. [`NestState`] is the cheap-to-clone handle; every
//! mutation is a command processed sequentially by the actor, so handlers
//! running concurrently on the same nest never race on a check-then-insert.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Command channel capacity for the state actor.
const STATE_COMMAND_CHANNEL_SIZE: usize = 256;

/// Believed topology: nest name to its ordered neighbor list.
pub type Connections = BTreeMap<String, Vec<String>>;

enum Command {
    /// Insert a gossip message, replying whether it was new.
    MarkSeen(String, oneshot::Sender<bool>),
    HasSeen(String, oneshot::Sender<bool>),
    GetConnections(String, oneshot::Sender<Option<Vec<String>>>),
    /// Replace the neighbor list of a nest, replying whether anything changed.
    LearnConnections {
        name: String,
        neighbors: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    Snapshot(oneshot::Sender<Connections>),
    Quit,
}

#[derive(Clone)]
pub struct NestState {
    cmd_tx: mpsc::Sender<Command>,
}

impl NestState {
    /// Spawn the state actor for `name`, seeding its own topology entry.
    pub fn spawn(name: &str, neighbors: &[String]) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(STATE_COMMAND_CHANNEL_SIZE);
        let mut connections = Connections::new();
        connections.insert(name.to_string(), neighbors.to_vec());
        let actor = StateActor {
            name: name.to_string(),
            gossip_seen: HashSet::new(),
            connections,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Record `message` as seen. Returns `true` only for the first caller.
    pub async fn mark_seen(&self, message: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::MarkSeen(message.to_string(), tx))
            .await
            .map_err(|_| anyhow!("nest state actor closed"))?;
        rx.await.map_err(|_| anyhow!("nest state actor closed"))
    }

    pub async fn has_seen(&self, message: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HasSeen(message.to_string(), tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn connections_of(&self, name: &str) -> Option<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetConnections(name.to_string(), tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Store `neighbors` for `name` unless the stored list is already equal.
    /// Returns `true` when the view changed.
    pub async fn learn_connections(&self, name: &str, neighbors: Vec<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LearnConnections {
                name: name.to_string(),
                neighbors,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("nest state actor closed"))?;
        rx.await.map_err(|_| anyhow!("nest state actor closed"))
    }

    pub async fn snapshot(&self) -> Connections {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Connections::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct StateActor {
    name: String,
    gossip_seen: HashSet<String>,
    connections: Connections,
}

impl StateActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::MarkSeen(message, reply) => {
                    let _ = reply.send(self.gossip_seen.insert(message));
                }
                Command::HasSeen(message, reply) => {
                    let _ = reply.send(self.gossip_seen.contains(&message));
                }
                Command::GetConnections(name, reply) => {
                    let _ = reply.send(self.connections.get(&name).cloned());
                }
                Command::LearnConnections { name, neighbors, reply } => {
                    let _ = reply.send(self.learn(name, neighbors));
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.connections.clone());
                }
                Command::Quit => {
                    debug!(nest = %self.name, "state actor quitting");
                    return;
                }
            }
        }
        debug!(nest = %self.name, "state handle dropped, actor quitting");
    }

    fn learn(&mut self, name: String, neighbors: Vec<String>) -> bool {
        // A nest's own entry always mirrors its wiring.
        if name == self.name {
            return false;
        }
        if self.connections.get(&name) == Some(&neighbors) {
            return false;
        }
        trace!(nest = %self.name, about = %name, ?neighbors, "topology view updated");
        self.connections.insert(name, neighbors);
        true
    }
}
