//! # Topology Tracking
//!
//! Each nest keeps its own belief of the whole graph (nest name to neighbor
//! list). On start a nest announces its own list; a nest that learns
//! something new about any nest passes it on to its neighbors, except the one
//! it came from. Unchanged announcements stop there, so on a static mesh the
//! flood dies out once every view holds every nest, after a delay
//! proportional to the mesh diameter.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, trace};

use crate::messages::{self, ConnectionsPayload, CONNECTIONS};
use crate::nest::Nest;

impl Nest {
    /// Announce this nest's own neighbor list to all neighbors.
    pub async fn start(&self) -> Result<usize> {
        debug!(nest = %self.name(), neighbors = ?self.neighbors(), "announcing connections");
        self.broadcast_connections(self.name(), None).await
    }

    /// Send the locally stored neighbor list of `name` to every neighbor
    /// except `except`. Returns how many announcements were sent.
    pub async fn broadcast_connections(&self, name: &str, except: Option<&str>) -> Result<usize> {
        let Some(neighbors) = self.state().connections_of(name).await else {
            return Ok(0);
        };
        let payload = messages::encode(
            CONNECTIONS,
            &ConnectionsPayload {
                name: name.to_string(),
                neighbors,
            },
        )?;

        let mut sent = 0;
        for neighbor in self.neighbors() {
            if Some(neighbor.as_str()) == except {
                continue;
            }
            let nest = self.clone();
            let neighbor = neighbor.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = nest.request(&neighbor, CONNECTIONS, payload).await {
                    debug!(
                        nest = %nest.name(),
                        to = %neighbor,
                        error = %e,
                        "connections announcement failed"
                    );
                }
            });
            sent += 1;
        }
        Ok(sent)
    }
}

pub(crate) async fn handle_connections(
    nest: Nest,
    payload: Value,
    source: String,
) -> Result<Value> {
    let ConnectionsPayload { name, neighbors } = messages::decode(CONNECTIONS, payload)?;
    if !nest.state().learn_connections(&name, neighbors).await? {
        trace!(nest = %nest.name(), about = %name, "connections unchanged");
        return Ok(Value::Null);
    }
    nest.broadcast_connections(&name, Some(&source)).await?;
    Ok(Value::Null)
}
