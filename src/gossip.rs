//! # Gossip Broadcast
//!
//! Flooding with loop suppression. A nest forwards a given message string at
//! most once: the per-nest seen-set is checked and updated atomically by the
//! state actor before anything is sent. Every neighbor except the one the
//! message came from gets a reliable `gossip` request. Delivery is best
//! effort, may arrive over several paths, and is processed once per nest.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::messages::{self, GOSSIP};
use crate::nest::Nest;

impl Nest {
    /// Announce `message` to every neighbor except `except`.
    ///
    /// Returns `false` without sending anything when this nest has already
    /// seen the message.
    pub async fn broadcast_gossip(&self, message: &str, except: Option<&str>) -> Result<bool> {
        if !self.state().mark_seen(message).await? {
            trace!(nest = %self.name(), "gossip already seen, not re-announcing");
            return Ok(false);
        }
        self.flood_gossip(message, except);
        Ok(true)
    }

    /// Fire a `gossip` request at every neighbor but `except`. Returns how
    /// many were sent. Failures are logged and otherwise dropped.
    fn flood_gossip(&self, message: &str, except: Option<&str>) -> usize {
        let mut sent = 0;
        for neighbor in self.neighbors() {
            if Some(neighbor.as_str()) == except {
                continue;
            }
            let nest = self.clone();
            let neighbor = neighbor.clone();
            let payload = Value::from(message);
            tokio::spawn(async move {
                if let Err(e) = nest.request(&neighbor, GOSSIP, payload).await {
                    debug!(
                        nest = %nest.name(),
                        to = %neighbor,
                        error = %e,
                        "gossip delivery failed"
                    );
                }
            });
            sent += 1;
        }
        sent
    }
}

pub(crate) async fn handle_gossip(nest: Nest, payload: Value, source: String) -> Result<Value> {
    let message = messages::expect_str(GOSSIP, &payload)?;
    if !nest.state().mark_seen(message).await? {
        return Ok(Value::Null);
    }
    info!(nest = %nest.name(), from = %source, "received gossip: {message}");
    nest.report_gossip(message, &source);
    nest.flood_gossip(message, Some(&source));
    Ok(Value::Null)
}
