//! # Reliable Request
//!
//! Bounded retry on top of an unreliable [`Transport`](crate::protocols::Transport).
//!
//! Every attempt gets a timer of `retry_interval`. When the timer fires
//! with no response, another attempt is sent, up to `max_attempts`; when it
//! fires on the last attempt the request fails with
//! [`MeshError::Timeout`]. The first attempt to answer settles the request,
//! success or error, and no further attempts are made. Attempts still in
//! flight at that point are abandoned: their late answers are never seen.

use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde_json::Value;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::messages::PING;
use crate::nest::Nest;

impl Nest {
    /// Send `(kind, content)` to the direct neighbor `target`, retrying
    /// unanswered attempts.
    pub async fn request(&self, target: &str, kind: &str, content: Value) -> Result<Value> {
        let max_attempts = self.config().max_attempts.max(1);
        let retry_interval = self.config().retry_interval;

        let mut attempts: JoinSet<Result<Value>> = JoinSet::new();
        let mut attempt = 1;
        self.spawn_attempt(&mut attempts, target, kind, &content, attempt);

        loop {
            tokio::select! {
                biased;
                Some(joined) = attempts.join_next() => {
                    return self.settle(joined, target, kind, attempt);
                }
                _ = tokio::time::sleep(retry_interval) => {
                    // An answer landing on the same tick as the timer still counts.
                    tokio::task::yield_now().await;
                    if let Some(joined) = attempts.try_join_next() {
                        return self.settle(joined, target, kind, attempt);
                    }
                    if attempt >= max_attempts {
                        debug!(
                            nest = %self.name(),
                            target,
                            kind,
                            attempts = attempt,
                            "request timed out"
                        );
                        return Err(MeshError::Timeout {
                            target: target.to_string(),
                            attempts: attempt,
                        }
                        .into());
                    }
                    attempt += 1;
                    trace!(nest = %self.name(), target, kind, attempt, "no answer, retrying");
                    self.spawn_attempt(&mut attempts, target, kind, &content, attempt);
                }
            }
        }
    }

    fn settle(
        &self,
        joined: Result<Result<Value>, JoinError>,
        target: &str,
        kind: &str,
        attempt: u32,
    ) -> Result<Value> {
        let outcome = joined.map_err(|e| anyhow!("request attempt aborted: {e}"))?;
        if let Err(e) = &outcome {
            debug!(nest = %self.name(), target, kind, attempt, error = %e, "request rejected");
        }
        outcome
    }

    fn spawn_attempt(
        &self,
        attempts: &mut JoinSet<Result<Value>>,
        target: &str,
        kind: &str,
        content: &Value,
        attempt: u32,
    ) {
        trace!(nest = %self.name(), target, kind, attempt, "sending attempt");
        let transport = self.transport().clone();
        let from = self.name().to_string();
        let target = target.to_string();
        let kind = kind.to_string();
        let content = content.clone();
        attempts.spawn(async move { transport.send(&from, &target, &kind, content).await });
    }

    /// Ping every neighbor concurrently. The mask is aligned with
    /// [`Nest::neighbors`]: `true` where the neighbor answered.
    pub async fn neighbor_liveness(&self) -> Vec<bool> {
        let pings = self
            .neighbors()
            .iter()
            .map(|neighbor| async move { self.request(neighbor, PING, Value::Null).await.is_ok() });
        join_all(pings).await
    }

    /// Neighbors that currently answer a ping, in neighbor order.
    pub async fn available_neighbors(&self) -> Vec<String> {
        let mask = self.neighbor_liveness().await;
        self.neighbors()
            .iter()
            .zip(mask)
            .filter_map(|(neighbor, alive)| alive.then(|| neighbor.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    use super::*;
    use crate::nest::MeshConfig;
    use crate::protocols::Transport;
    use crate::registry::RequestRegistry;
    use crate::storage::MemoryStorage;

    /// How the scripted transport treats the n-th attempt to a target.
    #[derive(Clone, Copy)]
    enum Reply {
        Silent,
        Answer,
        Fail,
        /// Answer, but only after this long.
        Slow(Duration),
    }

    #[derive(Default)]
    struct ScriptedNetwork {
        scripts: Mutex<HashMap<String, Vec<Reply>>>,
        sends: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedNetwork {
        async fn script(&self, target: &str, replies: Vec<Reply>) {
            self.scripts.lock().await.insert(target.to_string(), replies);
        }

        async fn sends_to(&self, target: &str) -> Vec<Instant> {
            self.sends
                .lock()
                .await
                .iter()
                .filter(|(t, _)| t == target)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedNetwork {
        async fn send(
            &self,
            _from: &str,
            target: &str,
            kind: &str,
            payload: Value,
        ) -> Result<Value> {
            let attempt = {
                let mut sends = self.sends.lock().await;
                sends.push((target.to_string(), Instant::now()));
                sends.iter().filter(|(t, _)| t == target).count()
            };
            let reply = self
                .scripts
                .lock()
                .await
                .get(target)
                .and_then(|replies| replies.get(attempt - 1).copied())
                .unwrap_or(Reply::Silent);
            match reply {
                Reply::Silent => std::future::pending().await,
                Reply::Answer => Ok(json!({"attempt": attempt, "kind": kind, "payload": payload})),
                Reply::Fail => Err(anyhow!("{target} refused")),
                Reply::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(json!({"attempt": attempt}))
                }
            }
        }
    }

    fn nest_on(network: Arc<ScriptedNetwork>, neighbors: &[&str]) -> Nest {
        Nest::new(
            "Big Oak",
            neighbors.iter().map(|s| s.to_string()).collect(),
            network,
            Arc::new(MemoryStorage::new()),
            Arc::new(RequestRegistry::with_default_types()),
            MeshConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn silent_target_gets_three_attempts_then_times_out() {
        let network = Arc::new(ScriptedNetwork::default());
        let nest = nest_on(network.clone(), &["Cow Pasture"]);

        let started = Instant::now();
        let err = nest.request("Cow Pasture", "note", json!("hi")).await.unwrap_err();

        assert_eq!(
            MeshError::of(&err),
            Some(&MeshError::Timeout {
                target: "Cow Pasture".into(),
                attempts: 3
            })
        );
        let sends = network.sends_to("Cow Pasture").await;
        assert_eq!(sends.len(), 3);
        for gap in [sends[1] - sends[0], sends[2] - sends[1]] {
            assert!(
                gap >= Duration::from_millis(250) && gap < Duration::from_millis(260),
                "gap {gap:?}"
            );
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(750) && elapsed < Duration::from_millis(780));
    }

    #[tokio::test(start_paused = true)]
    async fn answer_on_second_attempt_stops_retrying() {
        let network = Arc::new(ScriptedNetwork::default());
        network.script("Cow Pasture", vec![Reply::Silent, Reply::Answer]).await;
        let nest = nest_on(network.clone(), &["Cow Pasture"]);

        let response = nest.request("Cow Pasture", "note", json!("hi")).await.unwrap();
        assert_eq!(response["attempt"], json!(2));
        assert_eq!(response["payload"], json!("hi"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(network.sends_to("Cow Pasture").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn error_rejects_immediately_without_retry() {
        let network = Arc::new(ScriptedNetwork::default());
        network.script("Cow Pasture", vec![Reply::Fail]).await;
        let nest = nest_on(network.clone(), &["Cow Pasture"]);

        let err = nest.request("Cow Pasture", "note", json!("hi")).await.unwrap_err();
        assert_eq!(err.to_string(), "Cow Pasture refused");
        assert!(MeshError::of(&err).is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(network.sends_to("Cow Pasture").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_first_attempt_still_settles_once() {
        // First attempt answers after 400ms, i.e. after the second was sent.
        let network = Arc::new(ScriptedNetwork::default());
        network
            .script(
                "Cow Pasture",
                vec![Reply::Slow(Duration::from_millis(400)), Reply::Silent],
            )
            .await;
        let nest = nest_on(network.clone(), &["Cow Pasture"]);

        let response = nest.request("Cow Pasture", "ping", Value::Null).await.unwrap();
        assert_eq!(response["attempt"], json!(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(network.sends_to("Cow Pasture").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_config_times_out_after_one_interval() {
        let network = Arc::new(ScriptedNetwork::default());
        let nest = Nest::new(
            "Big Oak",
            vec!["Cow Pasture".into()],
            network.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(RequestRegistry::with_default_types()),
            MeshConfig {
                max_attempts: 1,
                ..Default::default()
            },
        );
        let err = nest.request("Cow Pasture", "ping", Value::Null).await.unwrap_err();
        assert!(matches!(MeshError::of(&err), Some(MeshError::Timeout { attempts: 1, .. })));
        assert_eq!(network.sends_to("Cow Pasture").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_due_with_the_timer_settles_the_last_attempt() {
        let network = Arc::new(ScriptedNetwork::default());
        network
            .script("Cow Pasture", vec![Reply::Slow(Duration::from_millis(250))])
            .await;
        let nest = Nest::new(
            "Big Oak",
            vec!["Cow Pasture".into()],
            network.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(RequestRegistry::with_default_types()),
            MeshConfig {
                max_attempts: 1,
                ..Default::default()
            },
        );

        let response = nest.request("Cow Pasture", "ping", Value::Null).await.unwrap();
        assert_eq!(response["attempt"], json!(1));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_mask_follows_neighbor_order() {
        let network = Arc::new(ScriptedNetwork::default());
        network.script("Cow Pasture", vec![Reply::Answer]).await;
        network.script("Butcher Shop", vec![Reply::Fail]).await;
        let nest = nest_on(network, &["Cow Pasture", "Butcher Shop", "Gilles' Garden"]);

        assert_eq!(nest.neighbor_liveness().await, vec![true, false, false]);
        assert_eq!(nest.available_neighbors().await, vec!["Cow Pasture".to_string()]);
    }
}
