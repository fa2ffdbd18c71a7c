//! # Routing
//!
//! Requests to nests that are not direct neighbors travel hop by hop inside
//! `route` requests. Each hop plans its own next hop from its own topology
//! view with a breadth-first search and sends one reliable request, with its
//! own retries, until the target is a direct neighbor.

use std::collections::{HashSet, VecDeque};

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::error::MeshError;
use crate::messages::{self, RoutePayload, ROUTE};
use crate::nest::Nest;
use crate::state::Connections;

/// First hop from `from` toward `to` in `connections`, or `None` when `to`
/// is unreachable (or is `from` itself).
///
/// Neighbors are expanded in their listed order and a nest is queued only the
/// first time it is discovered, so among equally short paths the one found
/// first wins.
pub fn find_route(from: &str, to: &str, connections: &Connections) -> Option<String> {
    if from == to {
        return None;
    }

    let mut visited: HashSet<&str> = HashSet::from([from]);
    let mut work: VecDeque<(&str, Option<&str>)> = VecDeque::from([(from, None)]);

    while let Some((at, via)) = work.pop_front() {
        let Some(neighbors) = connections.get(at) else {
            continue;
        };
        for next in neighbors {
            let hop = via.unwrap_or(next.as_str());
            if next == to {
                return Some(hop.to_string());
            }
            if visited.insert(next.as_str()) {
                work.push_back((next.as_str(), Some(hop)));
            }
        }
    }
    None
}

impl Nest {
    /// Plan the first hop toward `target` without sending anything.
    pub async fn next_hop(&self, target: &str) -> Result<String, MeshError> {
        if self.is_neighbor(target) {
            return Ok(target.to_string());
        }
        let connections = self.connections().await;
        find_route(self.name(), target, &connections).ok_or_else(|| MeshError::NoRoute {
            target: target.to_string(),
        })
    }

    /// Deliver `(kind, content)` to any reachable nest.
    ///
    /// Direct neighbors get a plain reliable request. Otherwise the route is
    /// planned first; when there is none this fails with
    /// [`MeshError::NoRoute`] before any message is sent. A request addressed
    /// to this nest itself is handled locally.
    pub async fn route_request(&self, target: &str, kind: &str, content: Value) -> Result<Value> {
        if self.is_neighbor(target) {
            return self.request(target, kind, content).await;
        }
        if target == self.name() {
            return self.handle_request(kind, content, self.name()).await;
        }

        let via = self.next_hop(target).await?;
        debug!(nest = %self.name(), target, via = %via, kind, "forwarding request");
        let payload = messages::encode(
            ROUTE,
            &RoutePayload {
                target: target.to_string(),
                kind: kind.to_string(),
                content,
            },
        )?;
        self.request(&via, ROUTE, payload).await
    }
}

pub(crate) async fn handle_route(nest: Nest, payload: Value, _source: String) -> Result<Value> {
    let RoutePayload { target, kind, content } = messages::decode(ROUTE, payload)?;
    nest.route_request(&target, &kind, content).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::nest::MeshConfig;
    use crate::protocols::Transport;
    use crate::registry::RequestRegistry;
    use crate::sim::{adjacency, crow_tech_edges};
    use crate::storage::MemoryStorage;

    fn graph(edges: &[(&str, &str)]) -> Connections {
        let edges: Vec<(String, String)> =
            edges.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect();
        adjacency(&edges).into_iter().collect()
    }

    /// Hop distances from `from` to every reachable nest.
    fn distances(from: &str, connections: &Connections) -> HashMap<String, usize> {
        let mut dist = HashMap::from([(from.to_string(), 0)]);
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(at) = queue.pop_front() {
            let d = dist[&at];
            for next in connections.get(&at).into_iter().flatten() {
                if !dist.contains_key(next) {
                    dist.insert(next.clone(), d + 1);
                    queue.push_back(next.clone());
                }
            }
        }
        dist
    }

    #[test]
    fn chain_routes_through_the_first_link() {
        let connections = graph(&[("A", "B"), ("B", "C"), ("C", "D")]);
        assert_eq!(find_route("A", "D", &connections), Some("B".into()));
        assert_eq!(find_route("B", "D", &connections), Some("C".into()));
        assert_eq!(find_route("D", "A", &connections), Some("C".into()));
    }

    #[test]
    fn direct_neighbor_is_its_own_hop() {
        let connections = graph(&[("A", "B"), ("B", "C")]);
        assert_eq!(find_route("A", "B", &connections), Some("B".into()));
    }

    #[test]
    fn unreachable_and_self_have_no_route() {
        let connections = graph(&[("A", "B"), ("C", "D")]);
        assert_eq!(find_route("A", "D", &connections), None);
        assert_eq!(find_route("A", "Z", &connections), None);
        assert_eq!(find_route("A", "A", &connections), None);
    }

    #[test]
    fn ties_follow_neighbor_order() {
        // A-B-D and A-C-D are equally short; B is listed first.
        let connections = graph(&[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")]);
        assert_eq!(find_route("A", "D", &connections), Some("B".into()));
        let connections = graph(&[("A", "C"), ("A", "B"), ("B", "D"), ("C", "D")]);
        assert_eq!(find_route("A", "D", &connections), Some("C".into()));
    }

    #[test]
    fn every_hop_is_a_neighbor_one_step_closer() {
        let connections: Connections = adjacency(&crow_tech_edges()).into_iter().collect();
        for from in connections.keys() {
            for to in connections.keys() {
                if from == to {
                    continue;
                }
                let hop = find_route(from, to, &connections).expect("village is connected");
                assert!(connections[from].contains(&hop), "{hop} is not a neighbor of {from}");
                let from_dist = distances(from, &connections)[to];
                let hop_dist = distances(&hop, &connections)[to];
                assert_eq!(hop_dist + 1, from_dist, "{from} -> {to} via {hop}");
            }
        }
    }

    #[derive(Default)]
    struct RecordingNetwork {
        sends: Mutex<Vec<(String, String, Value)>>,
    }

    #[async_trait]
    impl Transport for RecordingNetwork {
        async fn send(
            &self,
            _from: &str,
            target: &str,
            kind: &str,
            payload: Value,
        ) -> Result<Value> {
            self.sends.lock().await.push((target.to_string(), kind.to_string(), payload));
            Ok(json!("delivered"))
        }
    }

    async fn nest_knowing(network: Arc<RecordingNetwork>, views: &[(&str, &[&str])]) -> Nest {
        let nest = Nest::new(
            "A",
            vec!["B".into()],
            network,
            Arc::new(MemoryStorage::new()),
            Arc::new(RequestRegistry::with_default_types()),
            MeshConfig::default(),
        );
        for (name, neighbors) in views {
            let neighbors = neighbors.iter().map(|s| s.to_string()).collect();
            nest.state().learn_connections(name, neighbors).await.unwrap();
        }
        nest
    }

    #[tokio::test]
    async fn neighbors_are_sent_to_directly() {
        let network = Arc::new(RecordingNetwork::default());
        let nest = nest_knowing(network.clone(), &[]).await;

        nest.route_request("B", "note", json!("hi")).await.unwrap();

        let sends = network.sends.lock().await;
        assert_eq!(sends.as_slice(), &[("B".to_string(), "note".to_string(), json!("hi"))]);
    }

    #[tokio::test]
    async fn distant_targets_are_wrapped_in_route_requests() {
        let network = Arc::new(RecordingNetwork::default());
        let nest = nest_knowing(network.clone(), &[("B", &["A", "C"]), ("C", &["B"])]).await;

        let response = nest.route_request("C", "note", json!("hi")).await.unwrap();
        assert_eq!(response, json!("delivered"));

        let sends = network.sends.lock().await;
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "B");
        assert_eq!(sends[0].1, ROUTE);
        assert_eq!(sends[0].2, json!({"target": "C", "type": "note", "content": "hi"}));
    }

    #[tokio::test]
    async fn missing_route_fails_before_sending() {
        let network = Arc::new(RecordingNetwork::default());
        let nest = nest_knowing(network.clone(), &[("B", &["A"])]).await;

        let err = nest.route_request("Hawthorn", "note", json!("hi")).await.unwrap_err();
        assert_eq!(
            MeshError::of(&err),
            Some(&MeshError::NoRoute { target: "Hawthorn".into() })
        );
        assert!(network.sends.lock().await.is_empty());
    }

    #[tokio::test]
    async fn requests_to_self_are_handled_locally() {
        let network = Arc::new(RecordingNetwork::default());
        let nest = nest_knowing(network.clone(), &[]).await;

        let pong = nest.route_request("A", "ping", Value::Null).await.unwrap();
        assert_eq!(pong, json!("pong"));
        assert!(network.sends.lock().await.is_empty());
    }
}
