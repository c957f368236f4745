//! The published node set and its publication as JSON patches.

use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::discovery::{Health, Identity, Location, Node, now_millis};
use crate::ws::{BroadcastMessage, BroadcastReceiver, Broadcaster, WsPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Discovering,
    Enriching,
    SettledOk,
    SettledError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub healthy: usize,
    pub target: usize,
    /// Mean over nodes with a measured latency only.
    pub mean_latency_ms: Option<f64>,
}

impl Stats {
    pub fn compute(nodes: &[Node]) -> Self {
        let latencies: Vec<u64> = nodes.iter().filter_map(|n| n.latency_ms).collect();
        let mean_latency_ms = (!latencies.is_empty())
            .then(|| latencies.iter().sum::<u64>() as f64 / latencies.len() as f64);
        Self {
            total: nodes.len(),
            healthy: nodes.iter().filter(|n| n.health == Health::Healthy).count(),
            target: nodes.iter().filter(|n| n.is_target()).count(),
            mean_latency_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub cycle: u64,
    pub phase: Phase,
    pub connection: ConnectionState,
    /// Endpoint that produced the node set, or `direct` for the fallback.
    pub source: Option<String>,
    pub error: Option<String>,
    /// Known addresses that answered, when the fallback ran.
    pub reachable: Option<usize>,
    pub stats: Stats,
    pub nodes: Vec<Node>,
    pub updated_at: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            cycle: 0,
            phase: Phase::Idle,
            connection: ConnectionState::Connecting,
            source: None,
            error: None,
            reachable: None,
            stats: Stats::default(),
            nodes: Vec::new(),
            updated_at: now_millis(),
        }
    }
}

/// Holds the current snapshot. Every mutation is published to WebSocket
/// clients as a patch against the previously published state.
pub struct SnapshotStore {
    current: RwLock<Snapshot>,
    published: Mutex<Value>,
    broadcaster: Broadcaster,
}

impl SnapshotStore {
    pub fn new(broadcaster: Broadcaster) -> Self {
        let initial = Snapshot::default();
        let published = serde_json::to_value(&initial).unwrap_or(Value::Null);
        Self {
            current: RwLock::new(initial),
            published: Mutex::new(published),
            broadcaster,
        }
    }

    pub fn read(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Snapshot) -> R,
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut *current);
        current.updated_at = now_millis();
        self.publish(&*current);
        out
    }

    /// Sets the location of one node, leaving every other entry untouched.
    /// Returns false when the node is gone (a newer cycle replaced the set)
    /// or already located.
    pub fn apply_location(&self, id: &Identity, location: Location) -> bool {
        self.update(|snapshot| {
            match snapshot
                .nodes
                .iter_mut()
                .find(|n| n.key() == id.key() && n.location.is_none())
            {
                Some(node) => {
                    node.set_location(location);
                    true
                }
                None => {
                    debug!(node = %id, "Location arrived for a node no longer awaiting one");
                    false
                }
            }
        })
    }

    fn publish(&self, snapshot: &Snapshot) {
        let next = match serde_json::to_value(snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize snapshot");
                return;
            }
        };
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let patch = json_patch::diff(&published, &next);
        *published = next;
        if !patch.0.is_empty() {
            self.broadcaster.broadcast(BroadcastMessage::Patch(WsPatch {
                cycle: snapshot.cycle,
                patch,
            }));
        }
    }

    /// Subscribes to patches and returns the state they apply to. Publication
    /// holds the same lock, so no patch is missed or delivered twice.
    pub fn subscribe(&self) -> (Value, BroadcastReceiver) {
        let published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = self.broadcaster.subscribe();
        (published.clone(), receiver)
    }

    /// Moves a lagging receiver to the head of the stream and returns the
    /// state its next patch applies to.
    pub fn resubscribe(&self, receiver: &mut BroadcastReceiver) -> Value {
        let published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        receiver.skip_to_tail();
        published.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::WsError;

    fn node(key: &str, health: Health, latency: Option<u64>) -> Node {
        let mut n = Node::new(Identity::Reported(key.into()), Some("0.806.30102".into()));
        n.health = health;
        n.latency_ms = latency;
        n
    }

    fn location() -> Location {
        Location {
            country: "Japan".into(),
            country_code: "JP".into(),
            city: "Tokyo".into(),
            lat: 35.6,
            lon: 139.7,
        }
    }

    #[test]
    fn stats_average_known_latencies_only() {
        let stats = Stats::compute(&[
            node("a", Health::Healthy, Some(10)),
            node("b", Health::Unknown, None),
            node("c", Health::Healthy, Some(30)),
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.target, 3);
        assert_eq!(stats.mean_latency_ms, Some(20.0));
        assert_eq!(Stats::compute(&[]).mean_latency_ms, None);
    }

    #[tokio::test]
    async fn location_update_touches_single_entry() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        let store = SnapshotStore::new(broadcaster);
        store.update(|s| s.nodes = vec![node("a", Health::Healthy, None), node("b", Health::Healthy, None)]);
        let _ = rx.recv().await.unwrap();

        assert!(store.apply_location(&Identity::Reported("b".into()), location()));
        assert!(!store.apply_location(&Identity::Reported("b".into()), location()));
        assert!(!store.apply_location(&Identity::Reported("zzz".into()), location()));

        let snap = store.read();
        assert!(snap.nodes[0].location.is_none());
        assert_eq!(snap.nodes[1].location.as_ref().unwrap().city, "Tokyo");

        match rx.recv().await.unwrap() {
            BroadcastMessage::Patch(p) => {
                let text = serde_json::to_string(&p.patch).unwrap();
                assert!(text.contains("/nodes/1/location"));
                assert!(!text.contains("/nodes/0/"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscriber_starts_from_published_state() {
        let store = SnapshotStore::new(Broadcaster::new());
        store.update(|s| s.phase = Phase::Discovering);
        let (state, mut rx) = store.subscribe();
        assert_eq!(state["phase"], "discovering");

        store.update(|s| s.phase = Phase::SettledOk);
        let Ok(BroadcastMessage::Patch(p)) = rx.recv().await else {
            panic!("expected a patch");
        };
        let mut replayed = state;
        json_patch::patch(&mut replayed, &p.patch).unwrap();
        assert_eq!(replayed["phase"], "settled_ok");
    }

    #[tokio::test]
    async fn lagged_subscriber_resyncs_from_current_state() {
        let store = SnapshotStore::new(Broadcaster::new());
        let (_, mut rx) = store.subscribe();
        for cycle in 0..300u64 {
            store.update(|s| s.cycle = cycle);
        }
        assert!(matches!(rx.recv().await, Err(WsError::Lagged(_))));

        let mut state = store.resubscribe(&mut rx);
        assert_eq!(state["cycle"], 299);

        store.update(|s| {
            s.cycle = 300;
            s.nodes = vec![node("a", Health::Healthy, Some(5))];
        });
        let Ok(BroadcastMessage::Patch(p)) = rx.recv().await else {
            panic!("expected a patch after resync");
        };
        json_patch::patch(&mut state, &p.patch).unwrap();
        assert_eq!(state, serde_json::to_value(store.read()).unwrap());
    }
}
