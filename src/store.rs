//! In-memory latest-state store for reporting nodes.
//!
//! Holds, per node id, the most recently received measurement and the
//! master's clock reading at receipt. Entries are never evicted.
//!
//! The lock is only held for a single upsert or for copying the map out in
//! [`NodeStateStore::snapshot`]; nothing else (and no I/O) runs under it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::model::SpeedtestResult;

/// Last known state of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub last_measurement: Option<SpeedtestResult>,
    pub last_received_at: Option<DateTime<Utc>>,
}

/// Latest measurement per node id.
#[derive(Debug, Default)]
pub struct NodeStateStore {
    nodes: RwLock<HashMap<String, NodeState>>,
}

impl NodeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the state of `measurement.node_id`.
    ///
    /// `received_at` must be the receiving process's own clock, not a value
    /// taken from the payload. Concurrent updates for the same node are
    /// serialized; the last one to take the lock wins.
    pub fn update(&self, measurement: SpeedtestResult, received_at: DateTime<Utc>) {
        debug_assert!(
            !measurement.node_id.is_empty(),
            "measurement must carry a node id"
        );

        let node_id = measurement.node_id.clone();
        let state = NodeState {
            last_measurement: Some(measurement),
            last_received_at: Some(received_at),
        };

        // A panicking writer cannot leave a half-written entry behind, so a
        // poisoned map is still consistent.
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(node_id, state);
    }

    /// Point-in-time copy of every node's state.
    pub fn snapshot(&self) -> HashMap<String, NodeState> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::model::QualityTier;

    fn measurement(node_id: &str, download: f64) -> SpeedtestResult {
        SpeedtestResult {
            node_id: node_id.to_string(),
            observed_at: Utc::now(),
            download_mbps: download,
            upload_mbps: 10.0,
            ping_ms: 5.0,
            quality_tier: QualityTier::Good,
            test_server: "S".to_string(),
            isp: "I".to_string(),
            os_info: "O".to_string(),
            description: None,
        }
    }

    #[test]
    fn test_update_and_snapshot() {
        let store = NodeStateStore::new();
        assert!(store.snapshot().is_empty());

        let now = Utc::now();
        store.update(measurement("node1", 100.0), now);

        let snapshot = store.snapshot();
        let state = &snapshot["node1"];
        assert_eq!(state.last_received_at, Some(now));
        assert_eq!(state.last_measurement.as_ref().unwrap().download_mbps, 100.0);
    }

    #[test]
    fn test_later_update_replaces_earlier() {
        let store = NodeStateStore::new();
        let now = Utc::now();

        store.update(measurement("node1", 100.0), now);
        store.update(measurement("node1", 20.0), now + chrono::Duration::seconds(5));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot["node1"].last_measurement.as_ref().unwrap().download_mbps,
            20.0
        );
    }

    #[test]
    fn test_snapshot_is_detached_from_later_updates() {
        let store = NodeStateStore::new();
        let now = Utc::now();
        store.update(measurement("node1", 100.0), now);

        let before = store.snapshot();
        store.update(measurement("node1", 1.0), now);
        store.update(measurement("node2", 1.0), now);

        assert_eq!(before.len(), 1);
        assert_eq!(
            before["node1"].last_measurement.as_ref().unwrap().download_mbps,
            100.0
        );
    }

    #[test]
    fn test_concurrent_updates_keep_every_node() {
        let store = Arc::new(NodeStateStore::new());
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for round in 0..50 {
                        store.update(measurement(&format!("node{worker}"), f64::from(round)), now);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 8);
        for state in snapshot.values() {
            assert_eq!(state.last_measurement.as_ref().unwrap().download_mbps, 49.0);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "node id")]
    fn test_empty_node_id_fails_fast() {
        let store = NodeStateStore::new();
        store.update(measurement("", 1.0), Utc::now());
    }
}
