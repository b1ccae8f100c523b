//! Aggregation of per-node state into fleet reports.
//!
//! [`Aggregator`] owns the [`NodeStateStore`]. Ingestion feeds it through
//! [`Aggregator::update`]; report generation calls
//! [`Aggregator::build_report`], which copies the store once and derives
//! everything else from that copy without holding any lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::MasterConfig;
use crate::model::{
    AggregatedReport, DerivedStatus, FailedTierPolicy, NodeAggregatedStatus, NodeDisplayMeta,
    SpeedtestResult, StatusSummary,
};
use crate::store::{NodeState, NodeStateStore};

/// Inputs to report generation that come from configuration.
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    /// Display metadata per configured node id.
    pub nodes_meta: BTreeMap<String, NodeDisplayMeta>,

    /// Node ids to list first, in this order.
    pub nodes_order: Vec<String>,

    /// A node whose last report is older than this is offline.
    pub node_timeout: TimeDelta,

    pub failed_tier: FailedTierPolicy,
}

impl AggregationSettings {
    pub fn from_master(master: &MasterConfig) -> Self {
        let nodes_meta = master
            .nodes_meta
            .iter()
            .map(|(id, meta)| {
                (
                    id.clone(),
                    NodeDisplayMeta {
                        node_id: id.clone(),
                        flag: meta.flag.clone(),
                        display_name: meta.display_name.clone(),
                    },
                )
            })
            .collect();

        Self {
            nodes_meta,
            nodes_order: master.nodes_order.clone(),
            node_timeout: TimeDelta::minutes(i64::from(master.node_timeout_minutes)),
            failed_tier: master.failed_status,
        }
    }

    pub fn is_known(&self, node_id: &str) -> bool {
        self.nodes_meta.contains_key(node_id)
    }
}

/// Latest-result aggregator for master mode.
#[derive(Debug, Default)]
pub struct Aggregator {
    store: NodeStateStore,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measurement received at `received_at` (master clock).
    pub fn update(&self, measurement: SpeedtestResult, received_at: DateTime<Utc>) {
        self.store.update(measurement, received_at);
    }

    /// Build a report of every configured or reporting node as of `now`.
    ///
    /// Never fails: an empty configuration and an empty store yield an empty
    /// report.
    pub fn build_report(&self, settings: &AggregationSettings, now: DateTime<Utc>) -> AggregatedReport {
        let snapshot = self.store.snapshot();

        let mut nodes = Vec::new();
        let mut summary = StatusSummary::default();

        for node_id in ordered_node_ids(settings, &snapshot) {
            let meta = settings
                .nodes_meta
                .get(node_id)
                .cloned()
                .unwrap_or_else(|| NodeDisplayMeta::bare(node_id));

            let status = derive_node_status(meta, snapshot.get(node_id), settings, now);
            summary.record(status.derived_status);
            nodes.push(status);
        }

        AggregatedReport {
            generated_at: now,
            nodes,
            summary,
        }
    }
}

/// Configured order first, then every other known node by id.
fn ordered_node_ids<'a>(
    settings: &'a AggregationSettings,
    snapshot: &'a HashMap<String, NodeState>,
) -> Vec<&'a str> {
    let universe: BTreeSet<&str> = settings
        .nodes_meta
        .keys()
        .chain(snapshot.keys())
        .map(String::as_str)
        .collect();

    let mut placed = BTreeSet::new();
    let mut ordered = Vec::with_capacity(universe.len());

    for node_id in &settings.nodes_order {
        let node_id = node_id.as_str();
        if universe.contains(node_id) && placed.insert(node_id) {
            ordered.push(node_id);
        }
    }

    // BTreeSet iteration is already ascending.
    ordered.extend(universe.into_iter().filter(|id| !placed.contains(id)));
    ordered
}

fn derive_node_status(
    meta: NodeDisplayMeta,
    state: Option<&NodeState>,
    settings: &AggregationSettings,
    now: DateTime<Utc>,
) -> NodeAggregatedStatus {
    let fresh = state.and_then(|state| {
        let received_at = state.last_received_at?;
        let measurement = state.last_measurement.as_ref()?;
        (now - received_at <= settings.node_timeout).then_some(measurement)
    });

    match fresh {
        Some(measurement) => NodeAggregatedStatus {
            meta,
            derived_status: measurement.quality_tier.derived_status(settings.failed_tier),
            last_measurement: Some(measurement.clone()),
            is_online: true,
        },
        // Stale payloads are withheld, not just flagged.
        None => NodeAggregatedStatus {
            meta,
            last_measurement: None,
            is_online: false,
            derived_status: DerivedStatus::Offline,
        },
    }
}
