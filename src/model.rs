//! Data models for the speedtest monitor.
//!
//! # Overview
//!
//! Three families of types live here:
//!
//! - **Measurements**: [`SpeedtestResult`] is one completed measurement attempt
//!   from a node, and [`ReportPayload`] is its JSON form on the wire between a
//!   node and the master.
//! - **Display metadata**: [`NodeDisplayMeta`] describes how a node is shown in
//!   reports. It comes entirely from master configuration.
//! - **Derived report data**: [`NodeAggregatedStatus`], [`StatusSummary`] and
//!   [`AggregatedReport`] are built fresh on every aggregation cycle and never
//!   mutated afterwards.
//!
//! Status strings are closed enums. The only mapping from a measurement's
//! [`QualityTier`] to a node's [`DerivedStatus`] is
//! [`QualityTier::derived_status`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Quality tier reported by a node for a single measurement.
///
/// Older nodes send their raw speed tier instead; those strings are accepted
/// as aliases (`normal` is good, `low` and `very_low` are degraded). Anything
/// else decodes to [`QualityTier::Unrecognized`] rather than failing the whole
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Download at or above the `good` threshold.
    Excellent,

    /// Download between the `low` and `good` thresholds.
    #[serde(alias = "normal")]
    Good,

    /// Download below the `low` threshold.
    #[serde(alias = "low", alias = "very_low")]
    Degraded,

    /// The measurement could not be completed.
    Failed,

    /// The node had nothing to report.
    NoData,

    /// A tier string this build does not know about.
    #[serde(other)]
    Unrecognized,
}

/// Policy for a `failed` measurement received from a node that is still
/// reporting within the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedTierPolicy {
    /// The node counts as offline: it is reachable but cannot measure.
    #[default]
    Offline,

    /// The node counts as degraded.
    Degraded,
}

/// Fleet-level status of a node in an aggregated report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedStatus {
    Ok,
    Degraded,
    Offline,
}

impl DerivedStatus {
    /// All statuses, in report order.
    pub const ALL: [DerivedStatus; 3] = [
        DerivedStatus::Ok,
        DerivedStatus::Degraded,
        DerivedStatus::Offline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DerivedStatus::Ok => "ok",
            DerivedStatus::Degraded => "degraded",
            DerivedStatus::Offline => "offline",
        }
    }
}

impl QualityTier {
    /// Map the tier of an online node's latest measurement to its status.
    ///
    /// | tier                        | status               |
    /// |-----------------------------|----------------------|
    /// | excellent, good             | ok                   |
    /// | degraded                    | degraded             |
    /// | failed                      | per [`FailedTierPolicy`] |
    /// | no_data, unrecognized       | offline              |
    pub fn derived_status(self, failed: FailedTierPolicy) -> DerivedStatus {
        match self {
            QualityTier::Excellent | QualityTier::Good => DerivedStatus::Ok,
            QualityTier::Degraded => DerivedStatus::Degraded,
            QualityTier::Failed => match failed {
                FailedTierPolicy::Offline => DerivedStatus::Offline,
                FailedTierPolicy::Degraded => DerivedStatus::Degraded,
            },
            QualityTier::NoData | QualityTier::Unrecognized => DerivedStatus::Offline,
        }
    }
}

/// One completed measurement attempt from a node (success or failure).
///
/// Immutable once constructed. The master keeps only the latest one per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestResult {
    /// Identity of the reporting node. Never empty.
    pub node_id: String,

    /// When the node says it took the measurement.
    ///
    /// Informational only: staleness is always judged by the master's own
    /// receive time.
    pub observed_at: DateTime<Utc>,

    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,

    /// Node-side classification of the measurement.
    pub quality_tier: QualityTier,

    /// Test server label, usually "name (location)".
    pub test_server: String,

    pub isp: String,

    /// Operating system of the node, e.g. "Linux 6.1.0".
    pub os_info: String,

    /// Free text the node operator attached to the node.
    pub description: Option<String>,
}

/// JSON body of `POST /api/v1/report`.
///
/// # Example
///
/// ```json
/// {
///     "node_id": "fi-hel-1",
///     "timestamp": "2024-01-15T10:30:00Z",
///     "download_mbps": 940.2,
///     "upload_mbps": 610.5,
///     "ping_ms": 3.1,
///     "status": "excellent",
///     "test_server": "Telia (Helsinki)",
///     "isp": "Hetzner",
///     "os_info": "Linux 6.1.0",
///     "description": "rack 4"
/// }
/// ```
///
/// `timestamp` may also be a naive ISO-8601 value without an offset, which is
/// read as UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    pub node_id: String,

    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,

    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub status: QualityTier,
    pub test_server: String,
    pub isp: String,
    pub os_info: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<ReportPayload> for SpeedtestResult {
    fn from(payload: ReportPayload) -> Self {
        Self {
            node_id: payload.node_id,
            observed_at: payload.timestamp,
            download_mbps: payload.download_mbps,
            upload_mbps: payload.upload_mbps,
            ping_ms: payload.ping_ms,
            quality_tier: payload.status,
            test_server: payload.test_server,
            isp: payload.isp,
            os_info: payload.os_info,
            description: payload.description,
        }
    }
}

impl From<&SpeedtestResult> for ReportPayload {
    fn from(result: &SpeedtestResult) -> Self {
        Self {
            node_id: result.node_id.clone(),
            timestamp: result.observed_at,
            download_mbps: result.download_mbps,
            upload_mbps: result.upload_mbps,
            ping_ms: result.ping_ms,
            status: result.quality_tier,
            test_server: result.test_server.clone(),
            isp: result.isp.clone(),
            os_info: result.os_info.clone(),
            description: result.description.clone(),
        }
    }
}

/// Parse an RFC 3339 timestamp, falling back to a naive ISO-8601 one in UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(_) => raw.parse::<NaiveDateTime>().map(|naive| naive.and_utc()),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// How a node is shown in reports.
///
/// Sourced from master configuration. A node with no configuration entry gets
/// empty metadata and is rendered by its raw id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDisplayMeta {
    pub node_id: String,

    /// Flag glyph, e.g. "🇫🇮".
    pub flag: Option<String>,

    pub display_name: Option<String>,
}

impl NodeDisplayMeta {
    /// Metadata for a node with no configuration entry.
    pub fn bare(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            flag: None,
            display_name: None,
        }
    }

    /// Display name, or the raw node id when none is configured.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.node_id)
    }
}

/// Status of one node within a single report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeAggregatedStatus {
    pub meta: NodeDisplayMeta,

    /// Latest measurement, present only while the node is online.
    pub last_measurement: Option<SpeedtestResult>,

    pub is_online: bool,
    pub derived_status: DerivedStatus,
}

/// Count of nodes per [`DerivedStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub ok: usize,
    pub degraded: usize,
    pub offline: usize,
}

impl StatusSummary {
    pub fn record(&mut self, status: DerivedStatus) {
        match status {
            DerivedStatus::Ok => self.ok += 1,
            DerivedStatus::Degraded => self.degraded += 1,
            DerivedStatus::Offline => self.offline += 1,
        }
    }

    pub fn count(&self, status: DerivedStatus) -> usize {
        match status {
            DerivedStatus::Ok => self.ok,
            DerivedStatus::Degraded => self.degraded,
            DerivedStatus::Offline => self.offline,
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.degraded + self.offline
    }
}

/// Immutable fleet snapshot produced by one aggregation cycle.
///
/// `summary.total() == nodes.len()` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedReport {
    pub generated_at: DateTime<Utc>,
    pub nodes: Vec<NodeAggregatedStatus>,
    pub summary: StatusSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_json(status: &str, timestamp: &str) -> serde_json::Value {
        json!({
            "node_id": "node1",
            "timestamp": timestamp,
            "download_mbps": 100.0,
            "upload_mbps": 50.0,
            "ping_ms": 10.0,
            "status": status,
            "test_server": "Server",
            "isp": "ISP",
            "os_info": "Linux"
        })
    }

    #[test]
    fn test_tier_to_status_mapping() {
        let policy = FailedTierPolicy::Offline;
        assert_eq!(QualityTier::Excellent.derived_status(policy), DerivedStatus::Ok);
        assert_eq!(QualityTier::Good.derived_status(policy), DerivedStatus::Ok);
        assert_eq!(
            QualityTier::Degraded.derived_status(policy),
            DerivedStatus::Degraded
        );
        assert_eq!(QualityTier::NoData.derived_status(policy), DerivedStatus::Offline);
        assert_eq!(
            QualityTier::Unrecognized.derived_status(policy),
            DerivedStatus::Offline
        );
    }

    #[test]
    fn test_failed_tier_follows_policy() {
        assert_eq!(
            QualityTier::Failed.derived_status(FailedTierPolicy::Offline),
            DerivedStatus::Offline
        );
        assert_eq!(
            QualityTier::Failed.derived_status(FailedTierPolicy::Degraded),
            DerivedStatus::Degraded
        );
    }

    #[test]
    fn test_payload_accepts_rfc3339_and_naive_timestamps() {
        let with_offset: ReportPayload =
            serde_json::from_value(payload_json("good", "2024-01-15T10:30:00+02:00")).unwrap();
        assert_eq!(with_offset.timestamp.to_rfc3339(), "2024-01-15T08:30:00+00:00");

        let naive: ReportPayload =
            serde_json::from_value(payload_json("good", "2023-01-01T12:00:00.250")).unwrap();
        assert_eq!(naive.timestamp.to_rfc3339(), "2023-01-01T12:00:00.250+00:00");
    }

    #[test]
    fn test_payload_rejects_garbage_timestamp() {
        let result = serde_json::from_value::<ReportPayload>(payload_json("good", "yesterday"));
        assert!(result.is_err());
    }

    #[test]
    fn test_legacy_and_unknown_tiers() {
        let decode = |s: &str| -> QualityTier {
            serde_json::from_value::<ReportPayload>(payload_json(s, "2024-01-15T10:30:00Z"))
                .unwrap()
                .status
        };

        assert_eq!(decode("excellent"), QualityTier::Excellent);
        assert_eq!(decode("normal"), QualityTier::Good);
        assert_eq!(decode("low"), QualityTier::Degraded);
        assert_eq!(decode("very_low"), QualityTier::Degraded);
        assert_eq!(decode("no_data"), QualityTier::NoData);
        assert_eq!(decode("ok"), QualityTier::Unrecognized);
    }

    #[test]
    fn test_payload_description_is_optional() {
        let payload: ReportPayload =
            serde_json::from_value(payload_json("good", "2024-01-15T10:30:00Z")).unwrap();
        let result = SpeedtestResult::from(payload);

        assert_eq!(result.node_id, "node1");
        assert_eq!(result.quality_tier, QualityTier::Good);
        assert!(result.description.is_none());
    }

    #[test]
    fn test_display_meta_label_falls_back_to_id() {
        let bare = NodeDisplayMeta::bare("node9");
        assert_eq!(bare.label(), "node9");

        let named = NodeDisplayMeta {
            display_name: Some("Helsinki".to_string()),
            ..bare
        };
        assert_eq!(named.label(), "Helsinki");
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = StatusSummary::default();
        summary.record(DerivedStatus::Ok);
        summary.record(DerivedStatus::Ok);
        summary.record(DerivedStatus::Offline);

        assert_eq!(summary.count(DerivedStatus::Ok), 2);
        assert_eq!(summary.count(DerivedStatus::Degraded), 0);
        assert_eq!(summary.total(), 3);
    }
}
