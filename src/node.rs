//! Node mode: measure, classify and report to the master.

use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument, warn};

use crate::classify::{Thresholds, classify_outcome};
use crate::config::{NodeConfig, SpeedtestConfig};
use crate::model::{ReportPayload, SpeedtestResult};
use crate::speedtest::{SpeedtestOutcome, SpeedtestRunner};
use crate::sysinfo::os_label;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the master's report endpoint.
#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    master_url: String,
    api_token: SecretString,
}

impl NodeClient {
    /// # Arguments
    ///
    /// * `master_url` - Full URL of `POST /api/v1/report` on the master.
    /// * `api_token` - Shared bearer secret.
    pub fn new(master_url: &str, api_token: SecretString) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            master_url: master_url.to_string(),
            api_token,
        })
    }

    /// POST one measurement. Any non-2xx answer is an error.
    #[instrument(skip_all, fields(node_id = %measurement.node_id))]
    pub async fn send(&self, measurement: &SpeedtestResult) -> anyhow::Result<()> {
        let payload = ReportPayload::from(measurement);

        let response = self
            .client
            .post(&self.master_url)
            .bearer_auth(self.api_token.expose_secret())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("master answered {status}: {}", body.trim());
        }

        info!(%status, "Report delivered to master");
        Ok(())
    }
}

/// Turn a local speedtest outcome into the measurement sent to the master.
pub fn build_measurement(
    node: &NodeConfig,
    outcome: &SpeedtestOutcome,
    thresholds: &Thresholds,
    os_info: String,
) -> SpeedtestResult {
    let tier = classify_outcome(outcome.success, outcome.download_mbps, thresholds);
    let description = Some(node.description.clone()).filter(|d| !d.is_empty());

    SpeedtestResult {
        node_id: node.node_id.clone(),
        observed_at: Utc::now(),
        download_mbps: outcome.download_mbps,
        upload_mbps: outcome.upload_mbps,
        ping_ms: outcome.ping_ms,
        quality_tier: tier.quality_tier(),
        test_server: outcome.test_server_label(),
        isp: outcome.isp.clone(),
        os_info,
        description,
    }
}

/// Run one node cycle: measure, then report to the master.
pub async fn run_node(
    node: &NodeConfig,
    speedtest: &SpeedtestConfig,
    thresholds: &Thresholds,
) -> anyhow::Result<()> {
    info!(node_id = %node.node_id, "Starting node cycle");

    let outcome = SpeedtestRunner::new(speedtest.clone()).run().await;
    if !outcome.success {
        warn!(error = ?outcome.error_message, "Speedtest failed, reporting the failure");
    }

    let measurement = build_measurement(node, &outcome, thresholds, os_label());
    let client = NodeClient::new(&node.master_url, node.api_token.clone())?;
    client.send(&measurement).await?;

    info!(tier = ?measurement.quality_tier, "Node cycle completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QualityTier;

    fn node() -> NodeConfig {
        NodeConfig {
            node_id: "fi-hel-1".to_string(),
            description: "rack 4".to_string(),
            master_url: "http://master/api/v1/report".to_string(),
            api_token: SecretString::from("t".to_string()),
        }
    }

    fn outcome(success: bool, download: f64) -> SpeedtestOutcome {
        SpeedtestOutcome {
            download_mbps: download,
            upload_mbps: 100.0,
            ping_ms: 3.0,
            server_name: "Telia".to_string(),
            server_location: "Helsinki".to_string(),
            isp: "Hetzner".to_string(),
            success,
            error_message: None,
        }
    }

    #[test]
    fn test_build_measurement_classifies() {
        let thresholds = Thresholds::default();

        let m = build_measurement(&node(), &outcome(true, 300.0), &thresholds, "Linux".into());
        assert_eq!(m.node_id, "fi-hel-1");
        assert_eq!(m.quality_tier, QualityTier::Good);
        assert_eq!(m.test_server, "Telia (Helsinki)");
        assert_eq!(m.description.as_deref(), Some("rack 4"));

        let m = build_measurement(&node(), &outcome(true, 10.0), &thresholds, "Linux".into());
        assert_eq!(m.quality_tier, QualityTier::Degraded);

        let m = build_measurement(&node(), &outcome(false, 5000.0), &thresholds, "Linux".into());
        assert_eq!(m.quality_tier, QualityTier::Failed);
    }

    #[test]
    fn test_empty_description_is_omitted() {
        let node = NodeConfig {
            description: String::new(),
            ..node()
        };
        let m = build_measurement(&node, &outcome(true, 1.0), &Thresholds::default(), "Linux".into());
        assert!(m.description.is_none());
    }
}
