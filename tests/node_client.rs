// Integration tests for the node's report client using wiremock.

use chrono::{TimeZone, Utc};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use speedtest_monitor::model::{QualityTier, SpeedtestResult};
use speedtest_monitor::node::NodeClient;

async fn setup() -> (MockServer, NodeClient) {
    let server = MockServer::start().await;
    let url = format!("{}/api/v1/report", server.uri());
    let client = NodeClient::new(&url, SecretString::from("node-secret".to_string())).unwrap();
    (server, client)
}

fn measurement() -> SpeedtestResult {
    SpeedtestResult {
        node_id: "fi-hel-1".to_string(),
        observed_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
        download_mbps: 120.5,
        upload_mbps: 40.0,
        ping_ms: 12.0,
        quality_tier: QualityTier::Degraded,
        test_server: "Telia (Helsinki)".to_string(),
        isp: "Hetzner".to_string(),
        os_info: "Linux 6.1.0".to_string(),
        description: Some("rack 4".to_string()),
    }
}

#[tokio::test]
async fn test_send_report() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/report"))
        .and(header("authorization", "Bearer node-secret"))
        .and(body_partial_json(json!({
            "node_id": "fi-hel-1",
            "timestamp": "2024-01-15T10:30:00Z",
            "download_mbps": 120.5,
            "status": "degraded",
            "test_server": "Telia (Helsinki)",
            "description": "rack 4",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    client.send(&measurement()).await.unwrap();
}

#[tokio::test]
async fn test_rejected_report_is_error() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/report"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client.send(&measurement()).await.unwrap_err();
    let message = err.to_string();

    assert!(message.contains("401"));
    assert!(message.contains("Unauthorized"));
}
