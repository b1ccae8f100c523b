//! Master mode: ingestion, scheduled publishing and the chat bot.
//!
//! # Overview
//!
//! [`MasterService`] owns the [`Aggregator`] and everything that reacts to
//! it:
//!
//! - [`MasterService::ingest`] records a node report and, with
//!   `schedule.send_immediately`, publishes right away.
//! - [`MasterService::run_scheduler`] publishes every `interval_minutes`.
//! - [`MasterService::run_polling`] answers chat commands and keyboard
//!   presses.
//!
//! Background loops stop when their [`CancellationToken`] is cancelled.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::aggregation::{AggregationSettings, Aggregator};
use crate::config::ScheduleConfig;
use crate::model::{AggregatedReport, SpeedtestResult};
use crate::notifier::{CallbackAction, ReportNotifier};
use crate::telegram::{CallbackQuery, Message, Update};

/// Long-poll timeout for `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Master-side state and behaviour.
pub struct MasterService {
    aggregator: Aggregator,
    settings: AggregationSettings,
    schedule: ScheduleConfig,
    notifier: Option<ReportNotifier>,
    warned_unknown: Mutex<HashSet<String>>,
}

impl MasterService {
    pub fn new(settings: AggregationSettings, schedule: ScheduleConfig) -> Self {
        Self {
            aggregator: Aggregator::new(),
            settings,
            schedule,
            notifier: None,
            warned_unknown: Mutex::new(HashSet::new()),
        }
    }

    /// Deliver published reports through `notifier`.
    pub fn with_notifier(mut self, notifier: ReportNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Record a node report received at `received_at`.
    ///
    /// When the schedule asks for immediate reports, a publish is started in
    /// the background and this returns without waiting for delivery.
    /// Delivery problems are logged and never undo the update.
    #[instrument(skip_all, fields(node_id = %measurement.node_id))]
    pub fn ingest(self: &Arc<Self>, measurement: SpeedtestResult, received_at: DateTime<Utc>) {
        if !self.settings.is_known(&measurement.node_id) {
            self.warn_unknown_once(&measurement.node_id);
        }

        info!(
            tier = ?measurement.quality_tier,
            download_mbps = measurement.download_mbps,
            "Node report accepted"
        );
        self.aggregator.update(measurement, received_at);

        if self.schedule.send_immediately {
            let master = Arc::clone(self);
            tokio::spawn(
                async move {
                    master.publish(received_at).await;
                }
                .in_current_span(),
            );
        }
    }

    pub fn build_report(&self, now: DateTime<Utc>) -> AggregatedReport {
        self.aggregator.build_report(&self.settings, now)
    }

    /// Build a report and send it to every target chat.
    pub async fn publish(&self, now: DateTime<Utc>) -> AggregatedReport {
        let report = self.build_report(now);
        info!(
            ok = report.summary.ok,
            degraded = report.summary.degraded,
            offline = report.summary.offline,
            "Publishing report"
        );

        match &self.notifier {
            Some(notifier) => {
                notifier.deliver(&report).await;
            }
            None => debug!("No notifier configured, report not delivered"),
        }
        report
    }

    fn warn_unknown_once(&self, node_id: &str) {
        let first_time = self
            .warned_unknown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_string());

        if first_time {
            warn!(
                node_id,
                suggestion = %unknown_node_snippet(node_id),
                "Report from a node missing from master.nodes_meta; add it to the config"
            );
        }
    }

    /// Publish on a fixed period until `cancel` fires.
    ///
    /// The first report goes out one full interval after start.
    pub async fn run_scheduler(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.schedule.interval_minutes.max(1) * 60);
        self.publish_every(period, cancel).await;
    }

    async fn publish_every(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_minutes = self.schedule.interval_minutes,
            send_immediately = self.schedule.send_immediately,
            "Report scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.publish(Utc::now()).await;
                }
            }
        }

        info!("Report scheduler stopped");
    }

    /// Answer bot commands and keyboard presses until `cancel` fires.
    pub async fn run_polling(self: Arc<Self>, cancel: CancellationToken) {
        let Some(notifier) = self.notifier.clone() else {
            warn!("Telegram polling requested without a notifier");
            return;
        };

        info!("Telegram polling started");
        let mut offset: Option<i64> = None;

        loop {
            let poll = notifier.telegram().get_updates(offset, POLL_TIMEOUT_SECS);
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = poll => result,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.handle_update(&notifier, update).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to poll Telegram updates");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Telegram polling stopped");
    }

    async fn handle_update(&self, notifier: &ReportNotifier, update: Update) {
        if let Some(message) = update.message {
            self.handle_message(notifier, message).await;
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(notifier, callback).await;
        }
    }

    #[instrument(skip_all, fields(chat_id = message.chat.id))]
    async fn handle_message(&self, notifier: &ReportNotifier, message: Message) {
        let Some(command) = message.text.as_deref().and_then(parse_command) else {
            return;
        };

        match command {
            "start" | "report" | "status" => {
                info!(command, "Report requested");
                let report = self.build_report(Utc::now());
                if let Err(e) = notifier.send_report(message.chat.id, &report).await {
                    warn!(error = %e, "Failed to answer report command");
                }
            }
            other => debug!(command = other, "Ignoring unknown command"),
        }
    }

    #[instrument(skip_all, fields(callback_id = %callback.id))]
    async fn handle_callback(&self, notifier: &ReportNotifier, callback: CallbackQuery) {
        let action = callback.data.as_deref().and_then(CallbackAction::parse);

        if let Err(e) = notifier.telegram().answer_callback_query(&callback.id, None).await {
            warn!(error = %e, "Failed to answer callback query");
        }

        let (Some(action), Some(message)) = (action, callback.message) else {
            debug!(data = ?callback.data, "Ignoring callback without action or message");
            return;
        };

        let chat_id = message.chat.id;
        if let Err(e) = notifier.apply(chat_id, action).await {
            warn!(chat_id, error = %e, "Failed to update chat preferences");
            return;
        }

        let report = self.build_report(Utc::now());
        if let Err(e) = notifier
            .refresh_message(chat_id, message.message_id, &report)
            .await
        {
            warn!(chat_id, error = %e, "Failed to refresh report message");
        }
    }
}

/// Command name of a bot command message, without the slash or a
/// `@botname` suffix.
fn parse_command(text: &str) -> Option<&str> {
    let word = text.split_whitespace().next()?;
    let command = word.strip_prefix('/')?;
    let command = command.split('@').next().unwrap_or(command);
    (!command.is_empty()).then_some(command)
}

/// Config fragment to paste into `master.nodes_meta` for a new node.
fn unknown_node_snippet(node_id: &str) -> String {
    format!("nodes_meta:\n  {node_id}:\n    flag: \"🏳️\"\n    display_name: \"{node_id}\"")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeDelta;
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::TelegramTargetConfig;
    use crate::model::{DerivedStatus, FailedTierPolicy, NodeDisplayMeta, QualityTier};
    use crate::prefs::PrefsStore;
    use crate::render::{Language, ViewMode};
    use crate::telegram::TelegramClient;

    fn settings() -> AggregationSettings {
        let mut nodes_meta = BTreeMap::new();
        nodes_meta.insert(
            "fi-hel-1".to_string(),
            NodeDisplayMeta {
                node_id: "fi-hel-1".to_string(),
                flag: Some("🇫🇮".to_string()),
                display_name: Some("Helsinki".to_string()),
            },
        );
        AggregationSettings {
            nodes_meta,
            nodes_order: vec!["fi-hel-1".to_string()],
            node_timeout: TimeDelta::minutes(60),
            failed_tier: FailedTierPolicy::Offline,
        }
    }

    fn measurement(node_id: &str, tier: QualityTier) -> SpeedtestResult {
        SpeedtestResult {
            node_id: node_id.to_string(),
            observed_at: Utc::now(),
            download_mbps: 500.0,
            upload_mbps: 100.0,
            ping_ms: 4.0,
            quality_tier: tier,
            test_server: "Srv".to_string(),
            isp: "ISP".to_string(),
            os_info: "Linux".to_string(),
            description: None,
        }
    }

    fn service(send_immediately: bool) -> MasterService {
        MasterService::new(
            settings(),
            ScheduleConfig {
                interval_minutes: 60,
                send_immediately,
            },
        )
    }

    const TOKEN: &str = "123:abc";

    fn api_path(method: &str) -> String {
        format!("/bot{TOKEN}/{method}")
    }

    fn sent_message(chat_id: i64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 1, "chat": { "id": chat_id } }
        }))
    }

    async fn notifier(server: &MockServer) -> ReportNotifier {
        let telegram =
            TelegramClient::with_base_url(&server.uri(), SecretString::from(TOKEN.to_string()))
                .unwrap()
                .with_retry_delay(Duration::ZERO);
        let prefs = PrefsStore::new("sqlite::memory:").await.unwrap();

        ReportNotifier::new(
            telegram,
            prefs,
            vec![TelegramTargetConfig {
                chat_id: 42,
                default_language: Language::En,
                default_view_mode: ViewMode::Compact,
            }],
        )
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.map_or(0, |r| r.len())
    }

    #[tokio::test]
    async fn test_ingest_updates_report() {
        let master = Arc::new(service(false));
        let now = Utc::now();

        master.ingest(measurement("fi-hel-1", QualityTier::Excellent), now);
        master.ingest(measurement("zz-new", QualityTier::Degraded), now);

        let report = master.build_report(now);
        assert_eq!(report.nodes.len(), 2);
        assert_eq!(report.nodes[0].meta.node_id, "fi-hel-1");
        assert_eq!(report.nodes[0].derived_status, DerivedStatus::Ok);
        assert_eq!(report.nodes[1].meta.node_id, "zz-new");
        assert_eq!(report.nodes[1].derived_status, DerivedStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unknown_node_warned_once() {
        let master = Arc::new(service(true));
        let now = Utc::now();

        for _ in 0..3 {
            master.ingest(measurement("zz-new", QualityTier::Good), now);
        }
        master.ingest(measurement("fi-hel-1", QualityTier::Good), now);

        let warned = master.warned_unknown.lock().unwrap();
        assert_eq!(warned.len(), 1);
        assert!(warned.contains("zz-new"));
    }

    #[tokio::test]
    async fn test_publish_without_notifier_returns_report() {
        let master = service(false);
        let now = Utc::now();

        let report = master.publish(now).await;
        assert_eq!(report.generated_at, now);
        assert_eq!(report.summary.offline, 1);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let master = Arc::new(service(false));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&master).run_scheduler(cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_publishes_every_period() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api_path("sendMessage")))
            .and(body_partial_json(json!({ "chat_id": 42 })))
            .and(body_string_contains("Helsinki"))
            .respond_with(sent_message(42))
            .mount(&server)
            .await;

        let master = service(false).with_notifier(notifier(&server).await);
        let cancel = CancellationToken::new();

        let run = master.publish_every(Duration::from_millis(50), cancel.clone());
        let stop_after_two = async {
            while request_count(&server).await < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(run, stop_after_two)
        })
        .await
        .unwrap();

        assert!(request_count(&server).await >= 2);
    }

    #[tokio::test]
    async fn test_report_command_answers_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api_path("sendMessage")))
            .and(body_partial_json(json!({ "chat_id": 7, "parse_mode": "HTML" })))
            .and(body_string_contains("Helsinki"))
            .respond_with(sent_message(7))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = notifier(&server).await;
        let master = service(false);

        for (update_id, text) in [(1, "hello"), (2, "/report@speed_bot")] {
            let update: Update = serde_json::from_value(json!({
                "update_id": update_id,
                "message": { "message_id": update_id, "chat": { "id": 7 }, "text": text }
            }))
            .unwrap();
            master.handle_update(&notifier, update).await;
        }
    }

    #[tokio::test]
    async fn test_view_callback_updates_prefs_and_edits_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(api_path("answerCallbackQuery")))
            .and(body_partial_json(json!({ "callback_query_id": "cb-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(api_path("editMessageText")))
            .and(body_partial_json(json!({ "chat_id": 42, "message_id": 9 })))
            .and(body_string_contains("Download: 500 Mbps"))
            .and(body_string_contains("✓ Detailed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = notifier(&server).await;
        let master = Arc::new(service(false));
        master.ingest(measurement("fi-hel-1", QualityTier::Excellent), Utc::now());

        let update: Update = serde_json::from_value(json!({
            "update_id": 3,
            "callback_query": {
                "id": "cb-1",
                "data": "view:detailed",
                "message": { "message_id": 9, "chat": { "id": 42 } }
            }
        }))
        .unwrap();
        master.handle_update(&notifier, update).await;

        let prefs = notifier.preferences(42).await.unwrap();
        assert_eq!(prefs.view_mode, ViewMode::Detailed);
        assert_eq!(prefs.language, Language::En);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/report"), Some("report"));
        assert_eq!(parse_command("  /status@speed_bot extra"), Some("status"));
        assert_eq!(parse_command("/start"), Some("start"));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn test_unknown_node_snippet() {
        let snippet = unknown_node_snippet("de-fra-2");
        assert!(snippet.starts_with("nodes_meta:\n  de-fra-2:\n"));
        assert!(snippet.contains("display_name: \"de-fra-2\""));
    }
}
