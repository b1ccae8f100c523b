//! Single mode: measure this host and notify chats directly.

use chrono::Utc;
use tracing::{info, warn};

use crate::classify::{Thresholds, classify_outcome};
use crate::config::Config;
use crate::notifier::DeliverySummary;
use crate::render::render_single;
use crate::speedtest::{SpeedtestOutcome, SpeedtestRunner};
use crate::sysinfo::{GeoClient, HostInfo};
use crate::telegram::TelegramClient;

/// Whether a measurement is worth a message.
///
/// Failures are always reported. Otherwise only slow links are, unless
/// `send_always` is set.
pub fn should_notify(outcome: &SpeedtestOutcome, send_always: bool, thresholds: &Thresholds) -> bool {
    !outcome.success || send_always || outcome.download_mbps < thresholds.low
}

/// Send `text` to every chat, continuing past failures.
pub async fn send_to_chats(telegram: &TelegramClient, chat_ids: &[i64], text: &str) -> DeliverySummary {
    let mut summary = DeliverySummary::default();

    for &chat_id in chat_ids {
        match telegram.send_long_message(chat_id, text, None).await {
            Ok(_) => summary.sent += 1,
            Err(e) => {
                warn!(chat_id, error = %e, "Failed to send notification");
                summary.failed += 1;
            }
        }
    }

    summary
}

/// Run one single-mode cycle.
///
/// Fails only when a message was due and no chat could be reached.
pub async fn run_single(config: &Config) -> anyhow::Result<()> {
    let outcome = SpeedtestRunner::new(config.speedtest.clone()).run().await;
    let tier = classify_outcome(outcome.success, outcome.download_mbps, &config.thresholds);

    if !should_notify(&outcome, config.telegram.send_always, &config.thresholds) {
        info!(
            download_mbps = outcome.download_mbps,
            "Skipping notification (speed is fine and send_always is off)"
        );
        return Ok(());
    }

    let host = HostInfo::resolve(&config.server, &GeoClient::new()?).await;
    let text = render_single(
        &outcome,
        tier,
        &host,
        config.telegram.default_view_mode,
        config.telegram.default_language,
        Utc::now(),
    );

    let telegram = TelegramClient::new(config.telegram.bot_token.clone())?;
    let summary = send_to_chats(&telegram, &config.telegram.chat_ids, &text).await;
    info!(sent = summary.sent, failed = summary.failed, "Notification round finished");

    if summary.sent == 0 && summary.failed > 0 {
        anyhow::bail!("notification could not be delivered to any chat");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool, download: f64) -> SpeedtestOutcome {
        SpeedtestOutcome {
            download_mbps: download,
            success,
            error_message: None,
            ..SpeedtestOutcome::failure("")
        }
    }

    #[test]
    fn test_failures_always_notify() {
        assert!(should_notify(&outcome(false, 5000.0), false, &Thresholds::default()));
    }

    #[test]
    fn test_slow_link_notifies() {
        let t = Thresholds::default();
        assert!(should_notify(&outcome(true, 199.9), false, &t));
        assert!(!should_notify(&outcome(true, 200.0), false, &t));
        assert!(!should_notify(&outcome(true, 950.0), false, &t));
    }

    #[test]
    fn test_send_always_overrides() {
        assert!(should_notify(&outcome(true, 950.0), true, &Thresholds::default()));
    }
}
