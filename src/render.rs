//! Text rendering of reports for Telegram.
//!
//! # Overview
//!
//! All output is Telegram HTML. Text that comes from nodes or configuration
//! (names, ISP strings, error messages) goes through [`escape_html`] first.
//!
//! - [`render_compact`]: one line per node.
//! - [`render_detailed`]: a block per node with server, ISP and OS.
//! - [`render_single`]: a single-mode measurement of this host.
//!
//! Labels come from per-language tables with identical key sets. A key that
//! is missing from a table renders as the key itself.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::SpeedTier;
use crate::model::{AggregatedReport, DerivedStatus, NodeAggregatedStatus, QualityTier};
use crate::speedtest::SpeedtestOutcome;
use crate::sysinfo::HostInfo;

/// Report language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Ru,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::En, Language::Ru];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ru => "ru",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.as_str() == code)
    }

    fn labels(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Language::En => EN,
            Language::Ru => RU,
        }
    }
}

/// Report layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Compact,
    Detailed,
}

impl ViewMode {
    pub const ALL: [ViewMode; 2] = [ViewMode::Compact, ViewMode::Detailed];

    pub fn as_str(self) -> &'static str {
        match self {
            ViewMode::Compact => "compact",
            ViewMode::Detailed => "detailed",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == code)
    }
}

const EN: &[(&str, &str)] = &[
    ("report_title", "📊 Internet Speed Report"),
    ("summary_header", "Summary"),
    ("no_nodes", "No nodes have reported yet"),
    ("download", "Download"),
    ("upload", "Upload"),
    ("ping", "Ping"),
    ("status", "Status"),
    ("test_server", "Test Server"),
    ("isp", "ISP"),
    ("os", "OS"),
    ("server", "Server"),
    ("desc", "Description"),
    ("id", "ID"),
    ("time", "Time"),
    ("results", "Results"),
    ("error", "Error"),
    ("unknown_error", "Unknown error"),
    ("offline", "No data"),
    ("ok", "Good"),
    ("degraded", "Degraded"),
    ("status_offline", "Offline"),
    ("last_hour", "last hour"),
    ("status_very_low", "Very Low"),
    ("status_low", "Low"),
    ("status_normal", "Normal"),
    ("status_good", "Good"),
    ("status_excellent", "Excellent"),
    ("status_failed", "Failed"),
    ("button_refresh", "🔄 Refresh"),
    ("button_compact", "Compact"),
    ("button_detailed", "Detailed"),
];

const RU: &[(&str, &str)] = &[
    ("report_title", "📊 Отчет о скорости интернета"),
    ("summary_header", "Итоги"),
    ("no_nodes", "Узлы еще не присылали отчетов"),
    ("download", "Загрузка"),
    ("upload", "Отдача"),
    ("ping", "Пинг"),
    ("status", "Статус"),
    ("test_server", "Тестовый сервер"),
    ("isp", "Провайдер"),
    ("os", "ОС"),
    ("server", "Сервер"),
    ("desc", "Описание"),
    ("id", "ID"),
    ("time", "Время"),
    ("results", "Результаты"),
    ("error", "Ошибка"),
    ("unknown_error", "Неизвестная ошибка"),
    ("offline", "Нет данных"),
    ("ok", "Хорошо"),
    ("degraded", "Просадка"),
    ("status_offline", "Офлайн"),
    ("last_hour", "последний час"),
    ("status_very_low", "Очень низко"),
    ("status_low", "Низко"),
    ("status_normal", "Нормально"),
    ("status_good", "Хорошо"),
    ("status_excellent", "Отлично"),
    ("status_failed", "Ошибка"),
    ("button_refresh", "🔄 Обновить"),
    ("button_compact", "Кратко"),
    ("button_detailed", "Подробно"),
];

/// Localized label for `key`, or `key` itself when it has no entry.
pub fn get_label(key: &str, language: Language) -> &str {
    language
        .labels()
        .iter()
        .find(|(k, _)| *k == key)
        .map_or(key, |(_, label)| *label)
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// "50.30 Mbps", or "1.50 Gbps" from 1000 Mbps up.
pub fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{mbps:.2} Mbps")
    }
}

pub fn format_ping(ms: f64) -> String {
    format!("{ms:.2} ms")
}

/// Render a report in the given layout.
pub fn render_report(report: &AggregatedReport, view: ViewMode, language: Language) -> String {
    match view {
        ViewMode::Compact => render_compact(report, language),
        ViewMode::Detailed => render_detailed(report, language),
    }
}

/// One line per node.
///
/// ```text
/// 🇫🇮 Helsinki — 940 / 610 Mbps, ping 3.1 ms — 🚀 Good
/// 🇩🇪 Frankfurt — No data 🔴
/// ```
pub fn render_compact(report: &AggregatedReport, language: Language) -> String {
    let mut lines = vec![title(language), String::new()];

    for node in &report.nodes {
        let name = node_heading(node);
        match online_measurement(node) {
            Some(m) => lines.push(format!(
                "{name} — {:.0} / {:.0} Mbps, ping {:.1} ms — {} {}",
                m.download_mbps,
                m.upload_mbps,
                m.ping_ms,
                tier_emoji(m.quality_tier),
                status_text(node.derived_status, language),
            )),
            None => lines.push(format!(
                "{name} — {} {}",
                get_label("offline", language),
                status_emoji(DerivedStatus::Offline)
            )),
        }
    }

    push_footer(&mut lines, report, language);
    lines.join("\n")
}

/// A block per node, separated by a rule.
pub fn render_detailed(report: &AggregatedReport, language: Language) -> String {
    let label = |key| get_label(key, language);
    let mut lines = vec![title(language), String::new()];

    for (i, node) in report.nodes.iter().enumerate() {
        if i > 0 {
            lines.extend([String::new(), "———".to_string(), String::new()]);
        }

        lines.push(format!("<b>{}</b>", node_heading(node)));

        let Some(m) = online_measurement(node) else {
            lines.push(format!(
                "{} {}",
                status_emoji(DerivedStatus::Offline),
                label("offline")
            ));
            continue;
        };

        if let Some(description) = m.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("📝 {}", escape_html(description)));
        }
        lines.push(format!("⬇️ {}: {:.0} Mbps", label("download"), m.download_mbps));
        lines.push(format!("⬆️ {}: {:.0} Mbps", label("upload"), m.upload_mbps));
        lines.push(format!("📡 {}: {:.1} ms", label("ping"), m.ping_ms));
        lines.push(format!(
            "📈 {}: {} {}",
            label("status"),
            tier_emoji(m.quality_tier),
            status_text(node.derived_status, language)
        ));
        lines.push(String::new());
        lines.push(format!("🌐 {}: {}", label("test_server"), escape_html(&m.test_server)));
        lines.push(format!("🏢 {}: {}", label("isp"), escape_html(&m.isp)));
        lines.push(format!("💻 {}: {}", label("os"), escape_html(&m.os_info)));
    }

    push_footer(&mut lines, report, language);
    lines.join("\n")
}

/// Render a single-mode measurement of this host.
///
/// A failed measurement always uses the error layout, whatever `view` says.
pub fn render_single(
    outcome: &SpeedtestOutcome,
    tier: SpeedTier,
    host: &HostInfo,
    view: ViewMode,
    language: Language,
    at: DateTime<Utc>,
) -> String {
    let label = |key| get_label(key, language);
    let header = format!("<b>{}</b>", label("report_title"));
    let status = format!("{} {}", tier.emoji(), label(tier.label_key()));

    if outcome.success && view == ViewMode::Compact {
        return [
            header,
            format!(
                "⬇️ {} | ⬆️ {} | 📡 {}",
                format_speed(outcome.download_mbps),
                format_speed(outcome.upload_mbps),
                format_ping(outcome.ping_ms)
            ),
            status,
        ]
        .join("\n");
    }

    let mut lines = vec![header, String::new()];
    let mut server = escape_html(&host.name);
    if let Some(location) = &host.location {
        let _ = write!(server, " ({})", escape_html(location));
    }
    lines.push(format!("🖥 <b>{}:</b> {server}", label("server")));
    if !host.description.is_empty() {
        lines.push(format!(
            "📝 <b>{}:</b> {}",
            label("desc"),
            escape_html(&host.description)
        ));
    }
    lines.push(format!("🆔 <b>{}:</b> {}", label("id"), escape_html(&host.identifier)));
    lines.push(format!(
        "🕐 <b>{}:</b> {}",
        label("time"),
        at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    lines.push(String::new());

    if outcome.success {
        lines.push(format!("📶 <b>{}:</b>", label("results")));
        lines.push(format!(
            "⬇️ <b>{}:</b> {}",
            label("download"),
            format_speed(outcome.download_mbps)
        ));
        lines.push(format!(
            "⬆️ <b>{}:</b> {}",
            label("upload"),
            format_speed(outcome.upload_mbps)
        ));
        lines.push(format!("📡 <b>{}:</b> {}", label("ping"), format_ping(outcome.ping_ms)));
        lines.push(String::new());
        lines.push(format!("📈 <b>{}:</b> {status}", label("status")));
        lines.push(String::new());
        if !outcome.server_location.is_empty() {
            lines.push(format!(
                "🌐 <b>{}:</b> {}",
                label("test_server"),
                escape_html(&outcome.server_location)
            ));
        }
        if !outcome.isp.is_empty() {
            lines.push(format!("🏢 <b>{}:</b> {}", label("isp"), escape_html(&outcome.isp)));
        }
    } else {
        let error = outcome
            .error_message
            .as_deref()
            .unwrap_or_else(|| label("unknown_error"));
        lines.push(format!("❌ <b>{}:</b> {}", label("error"), escape_html(error)));
        lines.push(String::new());
    }

    lines.push(format!("💻 <b>{}:</b> {}", label("os"), escape_html(&host.os_label)));
    lines.join("\n")
}

fn title(language: Language) -> String {
    format!(
        "<b>{}</b> ({})",
        get_label("report_title", language),
        get_label("last_hour", language)
    )
}

fn push_footer(lines: &mut Vec<String>, report: &AggregatedReport, language: Language) {
    lines.push(String::new());
    if report.nodes.is_empty() {
        lines.push(get_label("no_nodes", language).to_string());
        return;
    }

    let counts = DerivedStatus::ALL
        .iter()
        .map(|&status| format!("{} {}", status_emoji(status), report.summary.count(status)))
        .collect::<Vec<_>>()
        .join(" · ");
    lines.push(format!("<b>{}:</b> {counts}", get_label("summary_header", language)));
}

fn node_heading(node: &NodeAggregatedStatus) -> String {
    let name = escape_html(node.meta.label());
    match node.meta.flag.as_deref() {
        Some(flag) if !flag.is_empty() => format!("{flag} {name}"),
        _ => name,
    }
}

fn online_measurement(node: &NodeAggregatedStatus) -> Option<&crate::model::SpeedtestResult> {
    node.last_measurement.as_ref().filter(|_| node.is_online)
}

fn status_text(status: DerivedStatus, language: Language) -> &'static str {
    let key = match status {
        DerivedStatus::Ok => "ok",
        DerivedStatus::Degraded => "degraded",
        DerivedStatus::Offline => "status_offline",
    };
    get_label(key, language)
}

fn status_emoji(status: DerivedStatus) -> &'static str {
    match status {
        DerivedStatus::Ok => "✅",
        DerivedStatus::Degraded => "⚠️",
        DerivedStatus::Offline => "🔴",
    }
}

fn tier_emoji(tier: QualityTier) -> &'static str {
    match tier {
        QualityTier::Excellent => "🚀",
        QualityTier::Good => "👍",
        QualityTier::Degraded => "⚠️",
        QualityTier::Failed => "❌",
        QualityTier::NoData | QualityTier::Unrecognized => "❓",
    }
}
