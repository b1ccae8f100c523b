//! Delivery of rendered reports to Telegram chats.
//!
//! # Overview
//!
//! [`ReportNotifier`] sends aggregated reports to the master's target chats,
//! each in the language and layout that chat has picked. Every report message
//! carries an inline keyboard; its button data is decoded by
//! [`CallbackAction::parse`].
//!
//! Delivery to one chat never blocks delivery to the others: failures are
//! logged and counted.

use tracing::{info, warn};

use crate::config::TelegramTargetConfig;
use crate::model::AggregatedReport;
use crate::prefs::{ChatPreferences, PrefsStore};
use crate::render::{Language, ViewMode, get_label, render_report};
use crate::telegram::{InlineKeyboardButton, InlineKeyboardMarkup, TelegramClient};

/// A press of one of the report keyboard buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    SetLanguage(Language),
    SetView(ViewMode),
    Refresh,
}

impl CallbackAction {
    /// Decode `lang:<code>`, `view:<mode>` or `refresh`.
    pub fn parse(data: &str) -> Option<Self> {
        match data.split_once(':') {
            Some(("lang", code)) => Language::parse(code).map(CallbackAction::SetLanguage),
            Some(("view", mode)) => ViewMode::parse(mode).map(CallbackAction::SetView),
            None if data == "refresh" => Some(CallbackAction::Refresh),
            _ => None,
        }
    }

    pub fn data(self) -> String {
        match self {
            CallbackAction::SetLanguage(lang) => format!("lang:{}", lang.as_str()),
            CallbackAction::SetView(view) => format!("view:{}", view.as_str()),
            CallbackAction::Refresh => "refresh".to_string(),
        }
    }
}

/// Keyboard attached to every report: language, layout and refresh.
///
/// The current choices are marked with a check.
pub fn report_keyboard(language: Language, view: ViewMode) -> InlineKeyboardMarkup {
    let mark = |selected: bool, text: &str| {
        if selected {
            format!("✓ {text}")
        } else {
            text.to_string()
        }
    };

    let languages = Language::ALL
        .into_iter()
        .map(|lang| {
            let name = match lang {
                Language::En => "🇬🇧 English",
                Language::Ru => "🇷🇺 Русский",
            };
            InlineKeyboardButton::new(
                mark(lang == language, name),
                CallbackAction::SetLanguage(lang).data(),
            )
        })
        .collect();

    let views = ViewMode::ALL
        .into_iter()
        .map(|mode| {
            let key = match mode {
                ViewMode::Compact => "button_compact",
                ViewMode::Detailed => "button_detailed",
            };
            InlineKeyboardButton::new(
                mark(mode == view, get_label(key, language)),
                CallbackAction::SetView(mode).data(),
            )
        })
        .collect();

    let refresh = vec![InlineKeyboardButton::new(
        get_label("button_refresh", language),
        CallbackAction::Refresh.data(),
    )];

    InlineKeyboardMarkup {
        inline_keyboard: vec![languages, views, refresh],
    }
}

/// Counts from one delivery round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub sent: usize,
    pub failed: usize,
}

/// Sends aggregated reports to chats.
#[derive(Clone)]
pub struct ReportNotifier {
    telegram: TelegramClient,
    prefs: PrefsStore,
    targets: Vec<TelegramTargetConfig>,
    default_language: Language,
    default_view: ViewMode,
}

impl ReportNotifier {
    pub fn new(
        telegram: TelegramClient,
        prefs: PrefsStore,
        targets: Vec<TelegramTargetConfig>,
    ) -> Self {
        Self {
            telegram,
            prefs,
            targets,
            default_language: Language::default(),
            default_view: ViewMode::default(),
        }
    }

    /// Preferences for chats that are not configured targets.
    pub fn with_defaults(mut self, language: Language, view: ViewMode) -> Self {
        self.default_language = language;
        self.default_view = view;
        self
    }

    pub fn telegram(&self) -> &TelegramClient {
        &self.telegram
    }

    /// Stored preferences of `chat_id`, created from the target's configured
    /// defaults on first use.
    pub async fn preferences(&self, chat_id: i64) -> anyhow::Result<ChatPreferences> {
        let (language, view) = self
            .targets
            .iter()
            .find(|t| t.chat_id == chat_id)
            .map_or((self.default_language, self.default_view), |t| {
                (t.default_language, t.default_view_mode)
            });

        self.prefs.ensure_defaults(chat_id, language, view).await
    }

    /// Send `report` to every target chat.
    pub async fn deliver(&self, report: &AggregatedReport) -> DeliverySummary {
        let mut summary = DeliverySummary::default();

        for target in &self.targets {
            match self.send_report(target.chat_id, report).await {
                Ok(()) => summary.sent += 1,
                Err(e) => {
                    warn!(chat_id = target.chat_id, error = %e, "Failed to deliver report");
                    summary.failed += 1;
                }
            }
        }

        info!(
            sent = summary.sent,
            failed = summary.failed,
            nodes = report.nodes.len(),
            "Report delivered"
        );
        summary
    }

    /// Send `report` to one chat in that chat's preferences.
    pub async fn send_report(&self, chat_id: i64, report: &AggregatedReport) -> anyhow::Result<()> {
        let prefs = self.preferences(chat_id).await?;
        let text = render_report(report, prefs.view_mode, prefs.language);
        let keyboard = report_keyboard(prefs.language, prefs.view_mode);

        self.telegram
            .send_long_message(chat_id, &text, Some(&keyboard))
            .await?;
        Ok(())
    }

    /// Redraw an existing report message in the chat's current preferences.
    pub async fn refresh_message(
        &self,
        chat_id: i64,
        message_id: i64,
        report: &AggregatedReport,
    ) -> anyhow::Result<()> {
        let prefs = self.preferences(chat_id).await?;
        let text = render_report(report, prefs.view_mode, prefs.language);
        let keyboard = report_keyboard(prefs.language, prefs.view_mode);

        self.telegram
            .edit_message_text(chat_id, message_id, &text, Some(&keyboard))
            .await?;
        Ok(())
    }

    /// Apply a keyboard action to the chat's stored preferences.
    pub async fn apply(&self, chat_id: i64, action: CallbackAction) -> anyhow::Result<()> {
        // Create the row with the target's defaults before changing one column.
        self.preferences(chat_id).await?;

        match action {
            CallbackAction::SetLanguage(language) => {
                self.prefs.set_language(chat_id, language).await
            }
            CallbackAction::SetView(view) => self.prefs.set_view_mode(chat_id, view).await,
            CallbackAction::Refresh => Ok(()),
        }
    }
}
