//! Minimal Telegram Bot API client.
//!
//! Covers what the monitor needs: sending and editing HTML messages with an
//! inline keyboard, answering button presses, and long-polling for updates.
//!
//! # API Reference
//!
//! See: <https://core.telegram.org/bots/api>
//!
//! The bot token is part of every request URL, so transport errors are
//! stripped of their URL before they can reach a log line.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

/// Base URL for the Telegram Bot API.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Longest text Telegram accepts in one message.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram request failed: {0}")]
    Transport(reqwest::Error),

    #[error("Telegram API error {code}: {description}")]
    Api {
        code: u16,
        description: String,
        retry_after: Option<u64>,
    },
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        TelegramError::Transport(e.without_url())
    }
}

impl TelegramError {
    /// Network failures, rate limits and server-side errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            TelegramError::Transport(_) => true,
            TelegramError::Api { code, .. } => *code == 429 || *code >= 500,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TelegramError::Api {
                retry_after: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboardButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub message: Option<Message>,
    pub data: Option<String>,
}

/// One incoming update. Kinds other than messages and button presses are
/// left as `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Client for the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
    retry_delay: Duration,
}

impl TelegramClient {
    pub fn new(token: SecretString) -> Result<Self, TelegramError> {
        Self::with_base_url(TELEGRAM_API_BASE, token)
    }

    /// Create a client with a custom base URL (for testing).
    pub fn with_base_url(base_url: &str, token: SecretString) -> Result<Self, TelegramError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry_delay: RETRY_DELAY,
        })
    }

    /// Override the pause between retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Send an HTML message, retrying transient failures.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = json!(markup);
        }

        self.call("sendMessage", &body).await
    }

    /// Send text of any length as consecutive messages.
    ///
    /// The keyboard is attached to the last part only. Returns the last
    /// message sent.
    pub async fn send_long_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TelegramError> {
        let mut parts = split_message(text, MAX_MESSAGE_LENGTH);
        let last = parts.pop().unwrap_or_default();

        for part in &parts {
            self.send_message(chat_id, part, None).await?;
        }
        self.send_message(chat_id, &last, reply_markup).await
    }

    /// Replace the text and keyboard of a sent message.
    ///
    /// Editing a message to identical content is not an error.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = json!(markup);
        }

        match self.call::<serde_json::Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(TelegramError::Api { description, .. })
                if description.contains("message is not modified") =>
            {
                debug!(chat_id, message_id, "Message already up to date");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "callback_query_id": callback_query_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }

        self.call::<bool>("answerCallbackQuery", &body).await?;
        Ok(())
    }

    /// Long-poll for updates. Not retried; the polling loop decides.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }

        self.call_once(
            "getUpdates",
            &body,
            REQUEST_TIMEOUT + Duration::from_secs(timeout_secs),
        )
        .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let mut attempt = 1;
        loop {
            match self.call_once(method, body, REQUEST_TIMEOUT).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    let delay = e.retry_after().unwrap_or(self.retry_delay);
                    warn!(method, attempt, error = %e, "Telegram request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T, TelegramError> {
        let url = format!(
            "{}/bot{}/{}",
            self.base_url,
            self.token.expose_secret(),
            method
        );

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let decoded = match response.json::<ApiResponse<T>>().await {
            Ok(decoded) => decoded,
            Err(_) => {
                return Err(TelegramError::Api {
                    code: status.as_u16(),
                    description: format!("unreadable response to {method}"),
                    retry_after: None,
                });
            }
        };

        match decoded {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            other => Err(TelegramError::Api {
                code: other.error_code.unwrap_or(status.as_u16()),
                description: other
                    .description
                    .unwrap_or_else(|| format!("{method} returned no result")),
                retry_after: other.parameters.and_then(|p| p.retry_after),
            }),
        }
    }
}

/// Split `text` into parts of at most `limit` characters.
///
/// Splits happen between lines. A single line longer than `limit` is cut
/// with [`cut_line`] so no HTML tag or entity is broken.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();

        if line_len > limit {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            parts.extend(cut_line(line, limit));
            continue;
        }

        if !current.is_empty() && current_len + 1 + line_len > limit {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() || parts.is_empty() {
        parts.push(current);
    }
    parts
}

/// Cut an oversized line into pieces of at most `limit` characters.
fn cut_line(line: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;

    while chars.len() - start > limit {
        let end = start + cut_point(&chars[start..], limit);
        pieces.push(chars[start..end].iter().collect());
        start = end;
    }
    pieces.push(chars[start..].iter().collect());
    pieces
}

/// Furthest cut in `1..=limit` that is outside any tag or entity.
///
/// Cuts where no element is open win over cuts inside one. Falls back to
/// `limit` when a single tag or entity spans the whole window.
fn cut_point(chars: &[char], limit: usize) -> usize {
    let mut in_tag = false;
    let mut closing = false;
    let mut in_entity = false;
    let mut depth = 0usize;
    let mut outside_markup = 0;
    let mut top_level = 0;

    for (i, &c) in chars.iter().enumerate().take(limit) {
        match c {
            '<' if !in_tag => {
                in_tag = true;
                in_entity = false;
                closing = chars.get(i + 1) == Some(&'/');
            }
            '>' if in_tag => {
                in_tag = false;
                if closing {
                    depth = depth.saturating_sub(1);
                } else {
                    depth += 1;
                }
            }
            '&' if !in_tag => in_entity = true,
            ';' if in_entity => in_entity = false,
            c if in_entity && c.is_whitespace() => in_entity = false,
            _ => {}
        }

        if !in_tag && !in_entity {
            outside_markup = i + 1;
            if depth == 0 {
                top_level = i + 1;
            }
        }
    }

    [top_level, outside_markup]
        .into_iter()
        .find(|&cut| cut > 0)
        .unwrap_or(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::escape_html;

    #[test]
    fn test_short_message_is_one_part() {
        assert_eq!(split_message("hello\nworld", 4096), vec!["hello\nworld"]);
        assert_eq!(split_message("", 4096), vec![""]);
    }

    #[test]
    fn test_split_on_line_boundaries() {
        let parts = split_message("aaaa\nbbbb\ncccc", 9);
        assert_eq!(parts, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn test_long_line_is_cut() {
        let parts = split_message("ab\ncdefghij\nk", 4);
        assert_eq!(parts, vec!["ab", "cdef", "ghij", "k"]);
    }

    #[test]
    fn test_long_line_keeps_entities_whole() {
        let parts = split_message("xxxxxxxx&amp;", 10);
        assert_eq!(parts, vec!["xxxxxxxx", "&amp;"]);
    }

    #[test]
    fn test_long_line_keeps_tags_whole() {
        let parts = split_message("yy<b>ab</b>", 7);
        assert_eq!(parts, vec!["yy", "<b>ab", "</b>"]);
    }

    #[test]
    fn test_escaped_error_is_cut_between_entities() {
        let line = format!("<code>{}</code>", escape_html("a<b> & c ").repeat(600));
        let parts = split_message(&line, MAX_MESSAGE_LENGTH);

        assert!(parts.len() > 1);
        assert_eq!(parts.concat(), line);
        for part in &parts {
            assert!(part.chars().count() <= MAX_MESSAGE_LENGTH);
            assert_eq!(part.matches('&').count(), part.matches(';').count());
            assert_eq!(part.matches('<').count(), part.matches('>').count());
        }
    }

    #[test]
    fn test_limit_counts_characters_not_bytes() {
        let line = "ж".repeat(10);
        let parts = split_message(&line, 10);
        assert_eq!(parts, vec![line]);
    }

    #[test]
    fn test_parts_respect_limit_and_keep_content() {
        let text = (0..500)
            .map(|i| format!("line {i} with some padding text"))
            .collect::<Vec<_>>()
            .join("\n");

        let parts = split_message(&text, MAX_MESSAGE_LENGTH);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.chars().count() <= MAX_MESSAGE_LENGTH));
        assert_eq!(parts.join("\n"), text);
    }

    #[test]
    fn test_retryable_errors() {
        let api = |code| TelegramError::Api {
            code,
            description: String::new(),
            retry_after: None,
        };
        assert!(api(429).is_retryable());
        assert!(api(502).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(403).is_retryable());
    }

    #[test]
    fn test_update_decoding() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 10,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 1, "is_bot": false, "first_name": "A"},
                "data": "lang:ru",
                "message": {"message_id": 5, "chat": {"id": -100, "type": "group"}, "date": 0}
            }
        }))
        .unwrap();

        let callback = update.callback_query.unwrap();
        assert_eq!(callback.data.as_deref(), Some("lang:ru"));
        assert_eq!(callback.message.unwrap().chat.id, -100);
        assert!(update.message.is_none());
    }
}
