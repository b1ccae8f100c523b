//! SQLite storage of per-chat report preferences.
//!
//! One row per Telegram chat: the report language and layout the chat picked
//! with the inline buttons. Timestamps are unix seconds.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::render::{Language, ViewMode};

/// Preferences of one chat.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPreferences {
    pub chat_id: i64,
    pub language: Language,
    pub view_mode: ViewMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chat preference database.
#[derive(Clone)]
pub struct PrefsStore {
    pool: SqlitePool,
}

impl PrefsStore {
    /// Open the database and create the schema if needed.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:chat_prefs.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_prefs (
                chat_id INTEGER PRIMARY KEY,
                language TEXT NOT NULL,
                view_mode TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stored preferences of `chat_id`, if any.
    pub async fn get(&self, chat_id: i64) -> anyhow::Result<Option<ChatPreferences>> {
        let row = sqlx::query(
            r#"
            SELECT chat_id, language, view_mode, created_at, updated_at
            FROM chat_prefs
            WHERE chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_row).transpose()
    }

    /// Stored preferences of `chat_id`, inserting the defaults first if the
    /// chat has none. Existing rows are never touched.
    pub async fn ensure_defaults(
        &self,
        chat_id: i64,
        language: Language,
        view_mode: ViewMode,
    ) -> anyhow::Result<ChatPreferences> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO chat_prefs (chat_id, language, view_mode, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(language.as_str())
        .bind(view_mode.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(chat_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("preferences for chat {chat_id} vanished after insert"))
    }

    pub async fn set_language(&self, chat_id: i64, language: Language) -> anyhow::Result<()> {
        self.upsert(chat_id, Some(language), None).await
    }

    pub async fn set_view_mode(&self, chat_id: i64, view_mode: ViewMode) -> anyhow::Result<()> {
        self.upsert(chat_id, None, Some(view_mode)).await
    }

    /// Update one column, creating the row with global defaults if missing.
    async fn upsert(
        &self,
        chat_id: i64,
        language: Option<Language>,
        view_mode: Option<ViewMode>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO chat_prefs (chat_id, language, view_mode, created_at, updated_at)
            VALUES (?1, COALESCE(?2, ?4), COALESCE(?3, ?5), ?6, ?6)
            ON CONFLICT(chat_id) DO UPDATE SET
                language = COALESCE(?2, language),
                view_mode = COALESCE(?3, view_mode),
                updated_at = ?6
            "#,
        )
        .bind(chat_id)
        .bind(language.map(Language::as_str))
        .bind(view_mode.map(ViewMode::as_str))
        .bind(Language::default().as_str())
        .bind(ViewMode::default().as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_row(row: &SqliteRow) -> anyhow::Result<ChatPreferences> {
    let language: String = row.try_get("language")?;
    let view_mode: String = row.try_get("view_mode")?;

    Ok(ChatPreferences {
        chat_id: row.try_get("chat_id")?,
        language: Language::parse(&language)
            .ok_or_else(|| anyhow::anyhow!("unknown language {language:?} in chat_prefs"))?,
        view_mode: ViewMode::parse(&view_mode)
            .ok_or_else(|| anyhow::anyhow!("unknown view mode {view_mode:?} in chat_prefs"))?,
        created_at: from_unix(row.try_get("created_at")?)?,
        updated_at: from_unix(row.try_get("updated_at")?)?,
    })
}

fn from_unix(ts: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid timestamp {ts} in chat_prefs"))
}
