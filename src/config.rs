//! Configuration loading and validation.
//!
//! Configuration comes from a YAML file plus a few secrets taken from the
//! environment:
//!
//! - `TELEGRAM_BOT_TOKEN` (required in `single` and `master` mode)
//! - `MASTER_API_TOKEN` (overrides `master.api_token`)
//! - `NODE_API_TOKEN` (overrides `node.api_token`)
//!
//! Every default is declared once, on the section struct that owns it.
//! [`Config::validate`] runs at startup and rejects inconsistent values before
//! any component uses them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::classify::Thresholds;
use crate::model::FailedTierPolicy;
use crate::render::{Language, ViewMode};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found (searched: {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("configuration file is empty")]
    Empty,

    #[error("invalid configuration format: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0} environment variable is required")]
    MissingEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Operating mode of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Measure and notify chats directly.
    #[default]
    Single,
    /// Measure and forward the result to a master.
    Node,
    /// Collect node reports and publish aggregated reports.
    Master,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerConfig,
    pub speedtest: SpeedtestConfig,
    pub thresholds: Thresholds,
    pub telegram: TelegramConfig,
    pub logging: LoggingConfig,
    pub master: Option<MasterConfig>,
    pub node: Option<NodeConfig>,
}

/// Identification of this host in single-mode messages.
///
/// The value `auto` means "detect at runtime".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub location: String,
    pub identifier: String,
    pub description: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "auto".to_string(),
            location: "auto".to_string(),
            identifier: "auto".to_string(),
            description: String::new(),
        }
    }
}

/// Speedtest execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeedtestConfig {
    /// Per-attempt timeout in seconds.
    pub timeout: u64,

    /// Preferred server ids. Only the first one is used.
    pub servers: Vec<u32>,

    pub retry_count: u32,

    /// Delay between retry rounds in seconds.
    pub retry_delay: u64,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            timeout: 60,
            servers: Vec::new(),
            retry_count: 3,
            retry_delay: 5,
        }
    }
}

/// Telegram delivery settings shared by all modes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Read from `TELEGRAM_BOT_TOKEN`, never from the file.
    #[serde(skip, default = "empty_secret")]
    pub bot_token: SecretString,

    /// Recipients of single-mode notifications.
    #[serde(deserialize_with = "deserialize_chat_ids")]
    pub chat_ids: Vec<i64>,

    /// Notify even when the speed is fine.
    pub send_always: bool,

    pub default_language: Language,
    pub default_view_mode: ViewMode,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: empty_secret(),
            chat_ids: Vec::new(),
            send_always: false,
            default_language: Language::default(),
            default_view_mode: ViewMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn(ing), error, critical.
    pub level: String,

    /// Optional log file, rotated daily.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        parse_level(&self.level)
    }
}

/// Parse a log level, accepting the `warning` and `critical` spellings.
pub fn parse_level(level: &str) -> Result<LevelFilter, ConfigError> {
    let normalized = match level.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    };
    normalized
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("unknown log level {level:?}")))
}

/// Display metadata for one node, keyed by node id in `master.nodes_meta`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeMetaConfig {
    pub flag: Option<String>,
    pub display_name: Option<String>,
}

/// A chat that receives aggregated reports, with its initial preferences.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramTargetConfig {
    pub chat_id: i64,

    #[serde(default)]
    pub default_language: Language,

    #[serde(default)]
    pub default_view_mode: ViewMode,
}

/// When the master publishes aggregated reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Period of the report timer.
    pub interval_minutes: u64,

    /// Also publish right after every accepted node report.
    pub send_immediately: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            send_immediately: false,
        }
    }
}

/// Master mode settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen_host: String,
    pub listen_port: u16,

    /// Shared bearer secret expected from nodes.
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_token: SecretString,

    /// Legacy spelling of `schedule.interval_minutes`.
    pub aggregation_interval_minutes: Option<u64>,

    pub node_timeout_minutes: u32,
    pub nodes_order: Vec<String>,
    pub nodes_meta: HashMap<String, NodeMetaConfig>,
    pub telegram_targets: Vec<TelegramTargetConfig>,
    pub schedule: Option<ScheduleConfig>,

    /// Status of an online node whose latest measurement failed.
    pub failed_status: FailedTierPolicy,

    /// SQLite URL of the chat preference database.
    pub prefs_database_url: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            api_token: empty_secret(),
            aggregation_interval_minutes: None,
            node_timeout_minutes: 120,
            nodes_order: Vec::new(),
            nodes_meta: HashMap::new(),
            telegram_targets: Vec::new(),
            schedule: None,
            failed_status: FailedTierPolicy::default(),
            prefs_database_url: "sqlite:chat_prefs.db?mode=rwc".to_string(),
        }
    }
}

impl MasterConfig {
    /// Effective schedule.
    ///
    /// Configurations written before the `schedule` section existed only set
    /// `aggregation_interval_minutes`; they keep their old behaviour of
    /// publishing on every report.
    pub fn effective_schedule(&self) -> ScheduleConfig {
        match (self.schedule, self.aggregation_interval_minutes) {
            (Some(schedule), _) => schedule,
            (None, legacy) => ScheduleConfig {
                interval_minutes: legacy.unwrap_or(ScheduleConfig::default().interval_minutes),
                send_immediately: true,
            },
        }
    }
}

/// Node mode settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub description: String,

    /// Full URL of the master's report endpoint.
    pub master_url: String,

    #[serde(deserialize_with = "deserialize_secret")]
    pub api_token: SecretString,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            description: String::new(),
            master_url: String::new(),
            api_token: empty_secret(),
        }
    }
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawChatId {
    Number(i64),
    Text(String),
}

fn deserialize_chat_ids<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<RawChatId>::deserialize(deserializer)?
        .into_iter()
        .map(|raw| match raw {
            RawChatId::Number(id) => Ok(id),
            RawChatId::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid chat id {text:?}"))),
        })
        .collect()
}

/// Find the configuration file.
///
/// Order: explicit path, `CONFIG_PATH`, then `config.yaml` in the working
/// directory. An explicit path that does not exist is an error.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(ConfigError::NotFound {
                searched: vec![path.to_path_buf()],
            })
        };
    }

    let mut searched = Vec::new();
    if let Ok(env_path) = std::env::var("CONFIG_PATH") {
        searched.push(PathBuf::from(env_path));
    }
    searched.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    match searched.iter().find(|p| p.exists()) {
        Some(found) => Ok(found.clone()),
        None => Err(ConfigError::NotFound { searched }),
    }
}

impl Config {
    /// Read a YAML file and apply secrets from the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&raw)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply environment secrets through `lookup`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = SecretString::from(token);
        }
        if let (Some(master), Some(token)) = (self.master.as_mut(), lookup("MASTER_API_TOKEN")) {
            master.api_token = SecretString::from(token);
        }
        if let (Some(node), Some(token)) = (self.node.as_mut(), lookup("NODE_API_TOKEN")) {
            node.api_token = SecretString::from(token);
        }
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.speedtest.timeout == 0 {
            return Err(invalid("speedtest timeout must be positive"));
        }
        if self.speedtest.retry_count == 0 {
            return Err(invalid("speedtest retry_count must be at least 1"));
        }
        if !self.thresholds.is_strictly_ascending() {
            return Err(invalid(
                "thresholds must be positive and satisfy very_low < low < medium < good",
            ));
        }
        self.logging.level_filter()?;

        match self.mode {
            Mode::Single => {
                self.require_bot_token()?;
                if self.telegram.chat_ids.is_empty() {
                    return Err(invalid("at least one telegram.chat_ids entry is required"));
                }
            }
            Mode::Node => {
                let node = self
                    .node
                    .as_ref()
                    .ok_or_else(|| invalid("node section is required in node mode"))?;
                if node.node_id.trim().is_empty() {
                    return Err(invalid("node.node_id must not be empty"));
                }
                if node.master_url.trim().is_empty() {
                    return Err(invalid("node.master_url must not be empty"));
                }
            }
            Mode::Master => {
                self.require_bot_token()?;
                let master = self
                    .master
                    .as_ref()
                    .ok_or_else(|| invalid("master section is required in master mode"))?;
                if master.api_token.expose_secret().is_empty() {
                    return Err(invalid("master.api_token must not be empty"));
                }
                if master.node_timeout_minutes == 0 {
                    return Err(invalid("master.node_timeout_minutes must be positive"));
                }
                if master.effective_schedule().interval_minutes == 0 {
                    return Err(invalid("master.schedule.interval_minutes must be positive"));
                }
            }
        }

        Ok(())
    }

    fn require_bot_token(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.expose_secret().is_empty() {
            Err(ConfigError::MissingEnv("TELEGRAM_BOT_TOKEN"))
        } else {
            Ok(())
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
