//! Persistent key-value property store and run configuration.
//!
//! All credentials and run state live in one flat sqlite table so a run can
//! be re-pointed at a different store file without touching the environment.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

pub const KEY_LINE_ACCESS_TOKEN: &str = "lineAccessToken";
pub const KEY_LINE_GROUP_ID: &str = "lineGroupId";
pub const KEY_GEMINI_API_KEY: &str = "geminiApiKey";
pub const KEY_GMAIL_ACCESS_TOKEN: &str = "gmailAccessToken";
pub const KEY_SENDER_WHITELIST: &str = "senderWhitelist";
pub const KEY_LAST_PROCESSED_TIME: &str = "lastProcessedTime";
pub const KEY_MAX_EMAILS_PER_RUN: &str = "maxEmailsPerRun";

const DEFAULT_MAX_EMAILS_PER_RUN: usize = 100;

const PROPERTIES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("missing required property '{0}'")]
    MissingKey(&'static str),
    #[error("property '{key}' is invalid: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Flat key-value store backed by a single sqlite file.
#[derive(Debug, Clone)]
pub struct PropertyStore {
    path: PathBuf,
}

impl PropertyStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| ConfigError::InvalidValue {
                    key: "statePath",
                    reason: err.to_string(),
                })?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(PROPERTIES_SCHEMA)?;
        Ok(conn)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM properties WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO properties (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        debug!("property '{}' updated", key);
        Ok(())
    }
}

/// Configuration for one run, loaded once and immutable afterwards.
///
/// Only the watermark is written back, through [`AppConfig::advance_watermark`],
/// immediately after each processed message.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub line_access_token: String,
    pub line_group_id: String,
    pub gemini_api_key: String,
    pub gmail_access_token: String,
    pub sender_whitelist: Vec<String>,
    pub last_processed_time: i64,
    pub max_emails_per_run: usize,
}

impl AppConfig {
    pub fn load(store: &PropertyStore) -> Result<Self, ConfigError> {
        let line_access_token = required(store, KEY_LINE_ACCESS_TOKEN)?;
        let line_group_id = required(store, KEY_LINE_GROUP_ID)?;
        let gemini_api_key = required(store, KEY_GEMINI_API_KEY)?;
        let gmail_access_token = required(store, KEY_GMAIL_ACCESS_TOKEN)?;

        let whitelist_raw = required(store, KEY_SENDER_WHITELIST)?;
        let sender_whitelist = parse_whitelist(&whitelist_raw);
        if sender_whitelist.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: KEY_SENDER_WHITELIST,
                reason: "no usable sender addresses".to_string(),
            });
        }

        let last_processed_time = match store.get(KEY_LAST_PROCESSED_TIME)? {
            Some(raw) => {
                let value =
                    raw.trim()
                        .parse::<i64>()
                        .map_err(|_| ConfigError::InvalidValue {
                            key: KEY_LAST_PROCESSED_TIME,
                            reason: format!("'{}' is not a unix-ms timestamp", raw),
                        })?;
                if value < 0 {
                    return Err(ConfigError::InvalidValue {
                        key: KEY_LAST_PROCESSED_TIME,
                        reason: "timestamp must be >= 0".to_string(),
                    });
                }
                value
            }
            None => 0,
        };

        let max_emails_per_run = match store.get(KEY_MAX_EMAILS_PER_RUN)? {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: KEY_MAX_EMAILS_PER_RUN,
                    reason: format!("'{}' is not a positive integer", raw),
                })?,
            None => DEFAULT_MAX_EMAILS_PER_RUN,
        };

        Ok(Self {
            line_access_token,
            line_group_id,
            gemini_api_key,
            gmail_access_token,
            sender_whitelist,
            last_processed_time,
            max_emails_per_run,
        })
    }

    /// Persist a new watermark. Written immediately, not batched, so a crash
    /// mid-run does not lose progress already made.
    pub fn advance_watermark(store: &PropertyStore, timestamp_ms: i64) -> Result<(), ConfigError> {
        store.set(KEY_LAST_PROCESSED_TIME, &timestamp_ms.to_string())
    }
}

fn required(store: &PropertyStore, key: &'static str) -> Result<String, ConfigError> {
    store
        .get(key)?
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingKey(key))
}

fn parse_whitelist(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let address = entry.trim().to_ascii_lowercase();
        if address.is_empty() || out.contains(&address) {
            continue;
        }
        out.push(address);
    }
    out
}
