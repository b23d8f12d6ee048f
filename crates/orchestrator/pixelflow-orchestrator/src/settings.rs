//! Per-chat settings (spec.md §4.9's locale preference), persisted so a
//! restart does not forget what language a chat asked for.
//!
//! Shares the record store's Redis connection under a `chat:` keyspace
//! prefix rather than opening a second connection, the same way
//! [`pixelflow_store::RedisRecordStore::connection`] was added for.

use async_trait::async_trait;
use pixelflow_translations::Locale;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use snafu::{Location, ResultExt, Snafu};

pub const LOG_TARGET: &str = "pixelflow::orchestrator::settings";

#[derive(Debug, Snafu)]
pub enum SettingsError {
    #[snafu(display("Redis command failed: {source}"))]
    Command {
        source: redis::RedisError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

#[async_trait]
pub trait ChatSettingsStore: Send + Sync {
    async fn get_locale(&self, chat_id: i64) -> SettingsResult<Locale>;
    async fn set_locale(&self, chat_id: i64, locale: Locale) -> SettingsResult<()>;
}

fn settings_key(chat_id: i64) -> String {
    format!("chat:{chat_id}")
}

pub struct RedisChatSettingsStore {
    conn: ConnectionManager,
}

impl RedisChatSettingsStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ChatSettingsStore for RedisChatSettingsStore {
    async fn get_locale(&self, chat_id: i64) -> SettingsResult<Locale> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(settings_key(chat_id), "locale")
            .await
            .context(CommandSnafu)?;
        Ok(raw.and_then(|s| Locale::parse(&s)).unwrap_or_default())
    }

    async fn set_locale(&self, chat_id: i64, locale: Locale) -> SettingsResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(settings_key(chat_id), "locale", locale.as_str())
            .await
            .context(CommandSnafu)?;
        Ok(())
    }
}
