//! Chat platform adapter (spec.md §4.9's front-end).
//!
//! Grounded in `original_source/telegram/main.go`'s `GetUpdatesChan` /
//! `bot.Send` round trip, expressed as an async poll loop over the Bot API
//! rather than a Go channel range.

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{Location, ResultExt, Snafu};
use tracing::{debug, warn};

pub const LOG_TARGET: &str = "pixelflow::orchestrator::chat";

#[derive(Debug, Snafu)]
pub enum ChatError {
    #[snafu(display("Telegram HTTP request failed: {source}"))]
    Http {
        source: reqwest::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Telegram API returned ok=false: {description}"))]
    Api {
        description: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;

/// A normalized inbound event, independent of the chat platform's wire
/// format.
#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    pub first_name: String,
    pub text: Option<String>,
    /// Largest available photo's file id, if the message carried one.
    pub photo_file_id: Option<String>,
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Long-poll for updates after `offset` (exclusive).
    async fn get_updates(&self, offset: i64) -> ChatResult<Vec<Update>>;

    /// Resolve a platform file id to a directly downloadable URL.
    async fn resolve_file_url(&self, file_id: &str) -> ChatResult<String>;

    async fn send_message(&self, chat_id: i64, text: &str) -> ChatResult<()>;
}

pub struct TelegramPlatform {
    http: reqwest::Client,
    token: String,
    timeout_secs: u64,
    debug: bool,
}

impl TelegramPlatform {
    pub fn new(token: String, timeout_secs: u64, debug: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            timeout_secs,
            debug,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.token)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("https://api.telegram.org/file/bot{}/{file_path}", self.token)
    }
}

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    #[serde(default)]
    description: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    photo: Vec<TgPhotoSize>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(default)]
    first_name: String,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_path: Option<String>,
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    async fn get_updates(&self, offset: i64) -> ChatResult<Vec<Update>> {
        let response: TgResponse<Vec<TgUpdate>> = self
            .http
            .get(self.api_url("getUpdates"))
            .query(&[
                ("offset", (offset + 1).to_string()),
                ("timeout", self.timeout_secs.to_string()),
            ])
            .send()
            .await
            .context(HttpSnafu)?
            .json()
            .await
            .context(HttpSnafu)?;

        if !response.ok {
            return ApiSnafu {
                description: response.description,
            }
            .fail();
        }

        if self.debug {
            debug!(target: LOG_TARGET, offset, count = response.result.as_ref().map_or(0, Vec::len), "polled updates");
        }

        let updates = response
            .result
            .unwrap_or_default()
            .into_iter()
            .filter_map(|update| {
                let message = update.message?;
                // Telegram returns photo sizes smallest-first.
                let photo_file_id = message.photo.last().map(|p| p.file_id.clone());
                Some(Update {
                    update_id: update.update_id,
                    chat_id: message.chat.id,
                    first_name: message.chat.first_name,
                    text: message.text,
                    photo_file_id,
                })
            })
            .collect();

        Ok(updates)
    }

    async fn resolve_file_url(&self, file_id: &str) -> ChatResult<String> {
        let response: TgResponse<TgFile> = self
            .http
            .get(self.api_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await
            .context(HttpSnafu)?
            .json()
            .await
            .context(HttpSnafu)?;

        if !response.ok {
            return ApiSnafu {
                description: response.description,
            }
            .fail();
        }

        let file_path = response
            .result
            .and_then(|f| f.file_path)
            .unwrap_or_default();
        if file_path.is_empty() {
            warn!(target: LOG_TARGET, file_id, "getFile returned no file_path");
        }
        Ok(self.file_url(&file_path))
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> ChatResult<()> {
        let response: TgResponse<serde_json::Value> = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await
            .context(HttpSnafu)?
            .json()
            .await
            .context(HttpSnafu)?;

        if !response.ok {
            return ApiSnafu {
                description: response.description,
            }
            .fail();
        }
        Ok(())
    }
}
