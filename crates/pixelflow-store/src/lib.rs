//! C1: the Photo Record Store.
//!
//! Keyed map of photo-id → field map, backed by a Redis hash per photo
//! (`HSET`/`HGETALL`, matching `original_source/nsfw/main.go`'s
//! `HGetAll`/`HSet` calls). Exposed behind the [`RecordStore`] trait so
//! worker and orchestrator crates can be tested against [`fake::InMemoryRecordStore`]
//! without a live Redis.

pub mod fake;

use async_trait::async_trait;
use pixelflow_core::{FieldValue, PhotoRecord};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use snafu::{Location, ResultExt, Snafu};
use tracing::debug;

pub const LOG_TARGET: &str = "pixelflow::store";

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Redis connection error: {source}"))]
    Connect {
        source: redis::RedisError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Redis command failed: {source}"))]
    Command {
        source: redis::RedisError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Photo record {photo_id} does not exist"))]
    NotFound {
        photo_id: String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Photo Record Store contract (spec.md §4.1).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Seed a brand-new record's immutable fields (`photo_id`, `chat_id`,
    /// `photo_url`). Idempotent: re-seeding the same photo_id is a no-op for
    /// fields already present.
    async fn seed(&self, record: &PhotoRecord) -> StoreResult<()>;

    /// Write or overwrite a single field. Monotone fields (I1) silently drop
    /// downgrading writes rather than erroring.
    async fn put_field(&self, photo_id: &str, name: &'static str, value: FieldValue) -> StoreResult<()>;

    /// Full current record. Returns `NotFound` if the photo_id was never
    /// seeded.
    async fn get_all(&self, photo_id: &str) -> StoreResult<PhotoRecord>;

    async fn exists(&self, photo_id: &str) -> StoreResult<bool>;
}

/// Build a Redis [`ConnectionManager`] from the pipeline's standard
/// `*_REDIS_ADDR` / `*_REDIS_PASSWD` / `*_REDIS_DB` env-var surface
/// (spec.md §6). `connection-manager` gives transparent reconnect, which is
/// what makes "store unavailable: log and drop, a future notification will
/// retry" (spec.md §7.3) true without hand-rolled retry logic.
pub async fn connect(addr: &str, passwd: &str, db: i64) -> StoreResult<ConnectionManager> {
    let scheme_and_host = format!("redis://{addr}/{db}");
    let mut url = url::Url::parse(&scheme_and_host).expect("constructed URL is always valid");
    if !passwd.is_empty() {
        url.set_password(Some(passwd)).ok();
    }
    let client = redis::Client::open(url.as_str()).context(ConnectSnafu)?;
    let manager = client
        .get_connection_manager()
        .await
        .context(ConnectSnafu)?;
    Ok(manager)
}

fn hash_key(photo_id: &str) -> String {
    format!("photo:{photo_id}")
}

pub struct RedisRecordStore {
    conn: ConnectionManager,
}

impl RedisRecordStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Expose the underlying connection so sibling stores (e.g. the
    /// orchestrator's chat-settings keyspace) can share one Redis connection
    /// instead of opening a second one.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn seed(&self, record: &PhotoRecord) -> StoreResult<()> {
        let key = hash_key(&record.photo_id);
        let mut conn = self.conn.clone();
        let fields = [
            (pixelflow_core::field::PHOTO_ID, record.photo_id.clone()),
            (pixelflow_core::field::CHAT_ID, record.chat_id.to_string()),
            (pixelflow_core::field::PHOTO_URL, record.photo_url.clone()),
        ];
        for (name, value) in fields {
            let existing: Option<String> = conn.hget(&key, name).await.context(CommandSnafu)?;
            if existing.is_none() {
                let _: () = conn.hset(&key, name, value).await.context(CommandSnafu)?;
            }
        }
        debug!(target: LOG_TARGET, photo_id = %record.photo_id, "seeded record");
        Ok(())
    }

    async fn put_field(
        &self,
        photo_id: &str,
        name: &'static str,
        value: FieldValue,
    ) -> StoreResult<()> {
        let key = hash_key(photo_id);
        let mut conn = self.conn.clone();

        let existing: Option<String> = conn.hget(&key, name).await.context(CommandSnafu)?;
        let is_set = existing.as_deref().is_some_and(|v| !v.is_empty() && v != "false");
        if is_set {
            debug!(target: LOG_TARGET, photo_id, field = name, "monotone field already set, dropping write");
            return Ok(());
        }

        let raw = value.as_store_string();
        let _: () = conn.hset(&key, name, raw).await.context(CommandSnafu)?;
        Ok(())
    }

    async fn get_all(&self, photo_id: &str) -> StoreResult<PhotoRecord> {
        let key = hash_key(photo_id);
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, String> =
            conn.hgetall(&key).await.context(CommandSnafu)?;
        if map.is_empty() {
            return NotFoundSnafu {
                photo_id: photo_id.to_string(),
            }
            .fail();
        }
        Ok(PhotoRecord::from_field_map(photo_id, &map))
    }

    async fn exists(&self, photo_id: &str) -> StoreResult<bool> {
        let key = hash_key(photo_id);
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(&key).await.context(CommandSnafu)?;
        Ok(exists)
    }
}
