//! C2: the Event Bus — a single Redis pub/sub topic carrying photo-record
//! change notifications (spec.md §4.2).
//!
//! Delivery is at-least-once and subscribers receive their own publishes,
//! matching `original_source/nsfw/main.go`'s `redis.Subscribe` / `Publish`
//! round trip through one channel.

pub mod fake;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use pixelflow_core::PhotoRecord;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use snafu::{Location, ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{error, warn};

pub const LOG_TARGET: &str = "pixelflow::bus";

/// How long [`EventBus::subscribe`] waits for the subscription to be
/// acknowledged before giving up (spec.md §4.2: "bounded wait, e.g. 10s").
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum BusError {
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
    #[snafu(display("Encoding record to JSON failed: {source}"))]
    Encode {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Subscription did not complete within the startup deadline"))]
    SubscribeTimedOut {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type BusResult<T> = std::result::Result<T, BusError>;

/// A live subscription to the topic. Decode failures on individual messages
/// are logged and dropped (spec.md §7.6); they never terminate the stream.
pub struct Subscription {
    rx: mpsc::Receiver<PhotoRecord>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PhotoRecord> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, record: &PhotoRecord) -> BusResult<()>;
    async fn subscribe(&self) -> BusResult<Subscription>;
}

pub async fn connect(addr: &str, passwd: &str, db: i64) -> BusResult<redis::Client> {
    let scheme_and_host = format!("redis://{addr}/{db}");
    let mut url = url::Url::parse(&scheme_and_host).expect("constructed URL is always valid");
    if !passwd.is_empty() {
        url.set_password(Some(passwd)).ok();
    }
    redis::Client::open(url.as_str()).context(ConnectSnafu)
}

pub struct RedisEventBus {
    client: redis::Client,
    publish_conn: ConnectionManager,
    channel: String,
}

impl RedisEventBus {
    pub async fn new(client: redis::Client, channel: impl Into<String>) -> BusResult<Self> {
        let publish_conn = client
            .get_connection_manager()
            .await
            .context(ConnectSnafu)?;
        Ok(Self {
            client,
            publish_conn,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, record: &PhotoRecord) -> BusResult<()> {
        let payload = serde_json::to_string(record).context(EncodeSnafu)?;
        let mut conn = self.publish_conn.clone();
        let _: () = conn
            .publish(&self.channel, payload)
            .await
            .context(CommandSnafu)?;
        Ok(())
    }

    async fn subscribe(&self) -> BusResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context(ConnectSnafu)?;

        tokio::time::timeout(SUBSCRIBE_TIMEOUT, pubsub.subscribe(&self.channel))
            .await
            .map_err(|_| SubscribeTimedOutSnafu.build())?
            .context(CommandSnafu)?;

        let (tx, rx) = mpsc::channel(256);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        error!(target: LOG_TARGET, %err, "non-string payload on bus channel");
                        continue;
                    }
                };
                match serde_json::from_str::<PhotoRecord>(&payload) {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(target: LOG_TARGET, %err, raw = %payload, "failed to decode notification, dropping");
                    }
                }
            }
            warn!(target: LOG_TARGET, %channel, "bus subscription stream ended");
        });

        Ok(Subscription { rx })
    }
}
