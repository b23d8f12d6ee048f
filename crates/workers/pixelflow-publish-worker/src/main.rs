//! C8: the publisher.
//!
//! Grounded in `original_source/instagram/main.go`'s upload call: fetch
//! the styled photo (falling back to the original if style transfer never
//! ran), upload it with `final_caption`, quality 87, Valencia filter, and
//! record the resulting media's public URL.
//!
//! The original's `status := len(metaHGet) != 0` bug (status is true merely
//! because the hash was non-empty, regardless of whether the upload
//! succeeded) is deliberately not ported: `published` is only set once the
//! upload call itself succeeds.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use pixelflow_core::{field, FieldUpdate, PhotoRecord};
use pixelflow_store::RecordStore;
use pixelflow_worker::{Stage, StageResult};
use reqwest::multipart;
use serde::Deserialize;
use snafu::{Location, Snafu};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "pixelflow::publish_worker";
const UPLOAD_QUALITY: &str = "87";
const UPLOAD_FILTER: &str = "Valencia";

#[derive(Debug, Snafu)]
enum PublishWorkerError {
    #[snafu(display("Logging initialization failed"))]
    Logging,
    #[snafu(transparent)]
    Store {
        source: pixelflow_store::StoreError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Bus {
        source: pixelflow_bus::BusError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Worker {
        source: pixelflow_worker::WorkerError,
        #[snafu(implicit)]
        location: Location,
    },
}

type PublishWorkerResult<T> = std::result::Result<T, PublishWorkerError>;

/// The publisher: uploads the finished photo once the orchestrator flips
/// `publish`.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Opts {
    #[arg(long, env = "WORKER_REDIS_ADDR", default_value = "localhost:6379")]
    worker_redis_addr: String,

    #[arg(long, env = "WORKER_REDIS_PASSWD", default_value = "")]
    worker_redis_passwd: String,

    #[arg(long, env = "WORKER_REDIS_DB", default_value = "0")]
    worker_redis_db: i64,

    #[arg(long, env = "WORKER_REDIS_CHANNEL", default_value = "queue")]
    worker_redis_channel: String,

    #[arg(long, env = "WORKER_PUBLISH_API_URL")]
    worker_publish_api_url: String,

    #[arg(long, env = "WORKER_PUBLISH_API_KEY", default_value = "")]
    worker_publish_api_key: String,

    /// Prefix `published_url` is composed against, `{prefix}/p/{code}`.
    #[arg(
        long,
        env = "TELEGRAM_DEMO_INSTA_URL",
        default_value = "https://www.instagram.com"
    )]
    telegram_demo_insta_url: String,
}

#[derive(Debug, Deserialize)]
struct PublishApiResponse {
    #[serde(default)]
    media_code: String,
    #[serde(default)]
    err: String,
}

struct PublishStage {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    landing_url_prefix: String,
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn needs(&self, record: &PhotoRecord) -> bool {
        record.publish && !record.published
    }

    fn owns(&self) -> &'static [&'static str] {
        &[field::PUBLISHED_URL, field::PUBLISHED]
    }

    async fn compute(&self, record: &PhotoRecord) -> StageResult<FieldUpdate> {
        let upload_url: &str = if record.styled_url.is_empty() {
            record.photo_url.as_str()
        } else {
            record.styled_url.as_str()
        };

        let caption = if record.final_caption.is_empty() {
            record.compose_final_caption()
        } else {
            record.final_caption.clone()
        };

        let photo = self.http.get(upload_url).send().await?.bytes().await?;

        let part = multipart::Part::bytes(photo.to_vec()).file_name("file.jpg");
        let mut form = multipart::Form::new()
            .part("file", part)
            .text("caption", caption)
            .text("quality", UPLOAD_QUALITY)
            .text("filter", UPLOAD_FILTER);
        if !self.api_key.is_empty() {
            form = form.text("api_key", self.api_key.clone());
        }

        let response: PublishApiResponse = self
            .http
            .post(&self.api_url)
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if !response.err.is_empty() || response.media_code.is_empty() {
            return Err(format!(
                "publish upload failed: {}",
                if response.err.is_empty() {
                    "empty media code"
                } else {
                    &response.err
                }
            )
            .into());
        }

        let published_url = format!("{}/p/{}", self.landing_url_prefix, response.media_code);

        // published_url before published (checked-last ordering, spec.md §4.8).
        Ok(FieldUpdate::new()
            .text(field::PUBLISHED_URL, published_url)
            .flag(field::PUBLISHED, true))
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> PublishWorkerResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    info!(target: LOG_TARGET, channel = %opts.worker_redis_channel, "starting publish worker");

    let store_conn = pixelflow_store::connect(
        &opts.worker_redis_addr,
        &opts.worker_redis_passwd,
        opts.worker_redis_db,
    )
    .await?;
    let store: Arc<dyn RecordStore> = Arc::new(pixelflow_store::RedisRecordStore::new(store_conn));

    let bus_client = pixelflow_bus::connect(
        &opts.worker_redis_addr,
        &opts.worker_redis_passwd,
        opts.worker_redis_db,
    )
    .await?;
    let bus: Arc<dyn pixelflow_bus::EventBus> = Arc::new(
        pixelflow_bus::RedisEventBus::new(bus_client, opts.worker_redis_channel).await?,
    );

    let stage = Arc::new(PublishStage {
        http: reqwest::Client::new(),
        api_url: opts.worker_publish_api_url,
        api_key: opts.worker_publish_api_key,
        landing_url_prefix: opts.telegram_demo_insta_url,
    });

    pixelflow_worker::run_worker(stage, store, bus).await?;
    Ok(())
}

fn init_logging() -> PublishWorkerResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| PublishWorkerError::Logging)?;
    Ok(())
}
