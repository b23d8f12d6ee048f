//! C7: the style-transfer worker.
//!
//! Grounded in `original_source/style/main.go`'s commented-out sketch: fetch
//! the photo, pick one of [`STYLE_FILTERS`](pixelflow_core::STYLE_FILTERS)
//! at random, POST it to a style-transfer endpoint with the filter as a
//! form field, and store the URL of the styled result.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use pixelflow_core::{field, FieldUpdate, PhotoRecord, STYLE_FILTERS};
use pixelflow_store::RecordStore;
use pixelflow_worker::{Stage, StageResult};
use rand::Rng;
use reqwest::multipart;
use serde::Deserialize;
use snafu::{Location, Snafu};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "pixelflow::style_worker";

#[derive(Debug, Snafu)]
enum StyleWorkerError {
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

type StyleWorkerResult<T> = std::result::Result<T, StyleWorkerError>;

/// The style-transfer worker: applies a randomly chosen filter before
/// publish.
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

    #[arg(long, env = "STYLE_SERVER_URL")]
    style_server_url: String,
}

#[derive(Debug, Deserialize)]
struct StyleApiResponse {
    #[serde(default)]
    output_url: String,
    #[serde(default)]
    err: String,
}

struct StyleStage {
    http: reqwest::Client,
    api_url: String,
}

impl StyleStage {
    fn pick_filter() -> &'static str {
        let idx = rand::rng().random_range(0..STYLE_FILTERS.len());
        STYLE_FILTERS[idx]
    }
}

#[async_trait]
impl Stage for StyleStage {
    fn name(&self) -> &'static str {
        "style"
    }

    fn needs(&self, record: &PhotoRecord) -> bool {
        record.styled_url.is_empty()
    }

    fn owns(&self) -> &'static [&'static str] {
        &[field::STYLED_URL]
    }

    async fn compute(&self, record: &PhotoRecord) -> StageResult<FieldUpdate> {
        let photo = self
            .http
            .get(record.photo_url.as_str())
            .send()
            .await?
            .bytes()
            .await?;

        let filter = Self::pick_filter();
        let part = multipart::Part::bytes(photo.to_vec()).file_name("file.jpg");
        let form = multipart::Form::new()
            .part("file", part)
            .text("filter", filter);

        let response: StyleApiResponse = self
            .http
            .post(&self.api_url)
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if !response.err.is_empty() {
            return Err(response.err.into());
        }

        Ok(FieldUpdate::new().text(field::STYLED_URL, response.output_url))
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> StyleWorkerResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    info!(target: LOG_TARGET, channel = %opts.worker_redis_channel, "starting style worker");

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

    let stage = Arc::new(StyleStage {
        http: reqwest::Client::new(),
        api_url: opts.style_server_url,
    });

    pixelflow_worker::run_worker(stage, store, bus).await?;
    Ok(())
}

fn init_logging() -> StyleWorkerResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| StyleWorkerError::Logging)?;
    Ok(())
}
