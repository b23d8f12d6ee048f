//! C5: the caption worker.
//!
//! Grounded in `original_source/caption/main.go`: fetch the photo, POST it
//! as multipart form data to a captioning endpoint, write back the output
//! string.

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

const LOG_TARGET: &str = "pixelflow::caption_worker";

#[derive(Debug, Snafu)]
enum CaptionWorkerError {
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

type CaptionWorkerResult<T> = std::result::Result<T, CaptionWorkerError>;

/// The caption worker: produces the English caption shown alongside the
/// published photo.
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

    #[arg(
        long,
        env = "WORKER_CAPTION_URL",
        default_value = "https://api.deepai.org/api/neuraltalk"
    )]
    worker_caption_url: String,

    #[arg(long, env = "WORKER_CAPTION_KEY")]
    worker_caption_key: String,
}

#[derive(Debug, Deserialize)]
struct CaptionApiResponse {
    #[serde(default)]
    output: String,
    #[serde(default)]
    err: String,
}

struct CaptionStage {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[async_trait]
impl Stage for CaptionStage {
    fn name(&self) -> &'static str {
        "caption"
    }

    fn needs(&self, record: &PhotoRecord) -> bool {
        record.caption.is_empty()
    }

    fn owns(&self) -> &'static [&'static str] {
        &[field::CAPTION]
    }

    async fn compute(&self, record: &PhotoRecord) -> StageResult<FieldUpdate> {
        let photo = self
            .http
            .get(record.photo_url.as_str())
            .send()
            .await?
            .bytes()
            .await?;

        let part = multipart::Part::bytes(photo.to_vec()).file_name("file.jpg");
        let form = multipart::Form::new().part("image", part);

        let response: CaptionApiResponse = self
            .http
            .post(&self.api_url)
            .header("Api-Key", &self.api_key)
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if !response.err.is_empty() {
            return Err(response.err.into());
        }

        Ok(FieldUpdate::new().text(field::CAPTION, response.output))
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> CaptionWorkerResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    info!(target: LOG_TARGET, channel = %opts.worker_redis_channel, "starting caption worker");

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

    let stage = Arc::new(CaptionStage {
        http: reqwest::Client::new(),
        api_url: opts.worker_caption_url,
        api_key: opts.worker_caption_key,
    });

    pixelflow_worker::run_worker(stage, store, bus).await?;
    Ok(())
}

fn init_logging() -> CaptionWorkerResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| CaptionWorkerError::Logging)?;
    Ok(())
}
