//! C4: the safety (NSFW) worker.
//!
//! Grounded in `original_source/nsfw/main.go`: fetch the photo, POST it as
//! multipart form data to a classifier endpoint, threshold the returned
//! score. `nsfw` is written before `nsfw_checked` (§9's open question:
//! checked-last ordering) so a racing reader never observes "checked" with
//! a stale default `nsfw = false`.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use pixelflow_core::{field, FieldUpdate, PhotoRecord, NSFW_THRESHOLD};
use pixelflow_store::RecordStore;
use pixelflow_worker::{Stage, StageResult};
use reqwest::multipart;
use serde::Deserialize;
use snafu::{Location, Snafu};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "pixelflow::safety_worker";

#[derive(Debug, Snafu)]
enum SafetyWorkerError {
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

type SafetyWorkerResult<T> = std::result::Result<T, SafetyWorkerError>;

/// The safety worker: flags photos as NSFW before anything downstream
/// publishes them.
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

    /// NSFW classifier endpoint.
    #[arg(
        long,
        env = "WORKER_NSFW_API_URL",
        default_value = "https://api.deepai.org/api/nsfw-detector"
    )]
    worker_nsfw_api_url: String,

    #[arg(long, env = "WORKER_NSFW_API_KEY")]
    worker_nsfw_api_key: String,
}

#[derive(Debug, Deserialize)]
struct NsfwApiOutput {
    nsfw_score: f32,
}

#[derive(Debug, Deserialize)]
struct NsfwApiResponse {
    output: Option<NsfwApiOutput>,
    #[serde(default)]
    err: String,
}

struct SafetyStage {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[async_trait]
impl Stage for SafetyStage {
    fn name(&self) -> &'static str {
        "safety"
    }

    fn needs(&self, record: &PhotoRecord) -> bool {
        !record.nsfw_checked
    }

    fn owns(&self) -> &'static [&'static str] {
        &[field::NSFW, field::NSFW_CHECKED]
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

        let response: NsfwApiResponse = self
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
        let score = response
            .output
            .ok_or("NSFW API response missing output")?
            .nsfw_score;
        let is_nsfw = score > NSFW_THRESHOLD;

        Ok(FieldUpdate::new()
            .flag(field::NSFW, is_nsfw)
            .flag(field::NSFW_CHECKED, true))
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> SafetyWorkerResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    info!(target: LOG_TARGET, channel = %opts.worker_redis_channel, "starting safety worker");

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

    let stage = Arc::new(SafetyStage {
        http: reqwest::Client::new(),
        api_url: opts.worker_nsfw_api_url,
        api_key: opts.worker_nsfw_api_key,
    });

    pixelflow_worker::run_worker(stage, store, bus).await?;
    Ok(())
}

fn init_logging() -> SafetyWorkerResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| SafetyWorkerError::Logging)?;
    Ok(())
}
