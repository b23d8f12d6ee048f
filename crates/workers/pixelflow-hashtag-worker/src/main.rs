//! C6: the hashtag worker.
//!
//! Grounded in `original_source/hashtag/main.go`'s Vision API label
//! detection: fetch the photo, request labels, turn each into a `#label`
//! token with spaces replaced by underscores, and join the top
//! [`HASHTAG_TOP_K`](pixelflow_core::HASHTAG_TOP_K) by a single space.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use pixelflow_core::{field, FieldUpdate, PhotoRecord, HASHTAG_TOP_K};
use pixelflow_store::RecordStore;
use pixelflow_worker::{Stage, StageResult};
use reqwest::multipart;
use serde::Deserialize;
use snafu::{Location, Snafu};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "pixelflow::hashtag_worker";

#[derive(Debug, Snafu)]
enum HashtagWorkerError {
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

type HashtagWorkerResult<T> = std::result::Result<T, HashtagWorkerError>;

/// The hashtag worker: turns detected image labels into `#hashtag` tokens.
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

    /// Label-detection endpoint. Expected to return a JSON array of label
    /// descriptions, most-confident first.
    #[arg(long, env = "WORKER_LABEL_API_URL")]
    worker_label_api_url: String,

    #[arg(long, env = "WORKER_LABEL_API_KEY", default_value = "")]
    worker_label_api_key: String,
}

#[derive(Debug, Deserialize)]
struct LabelApiResponse {
    #[serde(default)]
    labels: Vec<String>,
}

struct HashtagStage {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[async_trait]
impl Stage for HashtagStage {
    fn name(&self) -> &'static str {
        "hashtag"
    }

    fn needs(&self, record: &PhotoRecord) -> bool {
        record.hashtag.is_empty()
    }

    fn owns(&self) -> &'static [&'static str] {
        &[field::HASHTAG]
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
        let mut form = multipart::Form::new().part("image", part);
        if !self.api_key.is_empty() {
            form = form.text("api_key", self.api_key.clone());
        }

        let response: LabelApiResponse = self
            .http
            .post(&self.api_url)
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        let hashtag = response
            .labels
            .into_iter()
            .take(HASHTAG_TOP_K)
            .map(|label| format!("#{}", label.replace(' ', "_")))
            .collect::<Vec<_>>()
            .join(" ");

        Ok(FieldUpdate::new().text(field::HASHTAG, hashtag))
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> HashtagWorkerResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    info!(target: LOG_TARGET, channel = %opts.worker_redis_channel, "starting hashtag worker");

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

    let stage = Arc::new(HashtagStage {
        http: reqwest::Client::new(),
        api_url: opts.worker_label_api_url,
        api_key: opts.worker_label_api_key,
    });

    pixelflow_worker::run_worker(stage, store, bus).await?;
    Ok(())
}

fn init_logging() -> HashtagWorkerResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| HashtagWorkerError::Logging)?;
    Ok(())
}
