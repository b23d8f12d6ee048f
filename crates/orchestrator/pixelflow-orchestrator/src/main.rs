//! C9: the chat-bot orchestrator binary.
//!
//! Runs two concurrent loops against the same store/bus/settings handles:
//! ingest (poll Telegram, seed new records) and the readiness gate (watch
//! the bus, flip `publish` once enrichment finishes, reply once per photo).
//! Grounded in `original_source/telegram/main.go`'s `Start`/`handleUpdate`
//! pair, generalized from a single `/start` handler to the full command and
//! readiness surface SPEC_FULL.md §4.9 describes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pixelflow_core::{field, PhotoRecord, DEFAULT_QUOTA_LIMIT};
use pixelflow_orchestrator::chat::{ChatPlatform, TelegramPlatform, Update};
use pixelflow_orchestrator::derive_photo_id;
use pixelflow_orchestrator::notify::{NotifyKind, NotifyTracker};
use pixelflow_orchestrator::quota::QuotaTracker;
use pixelflow_orchestrator::settings::{ChatSettingsStore, RedisChatSettingsStore};
use pixelflow_store::RecordStore;
use pixelflow_translations::{Catalog, Locale};
use snafu::{Location, Snafu};
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_TARGET: &str = "pixelflow::orchestrator";

#[derive(Debug, Snafu)]
enum OrchestratorError {
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
    Chat {
        source: pixelflow_orchestrator::chat::ChatError,
        #[snafu(implicit)]
        location: Location,
    },
}

type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// The chat-bot front-end: ingests photos, enforces quota, and tells the
/// chat when a photo is blocked or published.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Opts {
    #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
    telegram_bot_token: String,

    #[arg(long, env = "TELEGRAM_BOT_DEBUG", default_value = "false")]
    telegram_bot_debug: bool,

    #[arg(long, env = "TELEGRAM_BOT_TIMEOUT", default_value = "60")]
    telegram_bot_timeout: u64,

    /// Milliseconds paced between consecutive ordered replies to one chat.
    #[arg(long, env = "TELEGRAM_BOT_SLEEP", default_value = "300")]
    telegram_bot_sleep: u64,

    #[arg(long, env = "TELEGRAM_DEMO_LANDING_URL")]
    telegram_demo_landing_url: String,

    #[arg(long, env = "WORKER_REDIS_ADDR", default_value = "localhost:6379")]
    worker_redis_addr: String,

    #[arg(long, env = "WORKER_REDIS_PASSWD", default_value = "")]
    worker_redis_passwd: String,

    #[arg(long, env = "WORKER_REDIS_DB", default_value = "0")]
    worker_redis_db: i64,

    #[arg(long, env = "WORKER_REDIS_CHANNEL", default_value = "queue")]
    worker_redis_channel: String,

    #[arg(long, env = "QUOTA_LIMIT", default_value_t = DEFAULT_QUOTA_LIMIT)]
    quota_limit: u32,
}

#[snafu::report]
#[tokio::main]
async fn main() -> OrchestratorResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    info!(target: LOG_TARGET, "starting orchestrator");

    let store_conn = pixelflow_store::connect(
        &opts.worker_redis_addr,
        &opts.worker_redis_passwd,
        opts.worker_redis_db,
    )
    .await?;
    let store: Arc<dyn RecordStore> =
        Arc::new(pixelflow_store::RedisRecordStore::new(store_conn.clone()));
    let settings: Arc<dyn ChatSettingsStore> =
        Arc::new(RedisChatSettingsStore::new(store_conn));

    let bus_client = pixelflow_bus::connect(
        &opts.worker_redis_addr,
        &opts.worker_redis_passwd,
        opts.worker_redis_db,
    )
    .await?;
    let bus: Arc<dyn pixelflow_bus::EventBus> = Arc::new(
        pixelflow_bus::RedisEventBus::new(bus_client, opts.worker_redis_channel).await?,
    );

    let platform: Arc<dyn ChatPlatform> = Arc::new(TelegramPlatform::new(
        opts.telegram_bot_token,
        opts.telegram_bot_timeout,
        opts.telegram_bot_debug,
    ));
    let catalog = Arc::new(Catalog::embedded());
    let quota = Arc::new(QuotaTracker::new(opts.quota_limit));
    let notified = Arc::new(NotifyTracker::new());
    let reply_pacing = Duration::from_millis(opts.telegram_bot_sleep);
    let demo_landing_url: Arc<str> = Arc::from(opts.telegram_demo_landing_url);

    let ingest = tokio::spawn(run_ingest_loop(
        platform.clone(),
        store.clone(),
        bus.clone(),
        settings.clone(),
        catalog.clone(),
        quota.clone(),
        demo_landing_url.clone(),
        reply_pacing,
    ));
    let readiness = tokio::spawn(run_readiness_loop(
        store,
        bus,
        platform,
        settings,
        catalog,
        notified,
        quota,
        demo_landing_url,
    ));

    let (ingest_res, readiness_res) = tokio::join!(ingest, readiness);
    ingest_res.expect("ingest loop panicked")?;
    readiness_res.expect("readiness loop panicked")?;
    Ok(())
}

/// Long-poll Telegram, seed new photos, and handle `/start`, `/en`, `/ru`.
async fn run_ingest_loop(
    platform: Arc<dyn ChatPlatform>,
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn pixelflow_bus::EventBus>,
    settings: Arc<dyn ChatSettingsStore>,
    catalog: Arc<Catalog>,
    quota: Arc<QuotaTracker>,
    demo_landing_url: Arc<str>,
    reply_pacing: Duration,
) -> OrchestratorResult<()> {
    let mut offset = 0i64;
    loop {
        let updates = match platform.get_updates(offset).await {
            Ok(updates) => updates,
            Err(err) => {
                error!(target: LOG_TARGET, %err, "get_updates failed, retrying");
                tokio::time::sleep(reply_pacing).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id);
            if let Err(err) = handle_update(
                &update,
                platform.as_ref(),
                store.as_ref(),
                bus.as_ref(),
                settings.as_ref(),
                &catalog,
                &quota,
                &demo_landing_url,
            )
            .await
            {
                error!(target: LOG_TARGET, chat_id = update.chat_id, %err, "failed handling update");
            }
            tokio::time::sleep(reply_pacing).await;
        }
    }
}

/// Ingest duty: `/start`, `/en`, `/ru` commands and seeding newly submitted
/// photos. A chat that has already exhausted its publish quota is rejected
/// here (spec.md §4.9 Quota: "new photo ingests are rejected with a
/// templated demo-ended message"), before any enrichment API is ever called;
/// the readiness gate's own quota check (handle_record) remains as the
/// backstop for photos that were already in flight when the quota was hit.
async fn handle_update(
    update: &Update,
    platform: &dyn ChatPlatform,
    store: &dyn RecordStore,
    bus: &dyn pixelflow_bus::EventBus,
    settings: &dyn ChatSettingsStore,
    catalog: &Catalog,
    quota: &QuotaTracker,
    demo_landing_url: &str,
) -> OrchestratorResult<()> {
    let locale = settings.get_locale(update.chat_id).await?;

    if let Some(file_id) = &update.photo_file_id {
        if !quota.has_quota(update.chat_id) {
            let text = catalog.t(locale, "quota_exceeded", &[(
                "url",
                &format!("{demo_landing_url}?chat_id={}", update.chat_id),
            )]);
            platform.send_message(update.chat_id, &text).await?;
            return Ok(());
        }

        let photo_url = platform.resolve_file_url(file_id).await?;
        let photo_id = derive_photo_id(update.chat_id, file_id);
        let record = PhotoRecord::new(photo_id, update.chat_id, photo_url);
        store.seed(&record).await?;
        bus.publish(&record).await?;
        info!(target: LOG_TARGET, chat_id = update.chat_id, photo_id = %record.photo_id, "ingested photo");
        return Ok(());
    }

    match update.text.as_deref() {
        Some("/start") => {
            let text = catalog.t(locale, "greeting", &[("person", &update.first_name)]);
            platform.send_message(update.chat_id, &text).await?;
        }
        Some("/en") => {
            settings.set_locale(update.chat_id, Locale::En).await?;
            let text = catalog.t(Locale::En, "locale_set", &[]);
            platform.send_message(update.chat_id, &text).await?;
        }
        Some("/ru") => {
            settings.set_locale(update.chat_id, Locale::Ru).await?;
            let text = catalog.t(Locale::Ru, "locale_set", &[]);
            platform.send_message(update.chat_id, &text).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Watch the bus, flip `publish` once enrichment clears (subject to quota),
/// and reply once per photo on NSFW block or successful publish.
async fn run_readiness_loop(
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn pixelflow_bus::EventBus>,
    platform: Arc<dyn ChatPlatform>,
    settings: Arc<dyn ChatSettingsStore>,
    catalog: Arc<Catalog>,
    notified: Arc<NotifyTracker>,
    quota: Arc<QuotaTracker>,
    demo_landing_url: Arc<str>,
) -> OrchestratorResult<()> {
    let mut subscription = bus.subscribe().await?;
    info!(target: LOG_TARGET, "readiness gate subscribed");

    while let Some(snapshot) = subscription.recv().await {
        if let Err(err) = handle_record(
            snapshot,
            store.as_ref(),
            bus.as_ref(),
            platform.as_ref(),
            settings.as_ref(),
            &catalog,
            &notified,
            &quota,
            &demo_landing_url,
        )
        .await
        {
            error!(target: LOG_TARGET, %err, "failed handling readiness notification");
        }
    }
    warn!(target: LOG_TARGET, "bus subscription ended, readiness gate exiting");
    Ok(())
}

/// Readiness-gate duty (spec.md §4.9b). `snapshot` is only used to name the
/// photo; every decision is made against a fresh re-read of the
/// authoritative record (spec.md §5), so a stale or redelivered snapshot
/// can never stall the gate or re-fire a decision that already landed.
async fn handle_record(
    snapshot: PhotoRecord,
    store: &dyn RecordStore,
    bus: &dyn pixelflow_bus::EventBus,
    platform: &dyn ChatPlatform,
    settings: &dyn ChatSettingsStore,
    catalog: &Catalog,
    notified: &NotifyTracker,
    quota: &QuotaTracker,
    demo_landing_url: &str,
) -> OrchestratorResult<()> {
    let record = match store.get_all(&snapshot.photo_id).await {
        Ok(record) => record,
        Err(pixelflow_store::StoreError::NotFound { .. }) => {
            debug!(target: LOG_TARGET, photo_id = %snapshot.photo_id, "record not yet visible, dropping");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let locale = settings.get_locale(record.chat_id).await?;

    if record.nsfw_checked && record.nsfw && notified.should_send(&record.photo_id, NotifyKind::Nsfw) {
        let text = catalog.t(locale, "nsfw_detected", &[]);
        platform.send_message(record.chat_id, &text).await?;
        return Ok(());
    }

    if record.published {
        if notified.should_send(&record.photo_id, NotifyKind::Published) {
            quota.record_publish(record.chat_id);
            let text = catalog.t(locale, "published", &[(
                "url",
                if record.published_url.is_empty() {
                    demo_landing_url
                } else {
                    &record.published_url
                },
            )]);
            platform.send_message(record.chat_id, &text).await?;
        }
        return Ok(());
    }

    if record.enrichment_complete() && !quota.has_quota(record.chat_id) {
        if notified.should_send(&record.photo_id, NotifyKind::QuotaDenied) {
            let text = catalog.t(locale, "quota_exceeded", &[(
                "url",
                &format!("{demo_landing_url}?chat_id={}", record.chat_id),
            )]);
            platform.send_message(record.chat_id, &text).await?;
        }
        return Ok(());
    }

    if record.enrichment_complete() && quota.has_quota(record.chat_id) {
        let final_caption = record.compose_final_caption();
        store
            .put_field(
                &record.photo_id,
                field::FINAL_CAPTION,
                pixelflow_core::FieldValue::Text(final_caption.clone()),
            )
            .await?;
        store
            .put_field(&record.photo_id, field::PUBLISH, pixelflow_core::FieldValue::Flag(true))
            .await?;

        let mut updated = record;
        updated.apply_update(
            &pixelflow_core::FieldUpdate::new()
                .text(field::FINAL_CAPTION, final_caption)
                .flag(field::PUBLISH, true),
        );
        bus.publish(&updated).await?;
    }

    Ok(())
}

fn init_logging() -> OrchestratorResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| OrchestratorError::Logging)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use pixelflow_bus::fake::InMemoryEventBus;
    use pixelflow_bus::EventBus as _;
    use pixelflow_core::FieldValue;
    use pixelflow_orchestrator::chat::ChatResult;
    use pixelflow_orchestrator::settings::SettingsResult;
    use pixelflow_store::fake::InMemoryRecordStore;
    use pixelflow_store::RecordStore as _;

    use super::*;

    struct FakePlatform {
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn messages_to(&self, chat_id: i64) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == chat_id)
                .map(|(_, text)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        async fn get_updates(&self, _offset: i64) -> ChatResult<Vec<Update>> {
            Ok(Vec::new())
        }

        async fn resolve_file_url(&self, file_id: &str) -> ChatResult<String> {
            Ok(format!("http://photos.example/{file_id}"))
        }

        async fn send_message(&self, chat_id: i64, text: &str) -> ChatResult<()> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    struct FakeSettings;

    #[async_trait]
    impl ChatSettingsStore for FakeSettings {
        async fn get_locale(&self, _chat_id: i64) -> SettingsResult<Locale> {
            Ok(Locale::En)
        }

        async fn set_locale(&self, _chat_id: i64, _locale: Locale) -> SettingsResult<()> {
            Ok(())
        }
    }

    fn catalog() -> Catalog {
        Catalog::embedded()
    }

    /// Seed a record and write every enrichment field a fully-ready photo
    /// carries, returning the authoritative record the store now holds.
    async fn seed_and_enrich(store: &InMemoryRecordStore, photo_id: &str, chat_id: i64) -> PhotoRecord {
        let record = PhotoRecord::new(photo_id, chat_id, "http://x/a.jpg");
        store.seed(&record).await.unwrap();
        store
            .put_field(photo_id, field::CAPTION, FieldValue::Text("a cat".into()))
            .await
            .unwrap();
        store
            .put_field(photo_id, field::HASHTAG, FieldValue::Text("#cat".into()))
            .await
            .unwrap();
        store
            .put_field(photo_id, field::NSFW_CHECKED, FieldValue::Flag(true))
            .await
            .unwrap();
        store
            .put_field(
                photo_id,
                field::STYLED_URL,
                FieldValue::Text("http://styled/a.jpg".into()),
            )
            .await
            .unwrap();
        store.get_all(photo_id).await.unwrap()
    }

    #[tokio::test]
    async fn ingest_rejects_new_photos_once_quota_is_exhausted() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let quota = QuotaTracker::new(0);

        let update = Update {
            update_id: 1,
            chat_id: 5,
            first_name: "Ada".into(),
            text: None,
            photo_file_id: Some("file123".into()),
        };

        handle_update(
            &update, &platform, &store, &bus, &settings, &catalog, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        let messages = platform.messages_to(5);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("quota"));

        let photo_id = derive_photo_id(5, "file123");
        assert!(!store.exists(&photo_id).await.unwrap());
    }

    #[tokio::test]
    async fn ingest_seeds_and_publishes_new_photo_when_quota_available() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let quota = QuotaTracker::new(3);

        let update = Update {
            update_id: 1,
            chat_id: 5,
            first_name: "Ada".into(),
            text: None,
            photo_file_id: Some("file123".into()),
        };

        handle_update(
            &update, &platform, &store, &bus, &settings, &catalog, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        assert!(platform.messages_to(5).is_empty());
        let photo_id = derive_photo_id(5, "file123");
        assert!(store.exists(&photo_id).await.unwrap());
    }

    /// P3: a photo flagged NSFW is reported once, never published.
    #[tokio::test]
    async fn gate_notifies_nsfw_block_exactly_once() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let notified = NotifyTracker::new();
        let quota = QuotaTracker::new(10);

        let record = PhotoRecord::new("p1", 7, "http://x/a.jpg");
        store.seed(&record).await.unwrap();
        store
            .put_field("p1", field::NSFW, FieldValue::Flag(true))
            .await
            .unwrap();
        store
            .put_field("p1", field::NSFW_CHECKED, FieldValue::Flag(true))
            .await
            .unwrap();
        let snapshot = store.get_all("p1").await.unwrap();

        handle_record(
            snapshot.clone(), &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();
        // Redelivery of the same notification must not fire a second reply.
        handle_record(
            snapshot, &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        let messages = platform.messages_to(7);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("not safe"));
    }

    /// Scenario 5: a notification carrying a stale snapshot (the style
    /// worker wrote `styled_url` to the store but died before re-publishing)
    /// must not stall the gate — the re-read sees the store's full state.
    #[tokio::test]
    async fn gate_rereads_authoritative_record_so_a_stale_snapshot_does_not_stall_it() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let notified = NotifyTracker::new();
        let quota = QuotaTracker::new(10);

        seed_and_enrich(&store, "p1", 42).await;

        // The notification handle_record actually receives predates the
        // styled_url write: the snapshot is stale.
        let mut stale_snapshot = PhotoRecord::new("p1", 42, "http://x/a.jpg");
        stale_snapshot.caption = "a cat".to_string();
        stale_snapshot.hashtag = "#cat".to_string();
        stale_snapshot.nsfw_checked = true;

        handle_record(
            stale_snapshot, &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        let persisted = store.get_all("p1").await.unwrap();
        assert!(
            persisted.publish,
            "gate should converge off the re-read record even though the notification was stale"
        );
    }

    /// P5: a chat that already exhausted its quota by the time enrichment
    /// finishes is denied at the gate, never published.
    #[tokio::test]
    async fn gate_denies_publish_when_quota_is_exhausted() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let notified = NotifyTracker::new();
        let quota = QuotaTracker::new(0);

        let record = seed_and_enrich(&store, "p1", 9).await;

        handle_record(
            record, &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        let messages = platform.messages_to(9);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("quota"));

        let persisted = store.get_all("p1").await.unwrap();
        assert!(!persisted.publish);
    }

    /// Scenario 6: the gate emits exactly one `publish=true` notification
    /// per photo, even when the completing notification is redelivered.
    #[tokio::test]
    async fn gate_emits_publish_flip_exactly_once_despite_redelivery() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let notified = NotifyTracker::new();
        let quota = QuotaTracker::new(10);

        let record = seed_and_enrich(&store, "p1", 3).await;
        let mut subscription = bus.subscribe().await.unwrap();

        handle_record(
            record.clone(), &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();
        // Redelivery of the same (now stale) notification.
        handle_record(
            record, &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        let first = subscription.recv().await.unwrap();
        assert!(first.publish);

        let second = tokio::time::timeout(StdDuration::from_millis(50), subscription.recv()).await;
        assert!(second.is_err(), "expected no second publish=true notification, got {second:?}");
    }

    /// A published photo is reported exactly once, counted against quota.
    #[tokio::test]
    async fn gate_notifies_published_exactly_once_and_records_quota_usage() {
        let store = InMemoryRecordStore::new();
        let bus = InMemoryEventBus::new();
        let platform = FakePlatform::new();
        let settings = FakeSettings;
        let catalog = catalog();
        let notified = NotifyTracker::new();
        let quota = QuotaTracker::new(2);

        let record = PhotoRecord::new("p1", 11, "http://x/a.jpg");
        store.seed(&record).await.unwrap();
        store
            .put_field(
                "p1",
                field::PUBLISHED_URL,
                FieldValue::Text("https://www.instagram.com/p/abc".into()),
            )
            .await
            .unwrap();
        store
            .put_field("p1", field::PUBLISHED, FieldValue::Flag(true))
            .await
            .unwrap();
        let snapshot = store.get_all("p1").await.unwrap();

        handle_record(
            snapshot.clone(), &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();
        handle_record(
            snapshot, &store, &bus, &platform, &settings, &catalog, &notified, &quota,
            "http://landing.example",
        )
        .await
        .unwrap();

        let messages = platform.messages_to(11);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("abc"));
        assert!(quota.has_quota(11));
    }
}
