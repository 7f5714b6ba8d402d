//! Ingestion run orchestration: configuration, paging, upserts and the
//! all-or-nothing transaction around one run.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rli_core::{extract_page_items, RawListingRecord};
use rli_storage::{page_source_for, FetchError, HttpClientConfig, PageSource};
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, MySqlConnection, Transaction};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rli-sync";

pub static MIGRATOR: Migrator = sqlx::migrate!();

pub const UPSERT_RAW_LISTING_SQL: &str =
    "INSERT INTO raw_listing (id, source, payload, status, scraped_at) \
     VALUES (?, ?, ?, ?, NOW()) \
     ON DUPLICATE KEY UPDATE payload = VALUES(payload), scraped_at = NOW()";

pub mod env_keys {
    pub const TARGET_URL: &str = "TARGET_URL";
    pub const AUTH_HEADER: &str = "AUTH_HEADER";
    pub const AUTH_VALUE: &str = "AUTH_VALUE";
    pub const PAGE_PARAM: &str = "PAGE_PARAM";
    pub const SIZE_PARAM: &str = "SIZE_PARAM";
    pub const PAGE_SIZE: &str = "PAGE_SIZE";
    pub const REQUEST_INTERVAL_SEC: &str = "REQUEST_INTERVAL_SEC";
    pub const TIMEOUT_SEC: &str = "TIMEOUT_SEC";
    pub const MOCK_JSON: &str = "MOCK_JSON";
    pub const SOURCE_NAME: &str = "SOURCE_NAME";
    pub const MYSQL_HOST: &str = "MYSQL_HOST";
    pub const MYSQL_PORT: &str = "MYSQL_PORT";
    pub const MYSQL_USER: &str = "MYSQL_USER";
    pub const MYSQL_PASSWORD: &str = "MYSQL_PASSWORD";
    pub const MYSQL_DB: &str = "MYSQL_DB";
    pub const SYNC_CRON: &str = "SYNC_CRON";
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .charset("utf8mb4")
    }

    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub http: HttpClientConfig,
    pub request_interval: Duration,
    pub mock_json: Option<PathBuf>,
    pub source_name: String,
    pub database: DatabaseConfig,
    pub sync_cron: String,
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn parsed_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, applying defaults for
    /// unset keys and for numeric values that do not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        use env_keys::*;

        let defaults = HttpClientConfig::default();
        let interval_secs: f64 = parsed_var(&lookup, REQUEST_INTERVAL_SEC, 0.5);
        let request_interval = Duration::try_from_secs_f64(interval_secs).unwrap_or_else(|_| {
            warn!(value = interval_secs, "invalid request interval, using default");
            Duration::from_millis(500)
        });
        let mock_json = lookup(MOCK_JSON)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            http: HttpClientConfig {
                endpoint: string_var(&lookup, TARGET_URL, ""),
                page_param: string_var(&lookup, PAGE_PARAM, &defaults.page_param),
                size_param: string_var(&lookup, SIZE_PARAM, &defaults.size_param),
                page_size: parsed_var(&lookup, PAGE_SIZE, defaults.page_size),
                timeout: Duration::from_secs(parsed_var(&lookup, TIMEOUT_SEC, 20u64)),
                user_agent: defaults.user_agent,
                auth_header_name: string_var(&lookup, AUTH_HEADER, ""),
                auth_header_value: string_var(&lookup, AUTH_VALUE, ""),
            },
            request_interval,
            mock_json,
            source_name: string_var(&lookup, SOURCE_NAME, "target"),
            database: DatabaseConfig {
                host: string_var(&lookup, MYSQL_HOST, "localhost"),
                port: parsed_var(&lookup, MYSQL_PORT, 3306u16),
                user: string_var(&lookup, MYSQL_USER, "app"),
                password: string_var(&lookup, MYSQL_PASSWORD, "app_pw"),
                database: string_var(&lookup, MYSQL_DB, "appdb"),
            },
            sync_cron: string_var(&lookup, SYNC_CRON, "0 */30 * * * *"),
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            request_interval: self.request_interval,
            default_source: self.source_name.clone(),
        }
    }
}

/// Lazy, finite walk over every item of every page, starting at page 1.
///
/// The walk ends at the first page with no items. A fetch error is returned
/// once and the stream is finished afterwards; a new stream starts over at
/// page 1.
pub struct ItemStream<'a> {
    source: &'a dyn PageSource,
    request_interval: Duration,
    next_page: u32,
    buffered: VecDeque<JsonValue>,
    pages_fetched: u32,
    finished: bool,
}

impl<'a> ItemStream<'a> {
    pub fn new(source: &'a dyn PageSource, request_interval: Duration) -> Self {
        Self {
            source,
            request_interval,
            next_page: 1,
            buffered: VecDeque::new(),
            pages_fetched: 0,
            finished: false,
        }
    }

    /// Number of page requests issued so far, including the terminating one.
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub async fn next_item(&mut self) -> Result<Option<JsonValue>, FetchError> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            if self.finished {
                return Ok(None);
            }

            // Pause follows every non-empty page, so the final empty-page request waits too.
            if self.next_page > 1 {
                tokio::time::sleep(self.request_interval).await;
            }

            let page = self.next_page;
            let document = match self.source.fetch_page(page).await {
                Ok(document) => document,
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            self.pages_fetched += 1;

            let items = extract_page_items(&document);
            if items.is_empty() {
                debug!(page, "empty page, ending stream");
                self.finished = true;
                return Ok(None);
            }

            debug!(page, items = items.len(), "page fetched");
            self.buffered.extend(items);
            self.next_page += 1;
        }
    }
}

/// Transactional sink for `raw_listing` rows.
///
/// A run calls `begin` once, `upsert` per item, then exactly one of
/// `commit`/`rollback`, and always `close`.
#[async_trait]
pub trait RawListingStore: Send {
    async fn begin(&mut self) -> Result<()>;
    async fn upsert(&mut self, record: &RawListingRecord) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

pub async fn upsert_raw_listing(
    conn: &mut MySqlConnection,
    record: &RawListingRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_RAW_LISTING_SQL)
        .bind(&record.id)
        .bind(&record.source)
        .bind(&record.payload)
        .bind(&record.status)
        .execute(conn)
        .await?;
    Ok(())
}

/// MySQL-backed store holding a single connection for the whole run.
pub struct MySqlRawListingStore {
    pool: MySqlPool,
    tx: Option<Transaction<'static, MySql>>,
}

impl MySqlRawListingStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(config.connect_options())
            .await
            .with_context(|| format!("connecting to mysql at {}", config.target()))?;
        Ok(Self { pool, tx: None })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl RawListingStore for MySqlRawListingStore {
    async fn begin(&mut self) -> Result<()> {
        let tx = self.pool.begin().await.context("starting ingest transaction")?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn upsert(&mut self, record: &RawListingRecord) -> Result<()> {
        let tx = self
            .tx
            .as_mut()
            .context("upsert called outside of a transaction")?;
        upsert_raw_listing(&mut **tx, record)
            .await
            .with_context(|| format!("upserting raw_listing id={}", record.id))
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.context("committing ingest transaction")?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.context("rolling back ingest transaction")?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // An unfinished transaction rolls back when dropped.
        self.tx = None;
        self.pool.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub request_interval: Duration,
    pub default_source: String,
}

/// Outcome of a committed run. `upserted` counts executed statements (an id
/// repeated within the run counts each time); `skipped` counts items that had
/// no usable identifier.
#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub upserted: usize,
    pub skipped: usize,
}

impl SyncRunSummary {
    /// Every item the stream yielded, written or not.
    pub fn items_seen(&self) -> usize {
        self.upserted + self.skipped
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct IngestCounts {
    pages_fetched: u32,
    upserted: usize,
    skipped: usize,
}

async fn ingest_items<S: RawListingStore + ?Sized>(
    source: &dyn PageSource,
    store: &mut S,
    settings: &IngestSettings,
) -> Result<IngestCounts> {
    let mut stream = ItemStream::new(source, settings.request_interval);
    let mut counts = IngestCounts::default();

    while let Some(item) = stream.next_item().await? {
        match RawListingRecord::from_item(&item, &settings.default_source)? {
            Some(record) => {
                store.upsert(&record).await?;
                counts.upserted += 1;
            }
            None => {
                debug!("skipping item without id/uuid/pk");
                counts.skipped += 1;
            }
        }
    }

    counts.pages_fetched = stream.pages_fetched();
    Ok(counts)
}

/// Runs one full ingestion against `store`: everything from this run is
/// committed together, or nothing is.
pub async fn run_ingest<S: RawListingStore + ?Sized>(
    source: &dyn PageSource,
    store: &mut S,
    settings: &IngestSettings,
) -> Result<SyncRunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let span = info_span!("ingest_run", %run_id);

    async move {
        let outcome = match store.begin().await {
            Ok(()) => match ingest_items(source, &mut *store, settings).await {
                Ok(counts) => store.commit().await.map(|()| counts),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(counts) => {
                info!(
                    pages = counts.pages_fetched,
                    upserted = counts.upserted,
                    skipped = counts.skipped,
                    "ingest committed"
                );
                Ok(SyncRunSummary {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    pages_fetched: counts.pages_fetched,
                    upserted: counts.upserted,
                    skipped: counts.skipped,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "ingest failed, rolling back");
                if let Err(rollback_err) = store.rollback().await {
                    let message = format!("{rollback_err:#}");
                    warn!(error = %message, "rollback failed");
                }
                Err(err)
            }
        };

        if let Err(close_err) = store.close().await {
            let message = format!("{close_err:#}");
            warn!(error = %message, "closing store failed");
        }
        result
    }
    .instrument(span)
    .await
}

pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let source = page_source_for(&self.config.http, self.config.mock_json.as_deref())
            .context("building page source")?;
        match &self.config.mock_json {
            Some(path) => info!(path = %path.display(), "reading pages from mock file"),
            None => info!(endpoint = %self.config.http.endpoint, "reading pages from endpoint"),
        }

        let mut store = MySqlRawListingStore::connect(&self.config.database).await?;
        run_ingest(source.as_ref(), &mut store, &self.config.ingest_settings()).await
    }
}

pub async fn run_migrations(config: &DatabaseConfig) -> Result<()> {
    let store = MySqlRawListingStore::connect(config).await?;
    let result = MIGRATOR
        .run(store.pool())
        .await
        .context("applying raw_listing migrations");
    store.pool().close().await;
    result
}

/// Cron-driven sync. A tick that fires while a run is still in flight is
/// skipped, so runs from one process never overlap.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            let Ok(_running) = in_flight.try_lock() else {
                warn!("previous sync still running; skipping scheduled tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    upserted = summary.upserted,
                    "scheduled sync complete"
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled sync failed");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs the scheduler until ctrl-c.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested, stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
