//! Qbank Core Service
//!
//! Runs the index-sync pipeline and the health/metrics endpoints, and offers
//! one-shot operational commands.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          qbank run                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ SyncProducer │───▶│ Redis queue  │───▶│ SyncConsumer │──▶ index
//! │  │  (Postgres)  │    │              │    │   (x N)      │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │        /healthz /readyz :8081              /metrics :8080        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use qbank::adapters::postgres::ensure_schema;
use qbank::adapters::{
    LoggingEventPublisher, PostgresContentStore, RedisFastCache, RedisQueueBroker,
    TantivySearchIndex,
};
use qbank::config::{AppConfig, IndexConfig};
use qbank::domain::ports::{
    EventPublisher, FastCache, SearchIndex, SearchQuery, SortOrder, UserId,
};
use qbank::server::{self, Readiness};
use qbank::sync::{SyncConsumer, SyncPipeline, SyncProducer, SyncWatermark};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Qbank core - hot-key cache, search index sync and session abuse control
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "QBANK_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL (overrides redis.url)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// PostgreSQL host (overrides postgres.host)
    #[arg(long, env = "POSTGRES_HOST")]
    postgres_host: Option<String>,

    /// PostgreSQL password (overrides postgres.password)
    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    postgres_password: Option<String>,

    /// Search index directory (overrides index.path)
    #[arg(long, env = "INDEX_PATH")]
    index_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync pipeline and the health/metrics servers (default)
    Run,
    /// Run one producer cycle and drain the queue once
    SyncOnce,
    /// Query the search index and print the page as JSON
    Search {
        /// Full-text query; omit to list everything
        text: Option<String>,
        /// Required tag (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Only items created by this user
        #[arg(long)]
        user: Option<u64>,
        /// Include soft-deleted documents
        #[arg(long)]
        include_deleted: bool,
        /// Newest first instead of best match first
        #[arg(long)]
        newest: bool,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "10")]
        size: usize,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::SyncOnce => sync_once(config).await,
        Command::Search {
            text,
            tag,
            user,
            include_deleted,
            newest,
            offset,
            size,
        } => {
            let query = SearchQuery {
                text,
                tags: tag,
                user_id: user.map(UserId::new),
                include_deleted,
                sort: if newest {
                    SortOrder::UpdateTimeDesc
                } else {
                    SortOrder::Relevance
                },
                offset,
                size,
            };
            search(config, query).await
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AppConfig::default(),
    };

    if let Some(url) = &args.redis_url {
        config.redis.url = url.clone();
    }
    if let Some(host) = &args.postgres_host {
        config.postgres.host = host.clone();
    }
    if let Some(password) = &args.postgres_password {
        config.postgres.password = password.clone();
    }
    if let Some(path) = &args.index_path {
        config.index.path = Some(path.clone());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_index(config: &IndexConfig) -> anyhow::Result<TantivySearchIndex> {
    match &config.path {
        Some(path) => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("creating index directory {}", path.display()))?;
            TantivySearchIndex::open_or_create(path)
                .with_context(|| format!("opening search index at {}", path.display()))
        }
        None => {
            warn!("No index path configured, search index is kept in RAM");
            Ok(TantivySearchIndex::in_memory()?)
        }
    }
}

/// Everything the sync pipeline runs against.
struct Backends {
    cache: Arc<RedisFastCache>,
    broker: Arc<RedisQueueBroker>,
    store: Arc<PostgresContentStore>,
    index: Arc<TantivySearchIndex>,
    events: Arc<dyn EventPublisher>,
}

async fn connect(config: &AppConfig) -> anyhow::Result<Backends> {
    let redis = config.redis.create_pool()?;
    let cache = Arc::new(RedisFastCache::new(redis.clone()));
    if !cache.health_check().await? {
        warn!("Fast cache not reachable yet: {}", config.redis.url);
    }
    let broker = Arc::new(RedisQueueBroker::new(redis));

    let pool = config.postgres.create_pool()?;
    ensure_schema(&pool)
        .await
        .context("preparing primary store schema")?;
    let store = Arc::new(PostgresContentStore::new(pool));

    let index = Arc::new(open_index(&config.index)?);
    info!("Search index open with {} documents", index.num_docs());

    Ok(Backends {
        cache,
        broker,
        store,
        index,
        events: Arc::new(LoggingEventPublisher::new()),
    })
}

fn build_pipeline(config: &AppConfig, backends: &Backends) -> SyncPipeline {
    let sync = &config.sync;

    let watermark = SyncWatermark::new(sync.mode, sync.window()).with_store(backends.cache.clone());
    let producer = SyncProducer::new(
        backends.store.clone(),
        backends.broker.clone(),
        watermark,
        sync.queue.clone(),
        sync.interval(),
        backends.events.clone(),
    );

    let consumers = (0..sync.consumers)
        .map(|_| {
            SyncConsumer::new(
                backends.broker.clone(),
                backends.index.clone(),
                sync.queue.clone(),
                backends.events.clone(),
            )
            .with_receive_wait(sync.receive_wait())
            .with_retry_backoff(sync.retry_backoff())
        })
        .collect();

    SyncPipeline::new(producer, consumers)
}

// =============================================================================
// Commands
// =============================================================================

async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!("Starting qbank core");
    info!("  Sync interval: {}s, window: {}s", config.sync.interval_secs, config.sync.window_secs);
    info!("  Watermark mode: {:?}", config.sync.mode);
    info!("  Consumers: {}", config.sync.consumers);
    info!("  Hot threshold: {}", config.cache.hot_threshold);

    qbank::metrics::register_all();
    let backends = connect(&config).await?;

    let recovered = backends
        .broker
        .recover_in_flight(&config.sync.queue)
        .await
        .context("recovering in-flight sync batches")?;
    if recovered > 0 {
        info!("Returned {} in-flight batches to the queue", recovered);
    }

    let cancel = CancellationToken::new();

    let readiness = Arc::new(Readiness::new(
        backends.cache.clone(),
        backends.store.clone(),
        backends.events.clone(),
    ));
    let health = server::bind(&config.server.health_addr).await?;
    let metrics = server::bind(&config.server.metrics_addr).await?;
    let health_task = tokio::spawn(server::run_health_server(health, readiness, cancel.clone()));
    let metrics_task = tokio::spawn(server::run_metrics_server(metrics, cancel.clone()));

    let pipeline = build_pipeline(&config, &backends);
    let handle = pipeline.spawn(cancel.child_token());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    handle.shutdown().await;
    for task in [health_task, metrics_task] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server error: {}", e),
            Err(e) => error!("Server task failed: {}", e),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn sync_once(config: AppConfig) -> anyhow::Result<()> {
    let backends = connect(&config).await?;
    backends.broker.recover_in_flight(&config.sync.queue).await?;

    let pipeline = build_pipeline(&config, &backends);
    let producer = pipeline.producer();
    producer.watermark().load().await;

    let report = producer.run_cycle(Utc::now()).await?;
    info!(
        "Published {} rows changed since {}",
        report.published, report.window.from
    );

    let consumer = pipeline
        .consumers()
        .first()
        .context("no sync consumer configured")?;
    let handled = consumer.drain().await?;
    info!("Indexed {} batches, index holds {} documents", handled, backends.index.num_docs());
    Ok(())
}

async fn search(config: AppConfig, query: SearchQuery) -> anyhow::Result<()> {
    let index = open_index(&config.index)?;
    let page = index.search(&query).await?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tantivy=warn", "tokio_postgres=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
