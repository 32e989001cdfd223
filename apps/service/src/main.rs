use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

use tickwatch::alerting::{AlertDispatcher, LogNotifier, Notifier, WebhookNotifier};
use tickwatch::config::{Config, NotificationMode};
use tickwatch::database::models::Endpoint;
use tickwatch::database::{LibsqlStore, initialize_database};
use tickwatch::evaluator::StatusEvaluator;
use tickwatch::monitoring::MonitoringExecutor;
use tickwatch::pool::{LibsqlPool, open_pool};
use tickwatch::producer::JobProducer;
use tickwatch::queue::LibsqlQueue;
use tickwatch::shutdown::Shutdown;
use tickwatch::worker::{CheckWorker, WorkerSettings};

#[derive(Parser)]
#[command(name = "tickwatch", version)]
#[command(about = "Distributed uptime monitoring workers", long_about = None)]
struct Cli {
    /// Config file, created with defaults when missing
    #[arg(short, long, env = "TICKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overrides the config
    #[arg(long, env = "TICKWATCH_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim check jobs and probe endpoints
    Worker {
        /// Region this worker reports from
        #[arg(long, env = "REGION_ID")]
        region: Option<String>,

        /// Consumer name inside the group
        #[arg(long, env = "WORKER_ID")]
        worker_id: Option<String>,
    },
    /// Enqueue a check job for every endpoint on a fixed interval
    Producer,
    /// Enqueue one round of check jobs and exit
    ProduceOnce,
    /// Apply database migrations and exit
    Migrate,
    /// Register an endpoint, optionally with an email alert channel
    Seed {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        url: String,

        #[arg(long)]
        email: Option<String>,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = Config::from_config(cli.config.as_ref())?;
    if let Some(db) = cli.db {
        cfg.database.path = db;
    }

    logger::init_with(logger::LogFormat::from_name(&cfg.logging.format), LevelFilter::INFO);

    if let Commands::ShowConfig = cli.command {
        println!("{}", cfg);
        return Ok(());
    }

    let pool = open_pool(&cfg.database.path).await?;
    {
        let conn = pool.get().await.map_err(|e| anyhow!("failed to get connection: {}", e))?;
        initialize_database(&conn).await.context("failed to migrate database")?;
    }

    match cli.command {
        Commands::Worker { region, worker_id } => {
            if let Some(region) = region {
                cfg.worker.region = region;
            }
            if worker_id.is_some() {
                cfg.worker.worker_id = worker_id;
            }
            run_worker(&cfg, pool).await
        }
        Commands::Producer => run_producer(&cfg, pool).await,
        Commands::ProduceOnce => {
            let report = build_producer(&cfg, pool).produce_jobs().await?;
            println!("queued {} jobs ({} failed)", report.queued, report.failed);
            Ok(())
        }
        Commands::Migrate => {
            info!(path = %cfg.database.path, "Database is up to date");
            Ok(())
        }
        Commands::Seed { owner, url, email } => seed(pool, &owner, &url, email.as_deref()).await,
        Commands::ShowConfig => Ok(()),
    }
}

fn build_producer(cfg: &Config, pool: LibsqlPool) -> JobProducer {
    let store = Arc::new(LibsqlStore::new_from_pool(pool.clone()));
    let queue = Arc::new(LibsqlQueue::new_from_pool(pool));
    JobProducer::new(store, queue, cfg.queue.stream.clone())
}

fn build_notifier(cfg: &Config) -> Result<Arc<dyn Notifier>> {
    match cfg.notifications.mode {
        NotificationMode::Log => {
            info!("Alerts are logged only");
            Ok(Arc::new(LogNotifier))
        }
        NotificationMode::Webhook => {
            let url = cfg
                .notifications
                .webhook_url
                .clone()
                .context("notifications.webhook_url is required in webhook mode")?;
            Ok(Arc::new(WebhookNotifier::new(url, cfg.worker.probe_timeout())?))
        }
    }
}

async fn run_worker(cfg: &Config, pool: LibsqlPool) -> Result<()> {
    let store = Arc::new(LibsqlStore::new_from_pool(pool.clone()));
    let queue = Arc::new(LibsqlQueue::new_from_pool(pool));

    let dispatcher = Arc::new(
        AlertDispatcher::new(store.clone(), build_notifier(cfg)?)
            .with_dashboard_url(cfg.notifications.dashboard_url.clone()),
    );

    let max_tick_age = cfg.evaluator.max_tick_age();
    if max_tick_age.is_none() {
        warn!("evaluator.max_tick_age_seconds is unset, a silent region keeps its last vote");
    }
    let evaluator =
        Arc::new(StatusEvaluator::new(store.clone(), dispatcher).with_max_tick_age(max_tick_age));
    let executor = Arc::new(MonitoringExecutor::new(cfg.worker.probe_timeout())?);

    let settings = WorkerSettings {
        stream: cfg.queue.stream.clone(),
        group: cfg.queue.group.clone(),
        worker_id: cfg.worker.worker_id(),
        batch_size: cfg.queue.batch_size.max(1),
        block: Duration::from_millis(cfg.queue.block_ms),
        backoff: cfg.worker.backoff(),
        redeliver_after: match cfg.queue.redeliver_after_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    };

    let worker =
        CheckWorker::start(store, queue, executor, evaluator, settings, &cfg.worker.region).await?;

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    spawn_ctrl_c(shutdown);

    worker.run(signal).await
}

async fn run_producer(cfg: &Config, pool: LibsqlPool) -> Result<()> {
    let producer = build_producer(cfg, pool);

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    spawn_ctrl_c(shutdown);

    producer.run(Duration::from_secs(cfg.producer.interval_seconds.max(1)), signal).await
}

fn spawn_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.trigger();
            }
            Err(e) => {
                // Keep the coordinator alive, dropping it would stop the loop
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });
}

async fn seed(pool: LibsqlPool, owner: &str, url: &str, email: Option<&str>) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("invalid endpoint url '{}'", url))?;

    let store = LibsqlStore::new_from_pool(pool);
    let endpoint = Endpoint::new(owner, url);
    store.insert_endpoint(&endpoint).await?;
    println!("endpoint {} -> {}", endpoint.id, endpoint.url);

    if let Some(email) = email {
        let channel = store.insert_alert_channel(owner, "email", email, true).await?;
        println!("alert channel {} -> {}", channel.id, channel.target);
    }

    Ok(())
}
