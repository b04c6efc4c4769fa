use animirror_config::{AppConfig, init_logging, split_config_args};
use animirror_ingest::{DeltaSyncOptions, DeltaSyncWorker, IngestService};
use animirror_kodik::KodikClient;
use animirror_publish::{
    Downloader, DownloaderOptions, PublishQueue, PublishWorker, PublishWorkerOptions,
};
use animirror_store::init_store;
use animirror_telegram::{ChatClient, TelegramClient, UserSession};
use animirror_util::{ShutdownHandle, chunked, run_limited, shutdown_channel};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::error::Error;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let (config_path, args) = split_config_args(env::args().skip(1))?;
    let mut args = args.into_iter();
    let command = args.next().unwrap_or_default();

    if matches!(command.as_str(), "help" | "") {
        print_usage();
        return Ok(());
    }
    if !matches!(
        command.as_str(),
        "init-db" | "ingest-full" | "delta-sync" | "upload-worker"
    ) {
        print_usage();
        return Ok(());
    }

    let config = AppConfig::load(config_path)?;
    let _log_guard = init_logging(&config.logging)?;

    match command.as_str() {
        "init-db" => cmd_init_db(&config).await,
        "ingest-full" => {
            let max_pages = match args.next() {
                Some(raw) => Some(raw.parse::<u32>().map_err(|_| "invalid max pages")?),
                None => None,
            };
            cmd_ingest_full(&config, max_pages).await
        }
        "delta-sync" => {
            let once = matches!(args.next().as_deref(), Some("--once"));
            cmd_delta_sync(&config, once).await
        }
        "upload-worker" => cmd_upload_worker(&config).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

async fn connect_db(config: &AppConfig) -> Result<PgPool, Box<dyn Error>> {
    let dsn = config.db.require_dsn()?;
    let db = PgPoolOptions::new()
        .max_connections(config.db.max_connections())
        .acquire_timeout(Duration::from_secs(config.db.pool_timeout_secs))
        .connect(&dsn)
        .await?;
    init_store(&db).await?;
    Ok(db)
}

fn build_kodik(config: &AppConfig) -> Result<KodikClient, Box<dyn Error>> {
    let client = KodikClient::new(config.kodik.token.clone(), config.kodik.rps_limit)?
        .with_base_url(config.kodik.base_url.clone());
    Ok(client)
}

fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        handle.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(_) => return,
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => return,
    };
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_init_db(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let _db = connect_db(config).await?;
    println!("schema ready");
    Ok(())
}

async fn cmd_ingest_full(
    config: &AppConfig,
    max_pages: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    let db = connect_db(config).await?;
    let client = build_kodik(config)?;

    let raw_items = client.fetch_full_list(50, max_pages).await?;
    let total = raw_items.len();
    let batches = chunked(raw_items, config.workers.ingest_batch_size);
    let batch_count = batches.len();
    let service = Arc::new(IngestService::new(db));

    let results = run_limited(batches, config.workers.concurrency, move |batch| {
        let service = service.clone();
        async move { service.ingest_items(&batch).await }
    })
    .await;

    let mut successful = 0;
    let mut failed = 0;
    let mut failed_batches = 0;
    for result in results {
        match result {
            Ok(stats) => {
                successful += stats.successful;
                failed += stats.failed;
            }
            Err(err) => {
                tracing::error!("batch failed: {}", err);
                failed_batches += 1;
            }
        }
    }

    info!(total, successful, failed, failed_batches, "full ingest completed");
    println!(
        "ingested {} of {} items ({} batches, {} failed items, {} failed batches)",
        successful, total, batch_count, failed, failed_batches
    );
    Ok(())
}

async fn cmd_delta_sync(config: &AppConfig, once: bool) -> Result<(), Box<dyn Error>> {
    let db = connect_db(config).await?;
    let client = Arc::new(build_kodik(config)?);
    let (handle, shutdown) = shutdown_channel();
    spawn_signal_listener(handle);

    let options = DeltaSyncOptions {
        sync_interval: Duration::from_secs(config.workers.sync_interval_secs),
        lookback_hours: config.workers.lookback_hours,
        batch_size: config.workers.ingest_batch_size,
        concurrency: config.workers.concurrency,
        ..DeltaSyncOptions::default()
    };
    let worker = DeltaSyncWorker::new(client, db, options, shutdown);

    if once {
        let stats = worker.sync(None).await?;
        println!(
            "synced {} items ({} failed items, {} failed batches)",
            stats.total_imported, stats.failed_items, stats.failed_batches
        );
        return Ok(());
    }

    worker.start().await;
    Ok(())
}

async fn cmd_upload_worker(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let db = connect_db(config).await?;
    let kodik = Arc::new(build_kodik(config)?);
    let (handle, shutdown) = shutdown_channel();
    spawn_signal_listener(handle);

    let (api_id, api_hash, session_string) = config.telegram.require_user_session()?;
    let session = UserSession {
        api_id,
        api_hash,
        session_string,
    };
    let chat: Arc<dyn ChatClient> = Arc::new(
        TelegramClient::new(session, config.telegram.proxy_url.as_deref())?
            .with_api_base(config.telegram.api_base.clone()),
    );
    // A dead session would fail every upload; refuse to start instead.
    chat.saved_chat().await?;
    let queue = Arc::new(PublishQueue::new(
        chat,
        Arc::new(db.clone()),
        config.telegram.upload_chat_id.clone(),
        config.workers.queue_capacity,
    ));

    let downloader = Downloader::new(
        kodik,
        DownloaderOptions {
            temp_dir: config.downloader.temp_dir.clone(),
            timeout: Duration::from_secs(config.downloader.timeout_secs),
            min_file_size: config.downloader.min_file_size_bytes,
            ffmpeg_path: config.downloader.ffmpeg_path.clone(),
            ..DownloaderOptions::default()
        },
    )?;

    let options = PublishWorkerOptions {
        poll_interval: Duration::from_secs(config.workers.upload_poll_interval_secs),
        batch_size: config.workers.publish_batch_size,
        max_retries: config.workers.max_download_retries,
        max_file_size_mb: config.downloader.max_file_size_mb,
        ..PublishWorkerOptions::default()
    };
    let worker = PublishWorker::new(db, downloader, queue.clone(), options, shutdown);

    worker.start().await;
    queue
        .shutdown(Duration::from_secs(config.workers.shutdown_timeout_secs))
        .await;
    Ok(())
}

fn print_usage() {
    println!("animirror-cli");
    println!("");
    println!("Usage:");
    println!("  animirror-cli [--config <path>] init-db");
    println!("  animirror-cli [--config <path>] ingest-full [max-pages]");
    println!("  animirror-cli [--config <path>] delta-sync [--once]");
    println!("  animirror-cli [--config <path>] upload-worker");
    println!("");
    println!("Config:");
    println!("  --config <path>      path to config.toml");
    println!("  ANIMIRROR_CONFIG     path to config.toml (env override)");
    println!("  POSTGRES_DSN, KODIK_TOKEN, USER_API_*, ... (see config.toml.example)");
}
