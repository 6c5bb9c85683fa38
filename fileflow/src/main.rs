use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fileflow::access::StaticAccessGate;
use fileflow::config::AppConfig;
use fileflow::database::{self, repositories};
use fileflow::logging;
use fileflow::media::{FfprobeProber, FileMetadataExtractor};
use fileflow::pipeline::{JobPipeline, JobQueue, PurgeService, WorkerPool};
use fileflow::preferences::PreferenceService;
use fileflow::thumbnail::{FrameExtractor, ThumbnailResolver};
use fileflow::transfer::{DeliverySink, DirectorySink, HttpSink, TransferExecutor};
use fileflow::utils::http_client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("initializing logging")?;

    http_client::install_rustls_provider();

    let pool = database::init_pool(&config.database_url)
        .await
        .context("opening database")?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let job_repo = Arc::new(repositories::SqlxJobRepository::new(pool.clone()));
    let counter_repo = Arc::new(repositories::SqlxCounterRepository::new(pool.clone()));
    let pref_repo = Arc::new(repositories::SqlxPreferenceRepository::new(pool.clone()));

    let gate = if config.allowed_users.is_empty() {
        StaticAccessGate::allow_all()
    } else {
        StaticAccessGate::allow_only(config.allowed_users.iter().copied())
    };

    let http = http_client::build_client(config.connect_timeout(), config.read_timeout())?;
    let mut staging_dir = None;
    let sink: Arc<dyn DeliverySink> = match &config.delivery_endpoint {
        Some(endpoint) => Arc::new(HttpSink::new(
            http.clone(),
            url::Url::parse(endpoint).context("parsing delivery endpoint")?,
        )),
        None => {
            let sink = DirectorySink::new(&config.outbox);
            staging_dir = Some(sink.staging_dir());
            Arc::new(sink)
        }
    };
    let transfer = TransferExecutor::new(http, &config.upload_root, sink)
        .with_chunk_size(config.chunk_size_bytes)
        .with_max_file_size(config.max_file_size_bytes);
    let extractor = FileMetadataExtractor::new().with_prober(FfprobeProber::from_env());
    let frames = FrameExtractor::from_env(config.thumbnail_width);
    let prefs = Arc::new(
        PreferenceService::new(pref_repo, &config.thumbnail_root).with_normalizer(frames.clone()),
    );
    let thumbnails = ThumbnailResolver::new(prefs.clone()).with_frame_extractor(frames);

    let pipeline = Arc::new(
        JobPipeline::new(
            Arc::new(transfer),
            Arc::new(extractor),
            prefs,
            &config.temp_root,
        )
        .with_thumbnails(thumbnails)
        .with_fetch_retry(config.transfer_retry_policy())
        .with_deliver_retry(config.transfer_retry_policy())
        .with_min_free_disk(config.min_free_disk_bytes),
    );

    let mut queue = JobQueue::new(
        config.queue_config(),
        job_repo.clone(),
        counter_repo,
        Arc::new(gate),
        &config.temp_root,
    );
    if let Some(dir) = staging_dir {
        queue = queue.with_staging_dir(dir);
    }
    let queue = Arc::new(queue);
    let report = queue.recover().await.context("recovering jobs")?;
    info!(
        requeued = report.requeued,
        reloaded = report.reloaded,
        temp_entries_removed = report.temp_entries_removed,
        partial_deliveries_removed = report.partial_deliveries_removed,
        "Recovery complete"
    );

    let cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(config.log_retention_days, cancel.clone());

    let workers = WorkerPool::new(config.worker_config(), queue.clone(), pipeline);
    workers.start();

    let purge = Arc::new(PurgeService::new(config.purge_config(), job_repo, queue));
    let purge_handle = purge.start(cancel.clone());

    info!(
        global_slots = config.global_slots,
        per_user_slots = config.per_user_slots,
        "fileflow started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");

    workers.stop().await;
    cancel.cancel();
    if let Err(e) = purge_handle.await {
        error!("Purge task ended abnormally: {}", e);
    }
    pool.close().await;

    info!("fileflow stopped");
    Ok(())
}
