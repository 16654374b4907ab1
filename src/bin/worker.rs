use detect_worker::{
    app_state::AppState,
    config::AppConfig,
    consumer::ConsumerLoop,
    db::{self, PgPredictionStore},
    pipeline::JobPipeline,
    routes,
    services::{
        class_names::ClassNameTable, notifier::HttpNotifier, queue::RedisQueue,
        storage::S3Store, yolo::OnnxDetector,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting detection worker");

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "detect_jobs_total",
        "Queue messages handled, by outcome (completed, rejected, abandoned)"
    );
    metrics::describe_histogram!(
        "detect_job_seconds",
        "Time from receive to disposition of a queue message"
    );
    metrics::describe_histogram!(
        "detect_persist_attempts",
        "Insert attempts used per prediction record"
    );
    metrics::describe_counter!(
        "detect_labels_skipped_total",
        "Detection output lines skipped as corrupt"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let documents = PgPredictionStore::new(db_pool);

    tracing::info!(bucket = %config.s3_bucket, "Initializing S3 storage client");
    let storage = S3Store::new(
        &config.s3_bucket,
        &config.s3_region,
        config.s3_endpoint.as_deref(),
        config.s3_access_key.as_deref(),
        config.s3_secret_key.as_deref(),
    )
    .expect("Failed to initialize S3 client");

    tracing::info!(queue = %config.queue_name, "Connecting to Redis job queue");
    let queue = RedisQueue::new(
        &config.redis_url,
        &config.queue_name,
        config.visibility_timeout(),
    )
    .expect("Failed to initialize job queue");
    let queue = Arc::new(queue);

    let class_names =
        ClassNameTable::load(&config.class_names_path).expect("Failed to load class name table");
    tracing::info!(classes = class_names.len(), "Loaded class name table");

    let detector = OnnxDetector::load(&config.model_path, config.detector_options())
        .expect("Failed to load detection model");

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .expect("Failed to create scratch directory");

    let mut state = AppState::new(
        queue.clone(),
        Arc::new(storage),
        Arc::new(documents),
        Arc::new(detector),
        class_names,
    );

    match &config.notify_url {
        Some(url) => {
            let notifier = HttpNotifier::new(url.as_str(), config.notify_timeout())
                .expect("Failed to initialize notification client");
            tracing::info!(url = %notifier.url(), "Prediction notifications enabled");
            state = state.with_notifier(Arc::new(notifier));
        }
        None => tracing::info!("NOTIFY_URL not set, prediction notifications disabled"),
    }

    let pipeline = Arc::new(JobPipeline::new(state.clone(), config.pipeline_settings()));
    let consumer = ConsumerLoop::new(queue, pipeline, config.loop_settings());

    let app = routes::router(state, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind ops address");
    tracing::info!("Ops server listening on {}", config.bind_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Ops server stopped");
        }
    });

    tokio::select! {
        _ = consumer.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping worker");
        }
    }
}
