//! Thumbnail worker binary.
//!
//! Consumes upload notifications from the source queue, derives JPEG
//! thumbnails into the thumbnails bucket and marks job records done.
//!
//! Environment variables:
//! - `SQS_QUEUE_URL`: source queue URL (required)
//! - `SQS_DEAD_LETTER_URL`: dead-letter queue URL (required)
//! - `DATABASE_URL`: PostgreSQL URL holding the jobs table (required)
//! - `AWS_REGION`: S3/SQS region (default: "us-east-1")
//! - `S3_ENDPOINT`: custom endpoint for MinIO/LocalStack (optional)
//! - `THUMBS_BUCKET`: destination bucket (default: "thumbnails")
//! - `THUMBS_PUBLIC_BASE_URL`: public URL override for derivatives (optional)
//! - `THUMB_MAX_DIMENSION`: primary cap in pixels (default: 640)
//! - `THUMB_2X_ENABLED`, `THUMB_2X_MAX_DIMENSION`: retina tier (default: off)
//! - `THUMB_QUALITY`: JPEG quality 1-100 (default: 90)
//! - `THUMB_SHARPEN_LEVEL`: unsharp level 0-3 (default: 2)

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info};

use mediaflow_worker::config::Config;
use mediaflow_worker::consumer::QueueConsumer;
use mediaflow_worker::derive::DerivationEngine;
use mediaflow_worker::processor::JobProcessor;
use mediaflow_worker::status::PgStatusStore;
use mediaflow_worker::storage::{aws_sdk_config, S3ObjectStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediaflow_worker=info".parse().expect("valid directive")),
        )
        .init();

    info!("Starting thumbnail worker");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    info!(
        queue = %config.queue.queue_url,
        thumbs_bucket = %config.storage.thumbs_bucket,
        max_primary = config.derivation.max_primary,
        secondary_enabled = config.derivation.secondary_enabled,
        "Configuration loaded"
    );

    // One SDK configuration shared by the S3 and SQS clients
    let aws = aws_sdk_config(&config.storage).await;
    let s3 = aws_sdk_s3::Client::new(&aws);
    let sqs = aws_sdk_sqs::Client::new(&aws);

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to status database")?;
    info!("Status store connected");

    let store = Arc::new(S3ObjectStore::new(s3, config.storage.clone()));
    let status = Arc::new(PgStatusStore::new(pool));
    let engine = Arc::new(DerivationEngine::new(config.derivation.clone()));
    let processor = JobProcessor::new(store, status, engine, config.storage.thumbs_bucket.clone());

    // Graceful shutdown on ctrl+c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Shutdown signal received");
        let _ = shutdown_tx_signal.send(true);
    });

    let mut consumer = QueueConsumer::new(sqs, config.queue.clone(), processor, shutdown_rx);
    if let Err(e) = consumer.run().await {
        error!(error = %e, "Consumer error");
    }

    info!("Thumbnail worker stopped");
    Ok(())
}
