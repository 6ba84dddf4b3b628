use anyhow::{Context, Error};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, instrument, Instrument};

use showcase_worker::config::{StorageTarget, WorkerConfig};
use showcase_worker::convert::{Converter, FreeCadToolkit};
use showcase_worker::db::DbHandle;
use showcase_worker::storage::{FileTransfer, LocalStorage, ObjectStore, SupabaseStorage};
use showcase_worker::telemetry;
use showcase_worker::worker::{Buckets, Worker};

#[instrument(skip_all)]
async fn setup(config: WorkerConfig, cancel_token: CancellationToken) -> Result<(), Error> {
    let store = DbHandle::new(&config.database_url, config.max_connections)
        .await
        .context("connecting to job store")?;
    if config.init_schema {
        store.init_schema().await.context("creating schema")?;
    }

    let objects: Arc<dyn ObjectStore> = match config.storage_target()? {
        StorageTarget::Local(dir) => {
            info!(dir = %dir.display(), "Using local buckets");
            Arc::new(LocalStorage::new(dir))
        }
        StorageTarget::Service { url, service_key } => Arc::new(
            SupabaseStorage::new(&url, &service_key).context("configuring storage client")?,
        ),
    };

    let scratch_dir = config.scratch_dir();
    tokio::fs::create_dir_all(&scratch_dir)
        .await
        .with_context(|| format!("creating scratch dir {}", scratch_dir.display()))?;

    let worker = Worker::new(
        Arc::new(store),
        FileTransfer::new(objects, &scratch_dir),
        Converter::new(Arc::new(FreeCadToolkit::new(&config.freecad_cmd, &scratch_dir))),
        Buckets {
            uploaded: config.uploaded_bucket.clone(),
            converted: config.converted_bucket.clone(),
        },
    );

    worker
        .start(cancel_token, config.poll_interval())
        .instrument(info_span!("worker"))
        .await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await?;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(result?)
}
