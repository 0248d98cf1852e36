pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod progress;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use tokio::sync::watch;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::queue::QueueService;
use crate::services::storage::StorageService;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let storage = StorageService::from_settings(&settings).await?;
    if storage.is_none() {
        tracing::warn!("S3 credentials not set; presigned URLs disabled");
    }

    let queue = QueueService::from_settings(&settings).await;
    if queue.is_none() {
        tracing::warn!("SQS_QUEUE_URL not set; queue poller disabled");
    }

    let state = AppState::new(settings, storage, queue.is_some());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = queue
        .map(|queue| tokio::spawn(tasks::poller::run(state.clone(), queue, shutdown_rx.clone())));
    drop(shutdown_rx);

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Gradi Rust API listening"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(core::shutdown::shutdown_signal())
        .await;

    if let Some(handle) = poller {
        if shutdown_tx.send(true).is_err() {
            tracing::warn!("Failed to signal queue poller shutdown");
        }
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Queue poller join failed");
        }
    }

    result?;

    Ok(())
}
