//! Task manager service entry point.

use anyhow::Context;
use tracing::info;

use task_manager::config::ManagerConfig;
use task_manager::database::DatabaseConnection;
use task_manager::logging::init_logging;
use task_manager::notify::ChangeFeedListener;
use task_manager::orchestration::TaskManager;
use task_manager::runtime::{Service, ServiceRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = ManagerConfig::load().context("failed to load configuration")?;
    let database = DatabaseConnection::new(&config.database)
        .await
        .context("failed to connect to database")?;
    database.health_check().await.context("database health check failed")?;

    let manager = TaskManager::new(config.clone(), database.pool().clone())
        .await
        .context("failed to initialize task manager")?;
    let listener = ChangeFeedListener::new(
        database.pool().clone(),
        config.listener.clone(),
        manager.channels(),
    );
    let mut runtime = ServiceRuntime::new(manager, listener);

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.notify_one();
    });

    runtime.run().await.context("service runtime failed")?;
    database.close().await;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
