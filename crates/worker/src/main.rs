//! Worker entry point: relays the outbox and drives sagas until SIGINT/SIGTERM.

use std::sync::Arc;

use outbox::{Engine, InMemoryBroker, PgOutboxStore};
use saga::{PgSagaStateStore, SagaOrchestrator};
use tokio::signal;
use tokio::sync::watch;
use tx_store::PgDatabase;
use worker::{Config, telemetry};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Configuration and telemetry
    let config = Config::from_env();
    telemetry::init_tracing(&config);
    telemetry::install_metrics(config.metrics_addr).expect("failed to install Prometheus exporter");

    // 2. Database, migrations and outbox engine
    let broker = InMemoryBroker::new();
    let engine: Arc<Engine<PgDatabase, PgOutboxStore, InMemoryBroker>> = Arc::new(
        Engine::init(&config.database_url, config.db_max_connections, broker.clone())
            .await
            .expect("failed to initialize outbox engine"),
    );
    let orchestrator = Arc::new(
        SagaOrchestrator::new(Arc::clone(&engine), PgSagaStateStore::new())
            .with_retry_policy(config.retry_policy()),
    );

    // 3. Background loops
    let (stop, shutdown) = watch::channel(false);

    let mut dispatcher = {
        let dispatcher = engine.dispatcher(config.dispatcher_config());
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    let handlers = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run_event_handlers(&broker, shutdown).await })
    };

    tracing::info!(metrics_addr = %config.metrics_addr, "worker started");

    // 4. Run until a signal arrives or the dispatcher gives up
    let dispatcher_done = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut dispatcher => Some(result),
    };
    let _ = stop.send(true);

    let dispatcher_result = match dispatcher_done {
        Some(result) => result,
        None => dispatcher.await,
    };
    match dispatcher_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "outbox dispatcher failed"),
        Err(e) => tracing::error!(error = %e, "outbox dispatcher task panicked"),
    }

    match handlers.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "saga event handlers failed"),
        Err(e) => tracing::error!(error = %e, "saga event handlers task panicked"),
    }

    tracing::info!("worker shut down gracefully");
}
