use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
use payments_worker::config::{SelectorKind, WorkerConfig};
use payments_worker::health_monitor::HealthMonitor;
use payments_worker::ingestion;
use payments_worker::ledger_writer::LedgerWriter;
use payments_worker::metrics::{AtomicMetrics, DispatchMetrics};
use payments_worker::payment_processor::PaymentProcessor;
use payments_worker::selector::{HealthAware, ProcessorSelector, StaticDefault};
use payments_worker::server::{self, AppState};
use payments_worker::service::PaymentService;
use payments_worker::store::{LedgerStore, Store};
use payments_worker::worker_pool::{WorkerDependencies, WorkerPool};
use std::sync::Arc;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing with default level WARN, overridable via RUST_LOG
    {
        use tracing_subscriber::{EnvFilter, fmt};
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = WorkerConfig::from_env()?;

    let pg_config = config.postgres_url.parse::<tokio_postgres::Config>()?;
    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let dbpool = deadpool_postgres::Pool::builder(mgr)
        .max_size(config.db_pool_size)
        .runtime(deadpool_postgres::Runtime::Tokio1)
        .build()?;

    let store = Store::new(dbpool);
    store.ensure_schema().await?;
    if config.reset_ledger_on_start {
        tracing::warn!("LEDGER_RESET_ON_START is set, clearing payments:default and payments:fallback");
        store.reset().await?;
    }
    let store: Arc<dyn LedgerStore> = Arc::new(store);

    let metrics = Arc::new(AtomicMetrics::new());
    let dispatch_metrics: Arc<dyn DispatchMetrics> = metrics.clone();
    let shutdown = CancellationToken::new();

    let client = Arc::new(PaymentProcessor::new(&config.processors)?);

    let selector: Arc<dyn ProcessorSelector> = match config.selector {
        SelectorKind::Static => Arc::new(StaticDefault),
        SelectorKind::HealthAware => Arc::new(HealthAware::new(config.health_aware.clone())),
    };
    let health_monitor = match (&config.health_monitor, config.selector) {
        (Some(monitor_config), SelectorKind::HealthAware) => Some(
            HealthMonitor::new(
                &config.processors.default_url,
                &config.processors.fallback_url,
                monitor_config.clone(),
                Arc::clone(&selector),
            )?
            .start(shutdown.clone()),
        ),
        _ => None,
    };

    let (ledger, ledger_handle) = LedgerWriter::spawn(
        Arc::clone(&store),
        Arc::clone(&dispatch_metrics),
        config.ledger_buffer,
        config.ledger_batch_size,
    );

    let (queue, receiver) = ingestion::channel(config.queue_capacity, config.admission);
    let worker_pool = WorkerPool::start(
        config.pool.clone(),
        receiver,
        WorkerDependencies {
            selector,
            client,
            ledger,
            metrics: Arc::clone(&dispatch_metrics),
        },
        shutdown.clone(),
    );

    let state = Arc::new(AppState {
        service: PaymentService::new(queue, store, dispatch_metrics),
        metrics: metrics.clone(),
    });

    let mut server = tokio::spawn(server::serve(config.listen.clone(), state, shutdown.clone()));

    tokio::select! {
        _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
        result = &mut server => {
            shutdown.cancel();
            worker_pool.shutdown(config.shutdown_grace).await;
            result??;
            return Err("server stopped unexpectedly".into());
        }
    }

    shutdown.cancel();
    if let Err(e) = server.await {
        tracing::error!(error = %e, "Server task failed");
    }
    worker_pool.shutdown(config.shutdown_grace).await;

    if let Err(e) = ledger_handle.await {
        tracing::error!(error = %e, "Ledger writer task failed");
    }
    if let Some(handle) = health_monitor {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Health monitor task failed");
        }
    }

    tracing::info!(metrics = ?metrics.snapshot(), "Worker stopped");
    Ok(())
}
