#![allow(clippy::result_large_err)]

use dotenvy::dotenv;
use dropship_ledger::{
    config::{
        database::{create_connection, create_tables},
        settings::load_default_config,
    },
    core::{
        import::Importer,
        ledger::LedgerPoster,
        memory::MemoryMonitor,
        metrics::Metrics,
        processors::{ImportBatchProcessor, ReconcileBatchProcessor},
        reconcile::Reconciler,
        scheduler::{BatchScheduler, PriorityScheduler},
    },
    errors::Result,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Application settings
    let config = load_default_config()?;
    info!("Configuration loaded.");

    // 4. Database
    let db = create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    create_tables(&db)
        .await
        .inspect(|()| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to initialize database: {}", e))?;

    // 5. Shared components
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let memory = Arc::new(MemoryMonitor::for_process(
        config.memory.clone(),
        Arc::clone(&metrics),
    ));
    let poster = LedgerPoster::new(config.accounts.clone(), Arc::clone(&metrics));
    let reconciler = Reconciler::new(
        db.clone(),
        poster,
        config.circuit_breaker.clone(),
        Arc::clone(&metrics),
    );
    let importer = Importer::new(
        db.clone(),
        config.import.clone(),
        Arc::clone(&memory),
        Arc::clone(&metrics),
    )
    .with_shutdown(shutdown_rx.clone());

    // 6. Background loops
    let reconcile_scheduler = BatchScheduler::new(
        db.clone(),
        Arc::new(ReconcileBatchProcessor::new(reconciler, Arc::clone(&metrics))),
        Duration::from_secs(config.scheduler.reconcile_interval_secs),
        config.scheduler.max_concurrent_batches,
        config.scheduler.batch_timeout(),
        Arc::clone(&metrics),
    );
    let import_scheduler = PriorityScheduler::new(
        db.clone(),
        Arc::new(ImportBatchProcessor::new(importer)),
        Duration::from_secs(config.scheduler.import_interval_secs),
        config.import.max_concurrent_files,
        config.import.queue_capacity,
        config.scheduler.batch_timeout(),
        Arc::clone(&metrics),
    );

    let handles = vec![
        tokio::spawn(reconcile_scheduler.run(shutdown_rx.clone())),
        tokio::spawn(import_scheduler.run(shutdown_rx.clone())),
        tokio::spawn(Arc::clone(&memory).run(shutdown_rx)),
    ];
    info!("Schedulers running, press Ctrl-C to stop.");

    // 7. Cooperative shutdown
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, waiting for in-flight work.");
    shutdown_tx.send(true).ok();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        journals_posted = snapshot.journals_posted,
        reconcile_success = snapshot.reconcile_success,
        reconcile_failed = snapshot.reconcile_failed,
        rows_imported = snapshot.rows_imported,
        batches_completed = snapshot.batches_completed,
        batches_failed = snapshot.batches_failed,
        "Stopped."
    );
    Ok(())
}
