//! Shared test utilities for the reconciliation engine.
//!
//! This module provides helpers for setting up in-memory test databases and
//! creating purchases, settlements, batches and wired components with sensible
//! defaults.

use crate::{
    config::settings::{AccountMap, CircuitBreakerSettings, ImportSettings, MemorySettings},
    core::{
        batch::{self, NewBatch},
        import::Importer,
        ledger::LedgerPoster,
        memory::{MemoryMonitor, MemorySampler},
        metrics::Metrics,
        purchase::{self, NewPurchase},
        reconcile::Reconciler,
        settlement,
    },
    entities,
    errors::Result,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Creates a pending purchase.
///
/// # Defaults
/// * `store`: "main"
/// * `shipping_fee`, `service_fee`: 0
/// * `ordered_at`: None
pub async fn create_test_purchase(
    db: &DatabaseConnection,
    order_code: &str,
    invoice_code: &str,
    total_amount: i64,
) -> Result<entities::purchase::Model> {
    purchase::create_purchase(
        db,
        NewPurchase {
            order_code: order_code.to_string(),
            invoice_code: invoice_code.to_string(),
            store: "main".to_string(),
            total_amount,
            shipping_fee: 0,
            service_fee: 0,
            ordered_at: None,
        },
    )
    .await
}

/// Creates a settlement for store "main" with an empty escrow payload.
pub async fn create_test_settlement(
    db: &DatabaseConnection,
    order_code: &str,
    net_income: i64,
) -> Result<entities::settlement::Model> {
    settlement::create_settlement(db, order_code, "main", net_income, serde_json::json!({})).await
}

/// Creates a pending batch with no details.
pub async fn create_test_batch(
    db: &DatabaseConnection,
    process_type: &str,
    total_items: i64,
) -> Result<entities::batch_history::Model> {
    batch::create_batch(
        db,
        NewBatch {
            process_type: process_type.to_string(),
            store: Some("main".to_string()),
            total_items,
            ..Default::default()
        },
    )
    .await
}

/// Ledger poster with default accounts and its own metrics.
pub fn test_poster() -> LedgerPoster {
    LedgerPoster::new(AccountMap::default(), Arc::new(Metrics::new()))
}

/// Reconciler with default accounts and circuit breaker.
pub fn test_reconciler(db: &DatabaseConnection) -> Reconciler {
    let metrics = Arc::new(Metrics::new());
    Reconciler::new(
        db.clone(),
        LedgerPoster::new(AccountMap::default(), Arc::clone(&metrics)),
        CircuitBreakerSettings::default(),
        metrics,
    )
}

/// Importer with the given chunk size and a memory monitor that reports no
/// pressure.
pub fn test_importer(db: &DatabaseConnection, chunk_size: usize) -> Importer {
    let metrics = Arc::new(Metrics::new());
    let memory = MemoryMonitor::new(
        Arc::new(StaticSampler::new(0)),
        MemorySettings::default(),
        Arc::clone(&metrics),
    );
    Importer::new(
        db.clone(),
        ImportSettings {
            chunk_size,
            ..Default::default()
        },
        Arc::new(memory),
        metrics,
    )
}

/// Memory sampler returning whatever the test last set.
#[derive(Debug)]
pub struct StaticSampler {
    used: AtomicU64,
    available: AtomicBool,
}

impl StaticSampler {
    /// Sampler reporting `used` bytes
    pub const fn new(used: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
            available: AtomicBool::new(true),
        }
    }

    /// Changes the reported usage
    pub fn set(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
    }

    /// Makes the sampler report no reading
    pub fn clear(&self) {
        self.available.store(false, Ordering::SeqCst);
    }
}

impl MemorySampler for StaticSampler {
    fn used_bytes(&self) -> Option<u64> {
        self.available
            .load(Ordering::SeqCst)
            .then(|| self.used.load(Ordering::SeqCst))
    }
}
