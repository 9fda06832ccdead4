//! Batch processors plugged into the schedulers.

use crate::{
    core::{
        batch::{self, BatchStatus, DetailStatus, process_type},
        import::Importer,
        metrics::Metrics,
        reconcile::{ReconcilePair, Reconciler},
        scheduler::BatchProcessor,
    },
    entities::batch_history,
    errors::Result,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Reconciles the pending details of a reconcile sub-batch.
pub struct ReconcileBatchProcessor {
    reconciler: Reconciler,
    metrics: Arc<Metrics>,
}

impl ReconcileBatchProcessor {
    /// Creates the processor
    #[must_use]
    pub const fn new(reconciler: Reconciler, metrics: Arc<Metrics>) -> Self {
        Self {
            reconciler,
            metrics,
        }
    }
}

#[async_trait]
impl BatchProcessor for ReconcileBatchProcessor {
    fn process_type(&self) -> &'static str {
        process_type::RECONCILE
    }

    async fn process(&self, batch: &batch_history::Model) -> Result<()> {
        let db = self.reconciler.db();
        let pairs: Vec<ReconcilePair> = batch::list_details(db, batch.id)
            .await?
            .into_iter()
            .filter(|d| d.status == DetailStatus::Pending.as_str())
            .map(|d| ReconcilePair::new(d.reference, d.related_reference.unwrap_or_default()))
            .collect();
        let store = batch.store.clone().unwrap_or_default();

        let report = self
            .reconciler
            .bulk_reconcile_with_error_handling(&pairs, &store, Some(batch.id))
            .await?;

        let failed: HashSet<&str> = report
            .failures
            .iter()
            .map(|f| f.purchase_ref.as_str())
            .chain(report.skipped.iter().map(String::as_str))
            .collect();
        let invoices: Vec<String> = pairs
            .iter()
            .filter(|p| !failed.contains(p.purchase_ref.as_str()))
            .map(|p| p.settlement_ref.clone())
            .collect();
        if !invoices.is_empty() {
            self.reconciler.update_shopee_statuses(&invoices).await?;
        }

        if report.halted {
            let message = format!(
                "circuit breaker halted after {} failures, {} skipped",
                report.failed,
                report.skipped.len()
            );
            batch::update_status(db, batch.id, BatchStatus::Failed, Some(&message)).await?;
            self.metrics.add_batches_failed(1);
        } else {
            let message = (report.failed > 0)
                .then(|| format!("{} of {} pairs failed", report.failed, report.total));
            batch::update_status(db, batch.id, BatchStatus::Completed, message.as_deref()).await?;
            self.metrics.add_batches_completed(1);
        }
        info!(
            batch_id = batch.id,
            successful = report.successful,
            failed = report.failed,
            halted = report.halted,
            "Reconcile batch finished"
        );

        if let Some(master_id) = batch.master_id {
            batch::refresh_master(db, master_id).await?;
        }
        Ok(())
    }
}

/// Imports the file referenced by an import batch.
pub struct ImportBatchProcessor {
    importer: Importer,
}

impl ImportBatchProcessor {
    /// Creates the processor
    #[must_use]
    pub const fn new(importer: Importer) -> Self {
        Self { importer }
    }
}

#[async_trait]
impl BatchProcessor for ImportBatchProcessor {
    fn process_type(&self) -> &'static str {
        process_type::IMPORT
    }

    async fn process(&self, batch: &batch_history::Model) -> Result<()> {
        self.importer.import_batch(batch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::batch::ReconcileCandidate;
    use crate::core::purchase;
    use crate::test_utils::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reconcile_processor_end_to_end() -> Result<()> {
        let db = setup_test_db().await?;
        let metrics = Arc::new(Metrics::new());
        let processor = ReconcileBatchProcessor::new(test_reconciler(&db), Arc::clone(&metrics));

        create_test_purchase(&db, "PO-1", "INV-1", 1_000).await?;
        create_test_settlement(&db, "INV-1", 1_200).await?;
        create_test_purchase(&db, "PO-2", "INV-2", 1_000).await?;
        let candidates = vec![
            ReconcileCandidate {
                purchase_ref: "PO-1".to_string(),
                settlement_ref: "INV-1".to_string(),
                store: "main".to_string(),
            },
            ReconcileCandidate {
                purchase_ref: "PO-2".to_string(),
                settlement_ref: "INV-2".to_string(),
                store: "main".to_string(),
            },
        ];
        let plan = batch::create_reconcile_batches(&db, &candidates, 50).await?;
        let sub = plan.batch_ids[0];
        assert!(batch::claim_batch(&db, sub).await?);

        processor.process(&batch::get_batch(&db, sub).await?).await?;

        let stored = batch::get_batch(&db, sub).await?;
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.done_items, 2);
        assert_eq!(stored.error_message.as_deref(), Some("1 of 2 pairs failed"));
        assert_eq!(purchase::require_purchase(&db, "PO-1").await?.status, "completed");
        assert_eq!(purchase::require_purchase(&db, "PO-2").await?.status, "pending");

        let master = batch::get_batch(&db, plan.master_id.unwrap()).await?;
        assert_eq!(master.status, "completed");
        assert_eq!(master.done_items, 2);
        assert_eq!(metrics.snapshot().batches_completed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_import_processor() -> Result<()> {
        let db = setup_test_db().await?;
        let processor = ImportBatchProcessor::new(test_importer(&db, 100));
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "order_code,invoice_code,store,sku,product_name,quantity,unit_price,shipping_fee,service_fee,total_amount"
        )?;
        writeln!(file, "PO-1,INV-1,main,SKU-1,Mug,1,100,0,0,100")?;

        let path = file.path().display().to_string();
        let created = batch::create_import_batch(&db, &path, 0).await?;
        batch::claim_batch(&db, created.id).await?;
        processor.process(&batch::get_batch(&db, created.id).await?).await?;

        assert_eq!(batch::get_batch(&db, created.id).await?.status, "completed");
        assert!(purchase::purchase_exists(&db, "PO-1").await?);
        Ok(())
    }
}
