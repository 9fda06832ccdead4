//! Reconciliation matcher - Pairs purchases with settlements and journals them.
//!
//! Single-pair calls return errors unchanged. Bulk calls isolate every pair:
//! a failure is classified, written to the failure table and counted, and the
//! loop moves on unless the circuit breaker trips.

use crate::{
    config::settings::CircuitBreakerSettings,
    core::{
        batch::{self, DetailStatus},
        failure::{self, FailureEntry, FailureFilter, NewFailure, ReconcileReport},
        ledger::{self, LedgerPoster, PostOutcome, ReturnKind, UNMATCHED, source_type},
        metrics::Metrics,
        purchase::{self, PurchaseStatus},
        settlement::{self, BUYER_REFUND_KEY},
    },
    errors::{Error, Result},
};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Detail message for pairs left unattempted after a halt
pub const SKIPPED_MESSAGE: &str = "skipped: circuit breaker halted the batch";

/// A purchase and the settlement it should match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePair {
    /// Purchase order code
    pub purchase_ref: String,
    /// Settlement order code
    pub settlement_ref: String,
}

impl ReconcilePair {
    /// Builds a pair
    pub fn new(purchase_ref: impl Into<String>, settlement_ref: impl Into<String>) -> Self {
        Self {
            purchase_ref: purchase_ref.into(),
            settlement_ref: settlement_ref.into(),
        }
    }
}

/// Outcome of a bulk purchase status refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusRefresh {
    /// Invoices whose purchase moved to `completed`
    pub completed: Vec<String>,
    /// Invoices whose purchase was already terminal
    pub already_terminal: Vec<String>,
    /// Invoices without a settlement journal yet
    pub awaiting_journal: Vec<String>,
    /// Invoices with no purchase
    pub not_found: Vec<String>,
}

/// Runs single and bulk reconciliation against one database.
#[derive(Clone)]
pub struct Reconciler {
    db: DatabaseConnection,
    poster: LedgerPoster,
    breaker: CircuitBreakerSettings,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    /// Creates a reconciler
    #[must_use]
    pub const fn new(
        db: DatabaseConnection,
        poster: LedgerPoster,
        breaker: CircuitBreakerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            poster,
            breaker,
            metrics,
        }
    }

    /// Database handle
    #[must_use]
    pub const fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Fetches both records and posts the matching journal.
    ///
    /// A settlement whose escrow carries a buyer refund is booked as a return:
    /// full when nothing was settled, partial otherwise.
    ///
    /// # Errors
    /// `PurchaseNotFound` / `SettlementNotFound` when either record is missing;
    /// any posting error unchanged.
    pub async fn match_and_journal(
        &self,
        purchase_ref: &str,
        settlement_ref: &str,
        store: &str,
    ) -> Result<PostOutcome> {
        let purchase = purchase::require_purchase(&self.db, purchase_ref).await?;
        let settlement = settlement::require_settlement(&self.db, settlement_ref).await?;

        let buyer_refund = settlement::escrow_detail(&settlement).amount_or_zero(BUYER_REFUND_KEY);
        if buyer_refund > 0 {
            let kind = if settlement.net_income <= 0 {
                ReturnKind::Full
            } else {
                ReturnKind::Partial {
                    buyer_refund,
                    supplier_refund: 0,
                }
            };
            debug!(purchase_ref, settlement_ref, buyer_refund, ?kind, "Settlement carries a refund");
            return self
                .poster
                .post_return(&self.db, &purchase, Some(&settlement), kind, store)
                .await;
        }

        self.poster.post(&self.db, &purchase, &settlement, store).await
    }

    /// Reconciles every pair, isolating failures.
    ///
    /// Failures are classified and stored; a missing settlement also appends an
    /// `unmatched` reconciled-transaction row. With `batch_id`, each pair's detail
    /// row is finalised and the batch's done count incremented. When the circuit
    /// breaker trips, the remaining pairs are reported as skipped and their
    /// details marked failed.
    ///
    /// # Errors
    /// Only when the failure itself cannot be recorded.
    pub async fn bulk_reconcile_with_error_handling(
        &self,
        pairs: &[ReconcilePair],
        store: &str,
        batch_id: Option<i64>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        info!(pairs = pairs.len(), store, ?batch_id, "Bulk reconciliation started");

        for (index, pair) in pairs.iter().enumerate() {
            let result = self
                .match_and_journal(&pair.purchase_ref, &pair.settlement_ref, store)
                .await;

            let error_type = match result {
                Ok(outcome) => {
                    debug!(purchase_ref = %pair.purchase_ref, journal_id = outcome.journal_id(), new = outcome.is_new(), "Pair reconciled");
                    report.record_success();
                    self.metrics.add_reconcile_success(1);
                    self.finish_detail(batch_id, &pair.purchase_ref, DetailStatus::Success, None)
                        .await?;
                    continue;
                }
                Err(e) => self.record_failure(&mut report, pair, store, batch_id, &e).await?,
            };

            if failure::should_halt(&report, Some(error_type), &self.breaker) {
                report.halted = true;
                let rest = &pairs[index + 1..];
                warn!(
                    failed = report.failed,
                    successful = report.successful,
                    skipped = rest.len(),
                    latest = %error_type,
                    "Circuit breaker halted bulk reconciliation"
                );
                for skipped in rest {
                    if let Some(id) = batch_id {
                        batch::update_detail_status_by_reference(
                            &self.db,
                            id,
                            &skipped.purchase_ref,
                            DetailStatus::Failed,
                            Some(SKIPPED_MESSAGE),
                        )
                        .await?;
                    }
                    report.skipped.push(skipped.purchase_ref.clone());
                }
                self.metrics.add_reconcile_skipped(rest.len() as u64);
                break;
            }
        }

        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            skipped = report.skipped.len(),
            failure_rate = report.failure_rate,
            halted = report.halted,
            "Bulk reconciliation finished"
        );
        Ok(report)
    }

    async fn record_failure(
        &self,
        report: &mut ReconcileReport,
        pair: &ReconcilePair,
        store: &str,
        batch_id: Option<i64>,
        err: &Error,
    ) -> Result<failure::ErrorType> {
        let error_type = failure::classify(err);
        let message = err.to_string();
        warn!(
            purchase_ref = %pair.purchase_ref,
            settlement_ref = %pair.settlement_ref,
            error_type = %error_type,
            error = %message,
            "Pair failed"
        );

        failure::insert_failure(
            &self.db,
            NewFailure {
                purchase_ref: pair.purchase_ref.clone(),
                settlement_ref: Some(pair.settlement_ref.clone()),
                store: store.to_string(),
                batch_id,
                error_type,
                message: message.clone(),
            },
        )
        .await?;

        if matches!(err, Error::SettlementNotFound { .. }) {
            ledger::record_reconciliation(
                &self.db,
                &pair.purchase_ref,
                Some(&pair.settlement_ref),
                UNMATCHED,
            )
            .await?;
        }

        self.finish_detail(batch_id, &pair.purchase_ref, DetailStatus::Failed, Some(&message))
            .await?;
        report.record_failure(FailureEntry {
            purchase_ref: pair.purchase_ref.clone(),
            settlement_ref: Some(pair.settlement_ref.clone()),
            error_type,
            message,
        });
        self.metrics.add_reconcile_failed(1);
        Ok(error_type)
    }

    async fn finish_detail(
        &self,
        batch_id: Option<i64>,
        reference: &str,
        status: DetailStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let Some(id) = batch_id else {
            return Ok(());
        };
        let changed =
            batch::update_detail_status_by_reference(&self.db, id, reference, status, message)
                .await?;
        if changed == 0 {
            debug!(batch_id = id, reference, "No open detail for pair, done count unchanged");
            return Ok(());
        }
        batch::update_done(&self.db, id, i64::try_from(changed).unwrap_or(i64::MAX)).await?;
        Ok(())
    }

    /// Marks a purchase completed once its settlement journal exists.
    ///
    /// Returns `false` without changes when the purchase is already terminal.
    ///
    /// # Errors
    /// `MissingJournal` when no settlement journal exists for the invoice yet.
    pub async fn check_and_mark_complete(&self, purchase_ref: &str) -> Result<bool> {
        let purchase = purchase::require_purchase(&self.db, purchase_ref).await?;
        if PurchaseStatus::parse(&purchase.status).is_terminal() {
            debug!(purchase_ref, status = %purchase.status, "Purchase already terminal");
            return Ok(false);
        }

        if ledger::find_journal_by_source(&self.db, source_type::RECONCILE, &purchase.invoice_code)
            .await?
            .is_none()
        {
            return Err(Error::MissingJournal {
                invoice: purchase.invoice_code,
            });
        }

        if !self.complete_purchase(purchase_ref).await? {
            debug!(purchase_ref, "Purchase moved on before completion");
            return Ok(false);
        }
        info!(purchase_ref, "Purchase marked completed");
        Ok(true)
    }

    /// Completes a pending purchase and its detail lines in one transaction.
    /// Returns `false` when the purchase is no longer pending.
    async fn complete_purchase(&self, order_code: &str) -> Result<bool> {
        let txn = self.db.begin().await?;
        let moved = purchase::transition_purchase_status(
            &txn,
            order_code,
            &[PurchaseStatus::Pending],
            PurchaseStatus::Completed,
        )
        .await?;
        if moved {
            purchase::update_detail_statuses(&txn, order_code, PurchaseStatus::Completed).await?;
        }
        txn.commit().await?;
        Ok(moved)
    }

    /// Refreshes purchase statuses for many invoices using bulk lookups.
    pub async fn update_shopee_statuses(&self, invoices: &[String]) -> Result<StatusRefresh> {
        let purchases = purchase::get_purchases_by_invoices(&self.db, invoices).await?;
        let journaled = ledger::posted_source_ids(&self.db, source_type::RECONCILE, invoices).await?;
        let mut refresh = StatusRefresh::default();

        for invoice in invoices {
            let Some(found) = purchases.get(invoice) else {
                refresh.not_found.push(invoice.clone());
                continue;
            };
            if PurchaseStatus::parse(&found.status).is_terminal() {
                refresh.already_terminal.push(invoice.clone());
            } else if !journaled.contains(invoice) {
                refresh.awaiting_journal.push(invoice.clone());
            } else if self.complete_purchase(&found.order_code).await? {
                refresh.completed.push(invoice.clone());
            } else {
                refresh.already_terminal.push(invoice.clone());
            }
        }

        info!(
            invoices = invoices.len(),
            completed = refresh.completed.len(),
            awaiting = refresh.awaiting_journal.len(),
            not_found = refresh.not_found.len(),
            "Purchase statuses refreshed"
        );
        Ok(refresh)
    }

    /// Re-runs un-retried failures for a store, oldest first.
    ///
    /// Each failure row is flagged as retried before the pair runs again; pairs
    /// that fail again produce new rows.
    pub async fn retry_failed(&self, store: &str, limit: u64) -> Result<ReconcileReport> {
        let failures = failure::list_failures(
            &self.db,
            &FailureFilter {
                store: Some(store.to_string()),
                unretried_only: true,
                limit: Some(limit),
                oldest_first: true,
                ..Default::default()
            },
        )
        .await?;

        let ids: Vec<i64> = failures.iter().map(|f| f.id).collect();
        failure::mark_retried(&self.db, &ids).await?;

        let mut pairs = Vec::with_capacity(failures.len());
        for failed in failures {
            let settlement_ref = match failed.settlement_ref {
                Some(reference) => reference,
                None => purchase::get_purchase_by_id(&self.db, &failed.purchase_ref)
                    .await?
                    .map(|p| p.invoice_code)
                    .unwrap_or_default(),
            };
            pairs.push(ReconcilePair::new(failed.purchase_ref, settlement_ref));
        }

        info!(store, retries = pairs.len(), "Retrying failed reconciliations");
        self.bulk_reconcile_with_error_handling(&pairs, store, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::core::batch::{BatchStatus, NewDetail, process_type};
    use crate::core::failure::ErrorType;
    use crate::entities::{JournalEntry, ReconciledTransaction, reconciled_transaction};
    use crate::test_utils::*;
    use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
    use serde_json::json;

    async fn seed_pair(db: &DatabaseConnection, n: &str) -> Result<ReconcilePair> {
        create_test_purchase(db, &format!("PO-{n}"), &format!("INV-{n}"), 1_000).await?;
        create_test_settlement(db, &format!("INV-{n}"), 1_400).await?;
        Ok(ReconcilePair::new(format!("PO-{n}"), format!("INV-{n}")))
    }

    #[tokio::test]
    async fn test_match_and_journal_missing_records() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        create_test_purchase(&db, "PO-1", "INV-1", 1_000).await?;

        assert!(matches!(
            reconciler.match_and_journal("PO-404", "INV-1", "main").await,
            Err(Error::PurchaseNotFound { .. })
        ));
        assert!(matches!(
            reconciler.match_and_journal("PO-1", "INV-1", "main").await,
            Err(Error::SettlementNotFound { .. })
        ));
        assert_eq!(JournalEntry::find().count(&db).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_match_and_journal_books_refunds_as_returns() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        create_test_purchase(&db, "PO-1", "INV-1", 1_000).await?;
        settlement::create_settlement(&db, "INV-1", "main", 500, json!({ "buyer_refund_amount": 900 }))
            .await?;

        reconciler.match_and_journal("PO-1", "INV-1", "main").await?;
        assert!(
            ledger::find_journal_by_source(&db, source_type::RETURN, "PO-1")
                .await?
                .is_some()
        );
        assert_eq!(
            purchase::require_purchase(&db, "PO-1").await?.status,
            "partially_returned"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_bulk_isolates_single_failure() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        let a = seed_pair(&db, "A").await?;
        create_test_settlement(&db, "INV-B", 900).await?;
        let b = ReconcilePair::new("PO-B", "INV-B");
        let c = seed_pair(&db, "C").await?;

        let report = reconciler
            .bulk_reconcile_with_error_handling(&[a, b, c], "main", None)
            .await?;

        assert_eq!(report.total, 3);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total, report.successful + report.failed);
        assert!((report.failure_rate - 100.0 / 3.0).abs() < 1e-9);
        assert!(!report.halted);

        let stored = failure::list_by_shop(&db, "main").await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].error_type, "purchase_not_found");
        assert_eq!(stored[0].purchase_ref, "PO-B");

        let snapshot = reconciler.metrics.snapshot();
        assert_eq!(snapshot.reconcile_success, 2);
        assert_eq!(snapshot.reconcile_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_bulk_empty_report() -> Result<()> {
        let db = setup_test_db().await?;
        let report = test_reconciler(&db)
            .bulk_reconcile_with_error_handling(&[], "main", None)
            .await?;
        assert_eq!(report.total, 0);
        assert_eq!(report.failure_rate, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_settlement_records_unmatched_row() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        create_test_purchase(&db, "PO-1", "INV-1", 1_000).await?;

        let report = reconciler
            .bulk_reconcile_with_error_handling(&[ReconcilePair::new("PO-1", "INV-1")], "main", None)
            .await?;

        assert_eq!(report.failures[0].error_type, ErrorType::ShopeeOrderNotFound);
        let unmatched = ReconciledTransaction::find()
            .filter(reconciled_transaction::Column::Status.eq(UNMATCHED))
            .count(&db)
            .await?;
        assert_eq!(unmatched, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_circuit_breaker_skips_remaining_pairs() -> Result<()> {
        let db = setup_test_db().await?;
        let mut reconciler = test_reconciler(&db);
        reconciler.breaker.max_allowed_failures = 1;

        let mut pairs = Vec::new();
        let mut details = Vec::new();
        for n in ["A", "B", "C", "D"] {
            pairs.push(ReconcilePair::new(format!("PO-{n}"), format!("INV-{n}")));
            details.push(NewDetail {
                reference: format!("PO-{n}"),
                related_reference: Some(format!("INV-{n}")),
            });
        }
        let batch = create_test_batch(&db, process_type::RECONCILE, 4).await?;
        batch::add_details(&db, batch.id, &details).await?;
        batch::claim_batch(&db, batch.id).await?;

        let report = reconciler
            .bulk_reconcile_with_error_handling(&pairs, "main", Some(batch.id))
            .await?;

        assert!(report.halted);
        assert_eq!(report.failed, 2);
        assert_eq!(report.total, 2);
        assert_eq!(report.skipped, vec!["PO-C".to_string(), "PO-D".to_string()]);
        assert_eq!(failure::list_by_batch(&db, batch.id).await?.len(), 2);

        let stored = batch::list_details(&db, batch.id).await?;
        assert!(stored.iter().all(|d| d.status == "failed"));
        assert_eq!(stored[3].error_message.as_deref(), Some(SKIPPED_MESSAGE));
        assert_eq!(batch::get_batch(&db, batch.id).await?.done_items, 2);
        assert_eq!(
            BatchStatus::parse(&batch::get_batch(&db, batch.id).await?.status),
            Some(BatchStatus::Processing)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_bulk_updates_batch_details() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        let a = seed_pair(&db, "A").await?;
        let batch = create_test_batch(&db, process_type::RECONCILE, 1).await?;
        batch::add_details(
            &db,
            batch.id,
            &[NewDetail {
                reference: a.purchase_ref.clone(),
                related_reference: Some(a.settlement_ref.clone()),
            }],
        )
        .await?;

        batch::claim_batch(&db, batch.id).await?;
        let stray = ReconcilePair::new("PO-X", "INV-X");

        let report = reconciler
            .bulk_reconcile_with_error_handling(&[a.clone(), a, stray], "main", Some(batch.id))
            .await?;
        assert_eq!(report.total, 3);

        let stored = batch::list_details(&db, batch.id).await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, "success");
        assert_eq!(JournalEntry::find().count(&db).await?, 1);

        // Repeated and unknown pairs have no open detail to finish.
        let stored_batch = batch::get_batch(&db, batch.id).await?;
        assert_eq!(stored_batch.done_items, 1);
        assert!(stored_batch.done_items <= stored_batch.total_items);
        Ok(())
    }

    #[tokio::test]
    async fn test_check_and_mark_complete() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        let pair = seed_pair(&db, "A").await?;

        assert!(matches!(
            reconciler.check_and_mark_complete("PO-A").await,
            Err(Error::MissingJournal { .. })
        ));
        assert_eq!(purchase::require_purchase(&db, "PO-A").await?.status, "pending");

        reconciler
            .match_and_journal(&pair.purchase_ref, &pair.settlement_ref, "main")
            .await?;
        assert!(reconciler.check_and_mark_complete("PO-A").await?);
        assert!(!reconciler.check_and_mark_complete("PO-A").await?);
        assert_eq!(purchase::require_purchase(&db, "PO-A").await?.status, "completed");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_shopee_statuses() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        for n in ["A", "B", "C"] {
            seed_pair(&db, n).await?;
        }
        reconciler.match_and_journal("PO-A", "INV-A", "main").await?;
        reconciler.match_and_journal("PO-C", "INV-C", "main").await?;
        purchase::update_purchase_status(&db, "PO-C", PurchaseStatus::Cancelled).await?;

        let invoices: Vec<String> = ["INV-A", "INV-B", "INV-C", "INV-Z"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let refresh = reconciler.update_shopee_statuses(&invoices).await?;

        assert_eq!(refresh.completed, vec!["INV-A".to_string()]);
        assert_eq!(refresh.awaiting_journal, vec!["INV-B".to_string()]);
        assert_eq!(refresh.already_terminal, vec!["INV-C".to_string()]);
        assert_eq!(refresh.not_found, vec!["INV-Z".to_string()]);
        assert_eq!(purchase::require_purchase(&db, "PO-C").await?.status, "cancelled");
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_failed() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        create_test_purchase(&db, "PO-1", "INV-1", 1_000).await?;
        let pairs = [ReconcilePair::new("PO-1", "INV-1")];
        reconciler
            .bulk_reconcile_with_error_handling(&pairs, "main", None)
            .await?;

        create_test_settlement(&db, "INV-1", 1_300).await?;
        let report = reconciler.retry_failed("main", 10).await?;
        assert_eq!(report.successful, 1);

        let all = failure::list_by_shop(&db, "main").await?;
        assert_eq!(all.len(), 1);
        assert!(all[0].retried);
        assert_eq!(reconciler.retry_failed("main", 10).await?.total, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_failed_takes_oldest_within_limit() -> Result<()> {
        let db = setup_test_db().await?;
        let reconciler = test_reconciler(&db);
        let pairs: Vec<ReconcilePair> = ["1", "2", "3"]
            .iter()
            .map(|n| ReconcilePair::new(format!("PO-{n}"), format!("INV-{n}")))
            .collect();
        reconciler
            .bulk_reconcile_with_error_handling(&pairs, "main", None)
            .await?;

        let report = reconciler.retry_failed("main", 2).await?;
        assert_eq!(report.total, 2);
        let retried: Vec<String> = report.failures.iter().map(|f| f.purchase_ref.clone()).collect();
        assert_eq!(retried, vec!["PO-1".to_string(), "PO-2".to_string()]);

        let open = failure::list_failures(
            &db,
            &FailureFilter {
                store: Some("main".to_string()),
                unretried_only: true,
                oldest_first: true,
                ..Default::default()
            },
        )
        .await?;
        // PO-3 from the first run, then the two fresh failures of the retry.
        let refs: Vec<&str> = open.iter().map(|f| f.purchase_ref.as_str()).collect();
        assert_eq!(refs, vec!["PO-3", "PO-1", "PO-2"]);
        Ok(())
    }
}
