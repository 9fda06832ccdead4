//! Batch lifecycle - Tracked units of work and their per-item details.
//!
//! Status changes are conditional updates (`... WHERE status IN (allowed)`), so a
//! terminal status can never be regressed and two workers can never both claim
//! the same pending batch. Done counts only move through an atomic
//! `done_items = done_items + n` statement.

use crate::{
    entities::{BatchHistory, BatchHistoryDetail, batch_history, batch_history_detail},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Process-type tags used by schedulers to discover work.
pub mod process_type {
    /// Reconciliation sub-batch
    pub const RECONCILE: &str = "reconcile";
    /// File import
    pub const IMPORT: &str = "import";
    /// Parent of a set of reconciliation sub-batches; never processed directly
    pub const RECONCILE_MASTER: &str = "reconcile_master";
}

/// Lifecycle of a batch: `pending -> processing -> completed | failed`, and
/// `pending -> failed` for work rejected before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    /// Waiting for a scheduler
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl BatchStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored value
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Completed or failed
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses from which `self` may be entered.
    #[must_use]
    pub const fn allowed_from(self) -> &'static [Self] {
        match self {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Completed => &[Self::Processing],
            Self::Failed => &[Self::Pending, Self::Processing],
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one detail row. Terminal values are never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailStatus {
    /// Not attempted yet
    Pending,
    /// In progress
    Processing,
    /// Done
    Success,
    /// Failed or skipped, see the error message
    Failed,
}

impl DetailStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Statuses from which `self` may be entered
    #[must_use]
    pub const fn allowed_from(self) -> &'static [Self] {
        match self {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Success | Self::Failed => &[Self::Pending, Self::Processing],
        }
    }
}

fn status_strings<S: Copy>(statuses: &[S], as_str: fn(S) -> &'static str) -> Vec<&'static str> {
    statuses.iter().map(|s| as_str(*s)).collect()
}

/// Fields of a new batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBatch {
    /// Process-type tag
    pub process_type: String,
    /// Store the batch belongs to
    pub store: Option<String>,
    /// Parent batch
    pub master_id: Option<i64>,
    /// Number of work items
    pub total_items: i64,
    /// Path of the file to import
    pub file_ref: Option<String>,
    /// Size of that file in bytes
    pub file_size: Option<i64>,
}

/// One unit of work inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDetail {
    /// Primary reference, e.g. a purchase order code or `row:N`
    pub reference: String,
    /// Secondary reference, e.g. the settlement order code
    pub related_reference: Option<String>,
}

/// Creates a batch in `pending` status.
pub async fn create_batch<C>(db: &C, new: NewBatch) -> Result<batch_history::Model>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let model = batch_history::ActiveModel {
        process_type: Set(new.process_type),
        store: Set(new.store),
        master_id: Set(new.master_id),
        total_items: Set(new.total_items),
        done_items: Set(0),
        status: Set(BatchStatus::Pending.as_str().to_string()),
        error_message: Set(None),
        file_ref: Set(new.file_ref),
        file_size: Set(new.file_size),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    debug!(batch_id = model.id, process_type = %model.process_type, total = model.total_items, "Batch created");
    Ok(model)
}

/// Adds pending detail rows to a batch, returning how many were written.
pub async fn add_details<C>(db: &C, batch_id: i64, details: &[NewDetail]) -> Result<u64>
where
    C: ConnectionTrait,
{
    if details.is_empty() {
        return Ok(0);
    }
    let now = Utc::now();
    let rows = details.iter().map(|d| batch_history_detail::ActiveModel {
        batch_id: Set(batch_id),
        reference: Set(d.reference.clone()),
        related_reference: Set(d.related_reference.clone()),
        status: Set(DetailStatus::Pending.as_str().to_string()),
        error_message: Set(None),
        updated_at: Set(now),
        ..Default::default()
    });
    BatchHistoryDetail::insert_many(rows).exec(db).await?;
    Ok(details.len() as u64)
}

/// Adds a single detail row in its final status. Used for work discovered
/// while processing, such as malformed import rows.
pub async fn record_detail<C>(
    db: &C,
    batch_id: i64,
    detail: NewDetail,
    status: DetailStatus,
    error_message: Option<String>,
) -> Result<batch_history_detail::Model>
where
    C: ConnectionTrait,
{
    batch_history_detail::ActiveModel {
        batch_id: Set(batch_id),
        reference: Set(detail.reference),
        related_reference: Set(detail.related_reference),
        status: Set(status.as_str().to_string()),
        error_message: Set(error_message),
        updated_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Creates a batch and its details in one transaction.
pub async fn create_batch_with_details(
    db: &DatabaseConnection,
    new: NewBatch,
    details: &[NewDetail],
) -> Result<batch_history::Model> {
    let txn = db.begin().await?;
    let batch = create_batch(&txn, new).await?;
    add_details(&txn, batch.id, details).await?;
    txn.commit().await?;
    Ok(batch)
}

/// Fetches a batch, failing with `BatchNotFound`.
pub async fn get_batch<C>(db: &C, id: i64) -> Result<batch_history::Model>
where
    C: ConnectionTrait,
{
    BatchHistory::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::BatchNotFound { id })
}

/// Moves a batch to `to`, optionally recording a message.
///
/// # Errors
/// `InvalidStatusTransition` when the stored status does not allow the change,
/// including re-entering the current status; `BatchNotFound` for unknown ids.
pub async fn update_status<C>(
    db: &C,
    id: i64,
    to: BatchStatus,
    message: Option<&str>,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let mut update = BatchHistory::update_many()
        .col_expr(batch_history::Column::Status, Expr::value(to.as_str()))
        .col_expr(batch_history::Column::UpdatedAt, Expr::value(Utc::now()));
    if let Some(message) = message {
        update = update.col_expr(batch_history::Column::ErrorMessage, Expr::value(message));
    }
    let result = update
        .filter(batch_history::Column::Id.eq(id))
        .filter(
            batch_history::Column::Status
                .is_in(status_strings(to.allowed_from(), BatchStatus::as_str)),
        )
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        let current = get_batch(db, id).await?;
        return Err(Error::InvalidStatusTransition {
            entity: "batch",
            id: id.to_string(),
            from: current.status,
            to: to.as_str().to_string(),
        });
    }
    debug!(batch_id = id, status = %to, "Batch status updated");
    Ok(())
}

/// Claims a pending batch for processing. Returns false when another worker
/// got there first or the batch is no longer pending.
pub async fn claim_batch<C>(db: &C, id: i64) -> Result<bool>
where
    C: ConnectionTrait,
{
    match update_status(db, id, BatchStatus::Processing, None).await {
        Ok(()) => Ok(true),
        Err(Error::InvalidStatusTransition { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Atomically adds `n` to a batch's done count and returns the new count. The
/// parent batch, if any, is incremented by the same amount.
pub async fn update_done<C>(db: &C, id: i64, n: i64) -> Result<i64>
where
    C: ConnectionTrait,
{
    let batch = get_batch(db, id).await?;
    increment_done(db, id, n).await?;
    if let Some(master_id) = batch.master_id {
        increment_done(db, master_id, n).await?;
    }
    Ok(get_batch(db, id).await?.done_items)
}

async fn increment_done<C>(db: &C, id: i64, n: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    let result = BatchHistory::update_many()
        .col_expr(
            batch_history::Column::DoneItems,
            Expr::col(batch_history::Column::DoneItems).add(n),
        )
        .col_expr(batch_history::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(batch_history::Column::Id.eq(id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(Error::BatchNotFound { id });
    }
    Ok(())
}

/// Sets a batch's item total once it is known, as for streamed imports.
pub async fn set_total_items<C>(db: &C, id: i64, total: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    let result = BatchHistory::update_many()
        .col_expr(batch_history::Column::TotalItems, Expr::value(total))
        .col_expr(batch_history::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(batch_history::Column::Id.eq(id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(Error::BatchNotFound { id });
    }
    Ok(())
}

/// Moves a detail row to `to`.
///
/// # Errors
/// `InvalidStatusTransition` when the detail is already terminal or missing.
pub async fn update_detail_status<C>(
    db: &C,
    detail_id: i64,
    to: DetailStatus,
    error_message: Option<&str>,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let result = detail_update(to, error_message)
        .filter(batch_history_detail::Column::Id.eq(detail_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        let from = BatchHistoryDetail::find_by_id(detail_id)
            .one(db)
            .await?
            .map_or_else(|| "missing".to_string(), |d| d.status);
        return Err(Error::InvalidStatusTransition {
            entity: "batch detail",
            id: detail_id.to_string(),
            from,
            to: to.as_str().to_string(),
        });
    }
    Ok(())
}

/// Moves the non-terminal details of a batch carrying `reference` to `to`,
/// returning how many changed.
pub async fn update_detail_status_by_reference<C>(
    db: &C,
    batch_id: i64,
    reference: &str,
    to: DetailStatus,
    error_message: Option<&str>,
) -> Result<u64>
where
    C: ConnectionTrait,
{
    let result = detail_update(to, error_message)
        .filter(batch_history_detail::Column::BatchId.eq(batch_id))
        .filter(batch_history_detail::Column::Reference.eq(reference))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

fn detail_update(
    to: DetailStatus,
    error_message: Option<&str>,
) -> sea_orm::UpdateMany<BatchHistoryDetail> {
    let mut update = BatchHistoryDetail::update_many()
        .col_expr(batch_history_detail::Column::Status, Expr::value(to.as_str()))
        .col_expr(batch_history_detail::Column::UpdatedAt, Expr::value(Utc::now()));
    if let Some(message) = error_message {
        update = update.col_expr(
            batch_history_detail::Column::ErrorMessage,
            Expr::value(message),
        );
    }
    update.filter(
        batch_history_detail::Column::Status
            .is_in(status_strings(to.allowed_from(), DetailStatus::as_str)),
    )
}

/// Lists pending batches of one process type, oldest first.
pub async fn list_pending_by_type<C>(db: &C, process_type: &str) -> Result<Vec<batch_history::Model>>
where
    C: ConnectionTrait,
{
    BatchHistory::find()
        .filter(batch_history::Column::ProcessType.eq(process_type))
        .filter(batch_history::Column::Status.eq(BatchStatus::Pending.as_str()))
        .order_by_asc(batch_history::Column::CreatedAt)
        .order_by_asc(batch_history::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Lists the details of a batch in insertion order.
pub async fn list_details<C>(db: &C, batch_id: i64) -> Result<Vec<batch_history_detail::Model>>
where
    C: ConnectionTrait,
{
    BatchHistoryDetail::find()
        .filter(batch_history_detail::Column::BatchId.eq(batch_id))
        .order_by_asc(batch_history_detail::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Lists the sub-batches of a master batch.
pub async fn list_sub_batches<C>(db: &C, master_id: i64) -> Result<Vec<batch_history::Model>>
where
    C: ConnectionTrait,
{
    BatchHistory::find()
        .filter(batch_history::Column::MasterId.eq(master_id))
        .order_by_asc(batch_history::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// A purchase/settlement pair waiting to be reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileCandidate {
    /// Purchase order code
    pub purchase_ref: String,
    /// Settlement order code
    pub settlement_ref: String,
    /// Store both belong to
    pub store: String,
}

/// Batches created for a set of reconcile candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileBatchPlan {
    /// Parent batch tracking the whole set; `None` when there was nothing to do
    pub master_id: Option<i64>,
    /// Sub-batches, grouped by store and capped at the sub-batch size
    pub batch_ids: Vec<i64>,
}

/// Groups candidates by store, slices each group into sub-batches of at most
/// `sub_batch_size` items, and creates the master and sub-batches in one
/// transaction.
pub async fn create_reconcile_batches(
    db: &DatabaseConnection,
    candidates: &[ReconcileCandidate],
    sub_batch_size: usize,
) -> Result<ReconcileBatchPlan> {
    if candidates.is_empty() {
        return Ok(ReconcileBatchPlan {
            master_id: None,
            batch_ids: Vec::new(),
        });
    }
    let size = sub_batch_size.max(1);

    let mut by_store: BTreeMap<&str, Vec<&ReconcileCandidate>> = BTreeMap::new();
    for candidate in candidates {
        by_store.entry(&candidate.store).or_default().push(candidate);
    }

    let txn = db.begin().await?;
    let master = create_batch(
        &txn,
        NewBatch {
            process_type: process_type::RECONCILE_MASTER.to_string(),
            total_items: i64::try_from(candidates.len()).unwrap_or(i64::MAX),
            ..Default::default()
        },
    )
    .await?;

    let mut batch_ids = Vec::new();
    for (store, group) in by_store {
        for slice in group.chunks(size) {
            let batch = create_batch(
                &txn,
                NewBatch {
                    process_type: process_type::RECONCILE.to_string(),
                    store: Some(store.to_string()),
                    master_id: Some(master.id),
                    total_items: i64::try_from(slice.len()).unwrap_or(i64::MAX),
                    ..Default::default()
                },
            )
            .await?;
            let details: Vec<NewDetail> = slice
                .iter()
                .map(|c| NewDetail {
                    reference: c.purchase_ref.clone(),
                    related_reference: Some(c.settlement_ref.clone()),
                })
                .collect();
            add_details(&txn, batch.id, &details).await?;
            batch_ids.push(batch.id);
        }
    }
    txn.commit().await?;

    info!(
        master_id = master.id,
        sub_batches = batch_ids.len(),
        items = candidates.len(),
        "Reconcile batches created"
    );
    Ok(ReconcileBatchPlan {
        master_id: Some(master.id),
        batch_ids,
    })
}

/// Rolls sub-batch statuses up into their master: `processing` once any
/// sub-batch has started, then `completed` when every sub-batch completed or
/// `failed` when all finished and at least one failed.
pub async fn refresh_master<C>(db: &C, master_id: i64) -> Result<BatchStatus>
where
    C: ConnectionTrait,
{
    let children = list_sub_batches(db, master_id).await?;
    let statuses: Vec<BatchStatus> = children
        .iter()
        .filter_map(|c| BatchStatus::parse(&c.status))
        .collect();

    let started = statuses.iter().any(|s| *s != BatchStatus::Pending);
    let finished = !statuses.is_empty() && statuses.iter().all(|s| s.is_terminal());

    if started {
        // A concurrent refresh may have moved it already.
        claim_batch(db, master_id).await?;
    }
    if finished {
        let failed = statuses.iter().filter(|s| **s == BatchStatus::Failed).count();
        let (to, message) = if failed == 0 {
            (BatchStatus::Completed, None)
        } else {
            (
                BatchStatus::Failed,
                Some(format!("{failed} of {} sub-batches failed", statuses.len())),
            )
        };
        match update_status(db, master_id, to, message.as_deref()).await {
            Ok(()) | Err(Error::InvalidStatusTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    let master = get_batch(db, master_id).await?;
    Ok(BatchStatus::parse(&master.status).unwrap_or(BatchStatus::Pending))
}

/// Creates a pending import batch for a file.
pub async fn create_import_batch<C>(
    db: &C,
    file_ref: &str,
    file_size: u64,
) -> Result<batch_history::Model>
where
    C: ConnectionTrait,
{
    create_batch(
        db,
        NewBatch {
            process_type: process_type::IMPORT.to_string(),
            file_ref: Some(file_ref.to_string()),
            file_size: Some(i64::try_from(file_size).unwrap_or(i64::MAX)),
            ..Default::default()
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;

    fn candidate(purchase: &str, store: &str) -> ReconcileCandidate {
        ReconcileCandidate {
            purchase_ref: purchase.to_string(),
            settlement_ref: format!("S-{purchase}"),
            store: store.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_batch_and_details() -> Result<()> {
        let db = setup_test_db().await?;
        let details = vec![
            NewDetail {
                reference: "PO-1".to_string(),
                related_reference: Some("INV-1".to_string()),
            },
            NewDetail {
                reference: "PO-2".to_string(),
                related_reference: None,
            },
        ];
        let batch = create_batch_with_details(
            &db,
            NewBatch {
                process_type: process_type::RECONCILE.to_string(),
                total_items: 2,
                ..Default::default()
            },
            &details,
        )
        .await?;

        assert_eq!(batch.status, "pending");
        assert_eq!(batch.done_items, 0);
        let stored = list_details(&db, batch.id).await?;
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|d| d.status == "pending"));
        assert_eq!(stored[0].related_reference.as_deref(), Some("INV-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_status_transitions_are_monotonic() -> Result<()> {
        let db = setup_test_db().await?;
        let batch = create_test_batch(&db, process_type::IMPORT, 1).await?;

        assert!(matches!(
            update_status(&db, batch.id, BatchStatus::Completed, None).await,
            Err(Error::InvalidStatusTransition { .. })
        ));
        assert!(claim_batch(&db, batch.id).await?);
        assert!(!claim_batch(&db, batch.id).await?);
        update_status(&db, batch.id, BatchStatus::Completed, None).await?;

        for to in [BatchStatus::Pending, BatchStatus::Processing, BatchStatus::Failed] {
            assert!(matches!(
                update_status(&db, batch.id, to, Some("late")).await,
                Err(Error::InvalidStatusTransition { .. })
            ));
        }
        let stored = get_batch(&db, batch.id).await?;
        assert_eq!(stored.status, "completed");
        assert!(stored.error_message.is_none());

        assert!(matches!(
            update_status(&db, 999, BatchStatus::Failed, None).await,
            Err(Error::BatchNotFound { id: 999 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_batch_can_fail_directly() -> Result<()> {
        let db = setup_test_db().await?;
        let batch = create_test_batch(&db, process_type::IMPORT, 1).await?;
        update_status(&db, batch.id, BatchStatus::Failed, Some("file too large")).await?;
        let stored = get_batch(&db, batch.id).await?;
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.error_message.as_deref(), Some("file too large"));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_done_increments() -> Result<()> {
        let db = setup_test_db().await?;
        let batch = create_test_batch(&db, process_type::RECONCILE, 40).await?;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..40 {
            let db = db.clone();
            tasks.spawn(async move { update_done(&db, batch.id, 1).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap()?;
        }
        assert_eq!(get_batch(&db, batch.id).await?.done_items, 40);
        Ok(())
    }

    #[tokio::test]
    async fn test_detail_status_is_final_once_terminal() -> Result<()> {
        let db = setup_test_db().await?;
        let batch = create_test_batch(&db, process_type::RECONCILE, 1).await?;
        add_details(
            &db,
            batch.id,
            &[NewDetail {
                reference: "PO-1".to_string(),
                related_reference: None,
            }],
        )
        .await?;
        let detail = list_details(&db, batch.id).await?.remove(0);

        update_detail_status(&db, detail.id, DetailStatus::Failed, Some("boom")).await?;
        assert!(matches!(
            update_detail_status(&db, detail.id, DetailStatus::Success, None).await,
            Err(Error::InvalidStatusTransition { .. })
        ));
        let changed =
            update_detail_status_by_reference(&db, batch.id, "PO-1", DetailStatus::Success, None)
                .await?;
        assert_eq!(changed, 0);

        let stored = list_details(&db, batch.id).await?.remove(0);
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_pending_by_type() -> Result<()> {
        let db = setup_test_db().await?;
        let a = create_test_batch(&db, process_type::RECONCILE, 1).await?;
        let b = create_test_batch(&db, process_type::IMPORT, 1).await?;
        let c = create_test_batch(&db, process_type::RECONCILE, 1).await?;
        claim_batch(&db, c.id).await?;

        let pending = list_pending_by_type(&db, process_type::RECONCILE).await?;
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), vec![a.id]);
        let imports = list_pending_by_type(&db, process_type::IMPORT).await?;
        assert_eq!(imports[0].id, b.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_batches_grouped_by_store_and_sliced() -> Result<()> {
        let db = setup_test_db().await?;
        let mut candidates = Vec::new();
        for i in 0..5 {
            candidates.push(candidate(&format!("N{i}"), "north"));
        }
        for i in 0..2 {
            candidates.push(candidate(&format!("S{i}"), "south"));
        }

        let plan = create_reconcile_batches(&db, &candidates, 2).await?;
        // north: 2+2+1, south: 2
        assert_eq!(plan.batch_ids.len(), 4);
        let master_id = plan.master_id.unwrap();
        let master = get_batch(&db, master_id).await?;
        assert_eq!(master.process_type, process_type::RECONCILE_MASTER);
        assert_eq!(master.total_items, 7);

        let subs = list_sub_batches(&db, master_id).await?;
        assert!(subs.iter().all(|b| b.total_items <= 2));
        for sub in &subs {
            let details = list_details(&db, sub.id).await?;
            assert_eq!(details.len() as i64, sub.total_items);
            let store = sub.store.clone().unwrap();
            assert!(details.iter().all(|d| d.reference.starts_with(if store == "north" { 'N' } else { 'S' })));
        }

        let pending = list_pending_by_type(&db, process_type::RECONCILE).await?;
        assert_eq!(pending.len(), 4);

        let empty = create_reconcile_batches(&db, &[], 50).await?;
        assert!(empty.master_id.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_master_rolls_up() -> Result<()> {
        let db = setup_test_db().await?;
        let candidates = vec![candidate("A", "north"), candidate("B", "south")];
        let plan = create_reconcile_batches(&db, &candidates, 50).await?;
        let master_id = plan.master_id.unwrap();
        let (first, second) = (plan.batch_ids[0], plan.batch_ids[1]);

        assert_eq!(refresh_master(&db, master_id).await?, BatchStatus::Pending);

        claim_batch(&db, first).await?;
        update_done(&db, first, 1).await?;
        update_status(&db, first, BatchStatus::Completed, None).await?;
        assert_eq!(refresh_master(&db, master_id).await?, BatchStatus::Processing);

        update_status(&db, second, BatchStatus::Failed, Some("halted")).await?;
        assert_eq!(refresh_master(&db, master_id).await?, BatchStatus::Failed);
        // Idempotent once terminal.
        assert_eq!(refresh_master(&db, master_id).await?, BatchStatus::Failed);

        let master = get_batch(&db, master_id).await?;
        assert_eq!(master.done_items, 1);
        assert_eq!(master.error_message.as_deref(), Some("1 of 2 sub-batches failed"));
        Ok(())
    }
}
