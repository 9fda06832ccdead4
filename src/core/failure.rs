//! Failure classification, the circuit breaker, and the failed-reconciliation
//! audit trail.
//!
//! Errors are mapped onto a closed taxonomy so reports can group them. Typed
//! variants map directly; anything wrapped as text (database driver messages,
//! marketplace client errors) is matched on known markers in priority order.

use crate::{
    config::settings::CircuitBreakerSettings,
    entities::{FailedReconciliation, failed_reconciliation},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QueryOrder, QuerySelect, Set, prelude::*, sea_query::Expr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Purchase record missing
    PurchaseNotFound,
    /// Settlement record missing
    ShopeeOrderNotFound,
    /// Storage failure
    DatabaseError,
    /// Connectivity failure
    NetworkError,
    /// Deadline exceeded
    TimeoutError,
    /// Journal could not be written
    JournalCreationError,
    /// Journal did not balance
    JournalBalanceError,
    /// Credentials rejected
    AuthenticationError,
    /// Anything else
    UnknownError,
}

impl ErrorType {
    /// Every variant, in taxonomy order
    pub const ALL: [Self; 9] = [
        Self::PurchaseNotFound,
        Self::ShopeeOrderNotFound,
        Self::DatabaseError,
        Self::NetworkError,
        Self::TimeoutError,
        Self::JournalCreationError,
        Self::JournalBalanceError,
        Self::AuthenticationError,
        Self::UnknownError,
    ];

    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PurchaseNotFound => "purchase_not_found",
            Self::ShopeeOrderNotFound => "shopee_order_not_found",
            Self::DatabaseError => "database_error",
            Self::NetworkError => "network_error",
            Self::TimeoutError => "timeout_error",
            Self::JournalCreationError => "journal_creation_error",
            Self::JournalBalanceError => "journal_balance_error",
            Self::AuthenticationError => "authentication_error",
            Self::UnknownError => "unknown_error",
        }
    }

    /// Parses a stored value; unrecognised text becomes `UnknownError`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == value)
            .unwrap_or(Self::UnknownError)
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto the taxonomy.
#[must_use]
pub fn classify(err: &Error) -> ErrorType {
    match err {
        Error::PurchaseNotFound { .. } => ErrorType::PurchaseNotFound,
        Error::SettlementNotFound { .. } | Error::MissingJournal { .. } => {
            ErrorType::ShopeeOrderNotFound
        }
        Error::UnbalancedJournal { .. } => ErrorType::JournalBalanceError,
        Error::JournalCreation { .. } => ErrorType::JournalCreationError,
        Error::Timeout { .. } => ErrorType::TimeoutError,
        Error::Database(db_err) => match classify_message(&db_err.to_string()) {
            ErrorType::UnknownError => ErrorType::DatabaseError,
            other => other,
        },
        other => classify_message(&other.to_string()),
    }
}

/// Maps free error text onto the taxonomy by recognisable markers.
#[must_use]
pub fn classify_message(message: &str) -> ErrorType {
    let text = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

    if text.contains("not found") {
        if has(&["purchase", "pembelian", "dropship"]) {
            return ErrorType::PurchaseNotFound;
        }
        if has(&["shopee", "settlement", "escrow", "order"]) {
            return ErrorType::ShopeeOrderNotFound;
        }
    }
    if has(&["context deadline exceeded", "timeout", "timed out", "deadline"]) {
        return ErrorType::TimeoutError;
    }
    if has(&["unauthorized", "authentication", "forbidden", "invalid token", "access token"])
        || has_status_code(&text, &["401", "403"])
    {
        return ErrorType::AuthenticationError;
    }
    if has(&["balance", "unbalanced", "debit", "credit"]) && text.contains("journal") {
        return ErrorType::JournalBalanceError;
    }
    if text.contains("journal") {
        return ErrorType::JournalCreationError;
    }
    if has(&["connection refused", "connection reset", "network", "no such host", "dns", "broken pipe", "eof"]) {
        return ErrorType::NetworkError;
    }
    if has(&["database", "sql", "constraint", "deadlock", "pool timed", "locked"]) {
        return ErrorType::DatabaseError;
    }
    ErrorType::UnknownError
}

/// True when one of `codes` appears as a standalone number, not inside a
/// longer run of digits or an identifier.
fn has_status_code(text: &str, codes: &[&str]) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| codes.contains(&token))
}

/// One failed pair, as kept in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    /// Purchase order code
    pub purchase_ref: String,
    /// Settlement order code
    pub settlement_ref: Option<String>,
    /// Category
    pub error_type: ErrorType,
    /// Error text
    pub message: String,
}

/// Outcome of a bulk reconciliation run.
///
/// `total` counts attempted pairs, so `total == successful + failed` always holds;
/// pairs left unattempted after a circuit-breaker halt are listed in `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Pairs attempted
    pub total: u64,
    /// Pairs journaled (including already-journaled)
    pub successful: u64,
    /// Pairs that failed
    pub failed: u64,
    /// `failed / total * 100`, zero when nothing was attempted
    pub failure_rate: f64,
    /// Failures in attempt order
    pub failures: Vec<FailureEntry>,
    /// Purchase refs not attempted
    pub skipped: Vec<String>,
    /// Whether the circuit breaker stopped the run
    pub halted: bool,
}

impl ReconcileReport {
    /// Records a success
    pub fn record_success(&mut self) {
        self.total += 1;
        self.successful += 1;
        self.refresh_rate();
    }

    /// Records a failure
    pub fn record_failure(&mut self, entry: FailureEntry) {
        self.total += 1;
        self.failed += 1;
        self.failures.push(entry);
        self.refresh_rate();
    }

    #[allow(clippy::cast_precision_loss)]
    fn refresh_rate(&mut self) {
        self.failure_rate = if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64 * 100.0
        };
    }
}

/// Decides whether accumulated failures should stop a run.
///
/// Halts when the failure count exceeds `max_allowed_failures`, when the latest
/// error type is configured as critical, or when the failure rate exceeds
/// `failure_threshold_percent` once at least `min_attempts_for_rate` pairs ran.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn should_halt(
    report: &ReconcileReport,
    latest: Option<ErrorType>,
    config: &CircuitBreakerSettings,
) -> bool {
    if report.failed > config.max_allowed_failures {
        return true;
    }
    if latest.is_some_and(|t| config.critical_error_types.contains(&t)) {
        return true;
    }
    let attempts = report.failed + report.successful;
    if attempts == 0 || attempts < config.min_attempts_for_rate {
        return false;
    }
    let rate = report.failed as f64 / attempts as f64 * 100.0;
    rate > config.failure_threshold_percent
}

/// Fields of a failure row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailure {
    /// Purchase order code
    pub purchase_ref: String,
    /// Settlement order code
    pub settlement_ref: Option<String>,
    /// Store
    pub store: String,
    /// Batch, when running inside one
    pub batch_id: Option<i64>,
    /// Category
    pub error_type: ErrorType,
    /// Error text
    pub message: String,
}

/// Appends a failure row.
pub async fn insert_failure<C>(db: &C, failure: NewFailure) -> Result<failed_reconciliation::Model>
where
    C: ConnectionTrait,
{
    failed_reconciliation::ActiveModel {
        purchase_ref: Set(failure.purchase_ref),
        settlement_ref: Set(failure.settlement_ref),
        store: Set(failure.store),
        batch_id: Set(failure.batch_id),
        error_type: Set(failure.error_type.as_str().to_string()),
        message: Set(failure.message),
        failed_at: Set(Utc::now()),
        retried: Set(false),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Filter for failure reporting queries.
#[derive(Debug, Clone, Default)]
pub struct FailureFilter {
    /// Only this store
    pub store: Option<String>,
    /// Failed at or after
    pub since: Option<DateTimeUtc>,
    /// Failed before
    pub until: Option<DateTimeUtc>,
    /// Only rows not yet retried
    pub unretried_only: bool,
    /// Maximum rows
    pub limit: Option<u64>,
    /// Return the oldest rows first instead of the newest
    pub oldest_first: bool,
}

/// Lists failures matching a filter, newest first unless `oldest_first` is set.
/// `limit` applies after ordering.
pub async fn list_failures<C>(
    db: &C,
    filter: &FailureFilter,
) -> Result<Vec<failed_reconciliation::Model>>
where
    C: ConnectionTrait,
{
    let mut query = FailedReconciliation::find();
    if let Some(store) = &filter.store {
        query = query.filter(failed_reconciliation::Column::Store.eq(store.as_str()));
    }
    if let Some(since) = filter.since {
        query = query.filter(failed_reconciliation::Column::FailedAt.gte(since));
    }
    if let Some(until) = filter.until {
        query = query.filter(failed_reconciliation::Column::FailedAt.lt(until));
    }
    if filter.unretried_only {
        query = query.filter(failed_reconciliation::Column::Retried.eq(false));
    }
    query = if filter.oldest_first {
        query
            .order_by_asc(failed_reconciliation::Column::FailedAt)
            .order_by_asc(failed_reconciliation::Column::Id)
    } else {
        query
            .order_by_desc(failed_reconciliation::Column::FailedAt)
            .order_by_desc(failed_reconciliation::Column::Id)
    };
    if let Some(limit) = filter.limit {
        query = query.limit(limit);
    }
    query.all(db).await.map_err(Into::into)
}

/// Lists failures for a store.
pub async fn list_by_shop<C>(db: &C, store: &str) -> Result<Vec<failed_reconciliation::Model>>
where
    C: ConnectionTrait,
{
    let filter = FailureFilter {
        store: Some(store.to_string()),
        ..Default::default()
    };
    list_failures(db, &filter).await
}

/// Lists failures recorded by a batch, in insertion order.
pub async fn list_by_batch<C>(db: &C, batch_id: i64) -> Result<Vec<failed_reconciliation::Model>>
where
    C: ConnectionTrait,
{
    FailedReconciliation::find()
        .filter(failed_reconciliation::Column::BatchId.eq(batch_id))
        .order_by_asc(failed_reconciliation::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Counts failures per error type since a point in time.
pub async fn count_by_error_type_since<C>(
    db: &C,
    since: DateTimeUtc,
) -> Result<BTreeMap<ErrorType, u64>>
where
    C: ConnectionTrait,
{
    let rows: Vec<(String, i64)> = FailedReconciliation::find()
        .select_only()
        .column(failed_reconciliation::Column::ErrorType)
        .column_as(Expr::col(failed_reconciliation::Column::Id).count(), "count")
        .filter(failed_reconciliation::Column::FailedAt.gte(since))
        .group_by(failed_reconciliation::Column::ErrorType)
        .into_tuple()
        .all(db)
        .await?;

    let mut counts = BTreeMap::new();
    for (error_type, count) in rows {
        *counts.entry(ErrorType::parse(&error_type)).or_insert(0) += u64::try_from(count).unwrap_or(0);
    }
    Ok(counts)
}

/// Flags failure rows as retried, returning how many changed.
pub async fn mark_retried<C>(db: &C, ids: &[i64]) -> Result<u64>
where
    C: ConnectionTrait,
{
    if ids.is_empty() {
        return Ok(0);
    }
    let result = FailedReconciliation::update_many()
        .col_expr(failed_reconciliation::Column::Retried, Expr::value(true))
        .filter(failed_reconciliation::Column::Id.is_in(ids.iter().copied()))
        .filter(failed_reconciliation::Column::Retried.eq(false))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::test_utils::*;
    use chrono::Duration;

    fn breaker(max: u64, percent: f64) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            max_allowed_failures: max,
            failure_threshold_percent: percent,
            min_attempts_for_rate: 10,
            critical_error_types: vec![ErrorType::DatabaseError],
        }
    }

    fn report(successful: u64, failed: u64) -> ReconcileReport {
        ReconcileReport {
            total: successful + failed,
            successful,
            failed,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_typed_errors() {
        let purchase = Error::PurchaseNotFound {
            reference: "PO-1".to_string(),
        };
        let settlement = Error::SettlementNotFound {
            reference: "INV-1".to_string(),
        };
        assert_eq!(classify(&purchase), ErrorType::PurchaseNotFound);
        assert_eq!(classify(&settlement), ErrorType::ShopeeOrderNotFound);
        assert_eq!(
            classify(&Error::UnbalancedJournal { debit: 1, credit: 2 }),
            ErrorType::JournalBalanceError
        );
        assert_eq!(
            classify(&Error::Database(DbErr::Custom("disk I/O error".to_string()))),
            ErrorType::DatabaseError
        );
        assert_eq!(
            classify(&Error::Database(DbErr::Custom("context deadline exceeded".to_string()))),
            ErrorType::TimeoutError
        );
    }

    #[test]
    fn test_classify_messages_in_priority_order() {
        assert_eq!(
            classify_message("purchase record not found for invoice 123"),
            ErrorType::PurchaseNotFound
        );
        assert_eq!(
            classify_message("shopee order not found"),
            ErrorType::ShopeeOrderNotFound
        );
        assert_eq!(
            classify_message("get escrow: context deadline exceeded"),
            ErrorType::TimeoutError
        );
        assert_eq!(
            classify_message("401 Unauthorized: invalid access token"),
            ErrorType::AuthenticationError
        );
        assert_eq!(
            classify_message("journal lines are unbalanced"),
            ErrorType::JournalBalanceError
        );
        assert_eq!(
            classify_message("failed to insert journal entry"),
            ErrorType::JournalCreationError
        );
        assert_eq!(
            classify_message("dial tcp: connection refused"),
            ErrorType::NetworkError
        );
        assert_eq!(classify_message("sql: no rows"), ErrorType::DatabaseError);
        assert_eq!(
            classify_message("HTTP status 403 from escrow api"),
            ErrorType::AuthenticationError
        );
        assert_eq!(
            classify_message("invoice INV-24013 rejected"),
            ErrorType::UnknownError
        );
        assert_eq!(classify_message("batch 1401 failed"), ErrorType::UnknownError);
        assert_eq!(classify_message("something odd"), ErrorType::UnknownError);
    }

    #[test]
    fn test_error_type_parse_and_serde() {
        for t in ErrorType::ALL {
            assert_eq!(ErrorType::parse(t.as_str()), t);
        }
        assert_eq!(ErrorType::parse("??"), ErrorType::UnknownError);
        let json = serde_json::to_string(&ErrorType::ShopeeOrderNotFound).unwrap();
        assert_eq!(json, "\"shopee_order_not_found\"");
    }

    #[test]
    fn test_should_halt_on_max_failures() {
        let config = breaker(5, 10.0);
        assert!(should_halt(&report(10, 6), Some(ErrorType::PurchaseNotFound), &config));
    }

    #[test]
    fn test_should_not_halt_below_thresholds() {
        let config = breaker(5, 10.0);
        assert!(!should_halt(&report(18, 1), Some(ErrorType::PurchaseNotFound), &config));
    }

    #[test]
    fn test_should_halt_on_rate_and_critical_type() {
        let config = breaker(100, 10.0);
        assert!(should_halt(&report(16, 4), Some(ErrorType::UnknownError), &config));
        // Rate rule waits for enough attempts.
        assert!(!should_halt(&report(1, 1), Some(ErrorType::UnknownError), &config));
        assert!(should_halt(&report(50, 1), Some(ErrorType::DatabaseError), &config));
        assert!(!should_halt(&report(0, 0), None, &config));
    }

    #[test]
    fn test_report_rate() {
        let mut r = ReconcileReport::default();
        assert_eq!(r.failure_rate, 0.0);
        r.record_success();
        r.record_failure(FailureEntry {
            purchase_ref: "B".to_string(),
            settlement_ref: None,
            error_type: ErrorType::UnknownError,
            message: "x".to_string(),
        });
        r.record_success();
        r.record_success();
        assert_eq!(r.total, r.successful + r.failed);
        assert_eq!(r.failure_rate, 25.0);
    }

    #[tokio::test]
    async fn test_failure_queries() -> Result<()> {
        let db = setup_test_db().await?;
        let failure = |purchase: &str, store: &str, batch: Option<i64>, t: ErrorType| NewFailure {
            purchase_ref: purchase.to_string(),
            settlement_ref: None,
            store: store.to_string(),
            batch_id: batch,
            error_type: t,
            message: "boom".to_string(),
        };
        let a = insert_failure(&db, failure("A", "north", Some(1), ErrorType::PurchaseNotFound)).await?;
        insert_failure(&db, failure("B", "north", Some(2), ErrorType::PurchaseNotFound)).await?;
        insert_failure(&db, failure("C", "south", Some(1), ErrorType::NetworkError)).await?;

        assert_eq!(list_by_shop(&db, "north").await?.len(), 2);
        let by_batch = list_by_batch(&db, 1).await?;
        assert_eq!(
            by_batch.iter().map(|f| f.purchase_ref.as_str()).collect::<Vec<_>>(),
            vec!["A", "C"]
        );

        let since = Utc::now() - Duration::hours(1);
        let counts = count_by_error_type_since(&db, since).await?;
        assert_eq!(counts.get(&ErrorType::PurchaseNotFound), Some(&2));
        assert_eq!(counts.get(&ErrorType::NetworkError), Some(&1));
        let future = count_by_error_type_since(&db, Utc::now() + Duration::hours(1)).await?;
        assert!(future.is_empty());

        assert_eq!(mark_retried(&db, &[a.id]).await?, 1);
        assert_eq!(mark_retried(&db, &[a.id]).await?, 0);
        let open = list_failures(
            &db,
            &FailureFilter {
                store: Some("north".to_string()),
                unretried_only: true,
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].purchase_ref, "B");

        let window = list_failures(
            &db,
            &FailureFilter {
                until: Some(Utc::now() - Duration::hours(1)),
                ..Default::default()
            },
        )
        .await?;
        assert!(window.is_empty());
        Ok(())
    }
}
