//! Unified error type for the reconciliation engine.
//!
//! Business failures are explicit variants so the failure classifier can map them
//! onto the reporting taxonomy without string matching; infrastructure errors wrap
//! their source via `#[from]`.

use thiserror::Error;

/// Errors produced by the reconciliation, batch and import layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Config {
        /// What went wrong
        message: String,
    },

    /// Storage layer failure
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// File system or stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited file could not be read
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// No purchase record exists for the given reference
    #[error("purchase not found: {reference}")]
    PurchaseNotFound {
        /// Order code or invoice code that was looked up
        reference: String,
    },

    /// No settlement exists for the given marketplace order
    #[error("shopee order not found: settlement {reference}")]
    SettlementNotFound {
        /// Marketplace order code that was looked up
        reference: String,
    },

    /// Debit and credit totals differ
    #[error("journal balance error: debit {debit} != credit {credit}")]
    UnbalancedJournal {
        /// Sum of debit lines
        debit: i64,
        /// Sum of credit lines
        credit: i64,
    },

    /// Journal could not be built or written
    #[error("journal creation error: {message}")]
    JournalCreation {
        /// Reason
        message: String,
    },

    /// No settlement journal has been posted for the invoice yet
    #[error("settlement journal not found for invoice {invoice}")]
    MissingJournal {
        /// Marketplace invoice / settlement order code
        invoice: String,
    },

    /// A status change would regress or skip the lifecycle
    #[error("invalid status transition for {entity} {id}: {from} -> {to}")]
    InvalidStatusTransition {
        /// Table or record kind
        entity: &'static str,
        /// Record identifier
        id: String,
        /// Status currently stored
        from: String,
        /// Requested status
        to: String,
    },

    /// Referenced batch does not exist
    #[error("batch not found: {id}")]
    BatchNotFound {
        /// Batch id
        id: i64,
    },

    /// Import file exceeds the configured maximum size
    #[error("file {name} is {size} bytes, limit is {limit}")]
    FileTooLarge {
        /// File name
        name: String,
        /// Actual size in bytes
        size: u64,
        /// Configured limit in bytes
        limit: u64,
    },

    /// Import header is missing required columns
    #[error("invalid header, missing columns: {missing:?}")]
    InvalidHeader {
        /// Required columns not present in the header
        missing: Vec<String>,
    },

    /// Memory stayed above the high-pressure threshold for too long
    #[error("memory pressure {pressure:.2} did not drop below {threshold:.2} within {waited_secs}s")]
    MemoryPressure {
        /// Last observed pressure ratio
        pressure: f64,
        /// Threshold that had to be crossed
        threshold: f64,
        /// Seconds spent waiting
        waited_secs: u64,
    },

    /// Import stopped after a chunk because shutdown was requested
    #[error("import batch {batch_id} interrupted at chunk {chunk}")]
    Interrupted {
        /// Batch being imported
        batch_id: i64,
        /// Last chunk processed
        chunk: u64,
    },

    /// Blocking or spawned task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Operation exceeded its deadline
    #[error("timeout: {operation} exceeded its deadline")]
    Timeout {
        /// What timed out
        operation: String,
    },
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true when the underlying storage rejected a write because of a
    /// uniqueness constraint.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Database(err)
                if matches!(err.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_)))
        )
    }
}
