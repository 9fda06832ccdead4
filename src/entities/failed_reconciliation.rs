//! Failed reconciliation entity - Append-only audit trail of item failures.
//!
//! Independent of batch details so failures stay queryable after batches are
//! pruned, and so manual retries can be tracked with the `retried` flag.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Failed reconciliation database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "failed_reconciliations")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Purchase order code of the failed pair
    pub purchase_ref: String,
    /// Settlement order code of the failed pair, if known
    pub settlement_ref: Option<String>,
    /// Store the pair belongs to
    pub store: String,
    /// Batch the failure happened in, if any
    pub batch_id: Option<i64>,
    /// Taxonomy tag, see `core::failure::ErrorType`
    pub error_type: String,
    /// Error text
    pub message: String,
    /// When the failure was recorded
    pub failed_at: DateTimeUtc,
    /// Whether a retry has been issued for this row
    pub retried: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
