//! Reconciled transaction entity - Append-only history of pairing attempts.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Reconciled transaction database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reconciled_transactions")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Purchase order code
    pub purchase_ref: String,
    /// Settlement order code, `None` when unmatched
    pub settlement_ref: Option<String>,
    /// `"matched"` or `"unmatched"`
    pub status: String,
    /// When the pairing attempt happened
    pub matched_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
