//! Batch history detail entity - One unit of work inside a batch.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Batch history detail database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batch_history_details")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owning batch
    pub batch_id: i64,
    /// Item reference (purchase order code, or `row:N` for import rows)
    pub reference: String,
    /// Counterpart reference (settlement order code for reconcile items)
    pub related_reference: Option<String>,
    /// `pending`, `processing`, `success` or `failed`
    pub status: String,
    /// Failure reason for failed items
    pub error_message: Option<String>,
    /// Last status change
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between `BatchHistoryDetail` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each detail belongs to one batch
    #[sea_orm(
        belongs_to = "super::batch_history::Entity",
        from = "Column::BatchId",
        to = "super::batch_history::Column::Id"
    )]
    Batch,
}

impl Related<super::batch_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
