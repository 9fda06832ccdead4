//! Batch history entity - A bounded unit of tracked work.
//!
//! Created by whichever pipeline enqueues work and mutated only by the worker
//! that claimed it. `done_items` is only ever changed through an atomic
//! `done_items = done_items + n` update.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Batch history database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batch_history")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Pipeline tag (`"reconcile"`, `"import"`, `"reconcile_master"`)
    pub process_type: String,
    /// Store the batch belongs to, when grouped by store
    pub store: Option<String>,
    /// Parent batch when this is a sub-batch of a larger request
    pub master_id: Option<i64>,
    /// Number of work items
    pub total_items: i64,
    /// Number of items that reached a terminal state
    pub done_items: i64,
    /// `pending`, `processing`, `completed` or `failed`
    pub status: String,
    /// Human-readable failure summary
    pub error_message: Option<String>,
    /// File reference for import batches
    pub file_ref: Option<String>,
    /// File size in bytes for import batches
    pub file_size: Option<i64>,
    /// Submission time
    pub created_at: DateTimeUtc,
    /// Last status or progress change
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between `BatchHistory` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One batch has many detail rows
    #[sea_orm(has_many = "super::batch_history_detail::Entity")]
    Details,
}

impl Related<super::batch_history_detail::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Details.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
