//! Journal entry entity - Header of one double-entry posting.
//!
//! `(source_type, source_id)` is unique; see `config::database::create_tables`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Journal entry database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "journal_entries")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Accounting date of the entry
    pub entry_date: DateTimeUtc,
    /// Human-readable description
    pub description: String,
    /// Kind of source record (`"reconcile"`, `"return"`, `"topup"`, ...)
    pub source_type: String,
    /// External identifier of the source record
    pub source_id: String,
    /// Store the entry is attributed to
    pub store: String,
    /// Row creation time
    pub created_at: DateTimeUtc,
}

/// Defines relationships between `JournalEntry` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One entry owns many lines
    #[sea_orm(has_many = "super::journal_line::Entity")]
    Lines,
}

impl Related<super::journal_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
