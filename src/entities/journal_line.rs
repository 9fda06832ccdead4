//! Journal line entity - One debit or credit of a journal entry.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Journal line database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "journal_lines")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owning journal entry
    pub journal_id: i64,
    /// Chart-of-accounts code
    pub account_code: String,
    /// Debit when true, credit otherwise
    pub is_debit: bool,
    /// Non-negative amount in minor units
    pub amount: i64,
    /// Optional line memo
    pub memo: Option<String>,
}

/// Defines relationships between `JournalLine` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each line belongs to one entry
    #[sea_orm(
        belongs_to = "super::journal_entry::Entity",
        from = "Column::JournalId",
        to = "super::journal_entry::Column::Id",
        on_delete = "Cascade"
    )]
    JournalEntry,
}

impl Related<super::journal_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JournalEntry.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
