//! Settlement entity - Funds released by the marketplace for one order.
//!
//! Read-only to this crate. The escrow breakdown is kept as an open JSON object
//! because the upstream schema changes without notice.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Settlement database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "settlements")]
pub struct Model {
    /// Marketplace order code
    #[sea_orm(primary_key, auto_increment = false)]
    pub order_code: String,
    /// Store the order belongs to
    pub store: String,
    /// Amount released to the seller after fees
    pub net_income: i64,
    /// Raw escrow detail payload
    pub escrow_detail: Json,
    /// When the marketplace released the funds
    pub settled_at: DateTimeUtc,
}

/// `Settlement` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
