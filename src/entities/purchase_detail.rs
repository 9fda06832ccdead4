//! Purchase detail entity - One product line of a purchase.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Purchase detail database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_details")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owning purchase
    pub order_code: String,
    /// Supplier stock keeping unit
    pub sku: String,
    /// Product name as printed on the supplier invoice
    pub product_name: String,
    /// Units ordered
    pub quantity: i32,
    /// Price per unit
    pub unit_price: i64,
    /// Line status, mirrors the purchase status after returns
    pub status: String,
    /// Row creation time
    pub created_at: DateTimeUtc,
}

/// Defines relationships between `PurchaseDetail` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each detail belongs to one purchase
    #[sea_orm(
        belongs_to = "super::purchase::Entity",
        from = "Column::OrderCode",
        to = "super::purchase::Column::OrderCode"
    )]
    Purchase,
}

impl Related<super::purchase::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Purchase.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
