//! Purchase entity - A dropship order bought from a supplier.
//!
//! Rows are written by the import pipeline and only mutated afterwards through
//! status updates issued by the reconciliation layer. Amounts are minor currency units.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Purchase database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchases")]
pub struct Model {
    /// Supplier order code, unique per purchase
    #[sea_orm(primary_key, auto_increment = false)]
    pub order_code: String,
    /// Marketplace invoice (order) number this purchase fulfils
    #[sea_orm(indexed)]
    pub invoice_code: String,
    /// Store (shop) the order was sold through
    pub store: String,
    /// Total paid to the supplier
    pub total_amount: i64,
    /// Shipping fee component of the total
    pub shipping_fee: i64,
    /// Service fee component of the total
    pub service_fee: i64,
    /// Lifecycle status, see `core::purchase::PurchaseStatus`
    pub status: String,
    /// When the order was placed with the supplier, if known
    pub ordered_at: Option<DateTimeUtc>,
    /// Row creation time
    pub created_at: DateTimeUtc,
    /// Last status change
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Purchase and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One purchase has many detail lines
    #[sea_orm(has_many = "super::purchase_detail::Entity")]
    Details,
}

impl Related<super::purchase_detail::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Details.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
