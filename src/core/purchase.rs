//! Purchase business logic - lookups and status updates for supplier orders.
//!
//! All functions are generic over `ConnectionTrait` so they run equally on the
//! pooled connection or inside a transaction opened by the ledger poster or the
//! import pipeline.

use crate::{
    entities::{Purchase, PurchaseDetail, purchase, purchase_detail},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::Expr};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Largest `IN (...)` list sent in one bulk lookup.
pub const BULK_LOOKUP_SLICE: usize = 500;

/// Lifecycle status of a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PurchaseStatus {
    /// Imported, waiting for settlement
    Pending,
    /// Settled and journaled
    Completed,
    /// Cancelled before settlement
    Cancelled,
    /// Fully returned after settlement
    Returned,
    /// Partially refunded to the buyer
    PartiallyReturned,
}

impl PurchaseStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Returned => "returned",
            Self::PartiallyReturned => "partially_returned",
        }
    }

    /// Parses a stored status; unknown values are treated as pending.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "returned" => Self::Returned,
            "partially_returned" => Self::PartiallyReturned,
            _ => Self::Pending,
        }
    }

    /// Terminal statuses are never changed by reconciliation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Finds a purchase by its order code.
pub async fn get_purchase_by_id<C>(db: &C, order_code: &str) -> Result<Option<purchase::Model>>
where
    C: ConnectionTrait,
{
    Purchase::find_by_id(order_code.to_string())
        .one(db)
        .await
        .map_err(Into::into)
}

/// Finds a purchase by its order code, failing with `PurchaseNotFound`.
pub async fn require_purchase<C>(db: &C, order_code: &str) -> Result<purchase::Model>
where
    C: ConnectionTrait,
{
    get_purchase_by_id(db, order_code)
        .await?
        .ok_or_else(|| Error::PurchaseNotFound {
            reference: order_code.to_string(),
        })
}

/// Finds the purchase fulfilling a marketplace invoice.
pub async fn get_purchase_by_invoice<C>(
    db: &C,
    invoice_code: &str,
) -> Result<Option<purchase::Model>>
where
    C: ConnectionTrait,
{
    Purchase::find()
        .filter(purchase::Column::InvoiceCode.eq(invoice_code))
        .order_by_asc(purchase::Column::OrderCode)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Fetches every purchase for the given invoices, keyed by invoice code.
///
/// Issues one `IN (...)` query per slice of [`BULK_LOOKUP_SLICE`] invoices. If the
/// backend rejects a bulk statement, that slice is looked up one invoice at a
/// time instead. Invoices without a purchase are absent from the map.
pub async fn get_purchases_by_invoices<C>(
    db: &C,
    invoice_codes: &[String],
) -> Result<HashMap<String, purchase::Model>>
where
    C: ConnectionTrait,
{
    let mut found = HashMap::with_capacity(invoice_codes.len());

    for slice in invoice_codes.chunks(BULK_LOOKUP_SLICE) {
        let bulk = Purchase::find()
            .filter(purchase::Column::InvoiceCode.is_in(slice.iter().cloned()))
            .all(db)
            .await;

        match bulk {
            Ok(models) => {
                debug!(requested = slice.len(), found = models.len(), "Bulk purchase lookup");
                for model in models {
                    found.entry(model.invoice_code.clone()).or_insert(model);
                }
            }
            Err(e) => {
                warn!(error = %e, size = slice.len(), "Bulk lookup rejected, falling back to per-invoice lookups");
                for invoice in slice {
                    if let Some(model) = get_purchase_by_invoice(db, invoice).await? {
                        found.insert(invoice.clone(), model);
                    }
                }
            }
        }
    }

    Ok(found)
}

/// Returns true when a purchase with this order code exists.
pub async fn purchase_exists<C>(db: &C, order_code: &str) -> Result<bool>
where
    C: ConnectionTrait,
{
    Ok(get_purchase_by_id(db, order_code).await?.is_some())
}

/// Sets the status of a purchase.
pub async fn update_purchase_status<C>(
    db: &C,
    order_code: &str,
    status: PurchaseStatus,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let result = Purchase::update_many()
        .col_expr(purchase::Column::Status, Expr::value(status.as_str()))
        .col_expr(purchase::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(purchase::Column::OrderCode.eq(order_code))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::PurchaseNotFound {
            reference: order_code.to_string(),
        });
    }
    Ok(())
}

/// Moves a purchase to `to` only while its stored status is one of `from`.
///
/// Returns `false` when the purchase exists but has already moved on, so a
/// concurrent return or cancellation is never overwritten.
pub async fn transition_purchase_status<C>(
    db: &C,
    order_code: &str,
    from: &[PurchaseStatus],
    to: PurchaseStatus,
) -> Result<bool>
where
    C: ConnectionTrait,
{
    let result = Purchase::update_many()
        .col_expr(purchase::Column::Status, Expr::value(to.as_str()))
        .col_expr(purchase::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(purchase::Column::OrderCode.eq(order_code))
        .filter(purchase::Column::Status.is_in(from.iter().map(|s| s.as_str())))
        .exec(db)
        .await?;

    if result.rows_affected > 0 {
        return Ok(true);
    }
    if purchase_exists(db, order_code).await? {
        debug!(order_code, to = to.as_str(), "Purchase status already moved on");
        Ok(false)
    } else {
        Err(Error::PurchaseNotFound {
            reference: order_code.to_string(),
        })
    }
}

/// Sets the status of every detail line of a purchase, returning how many changed.
pub async fn update_detail_statuses<C>(
    db: &C,
    order_code: &str,
    status: PurchaseStatus,
) -> Result<u64>
where
    C: ConnectionTrait,
{
    let result = PurchaseDetail::update_many()
        .col_expr(purchase_detail::Column::Status, Expr::value(status.as_str()))
        .filter(purchase_detail::Column::OrderCode.eq(order_code))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Lists the detail lines of a purchase.
pub async fn get_details<C>(db: &C, order_code: &str) -> Result<Vec<purchase_detail::Model>>
where
    C: ConnectionTrait,
{
    PurchaseDetail::find()
        .filter(purchase_detail::Column::OrderCode.eq(order_code))
        .order_by_asc(purchase_detail::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Fields of a purchase as read from an import row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    /// Supplier order code
    pub order_code: String,
    /// Marketplace invoice
    pub invoice_code: String,
    /// Store
    pub store: String,
    /// Total paid
    pub total_amount: i64,
    /// Shipping fee
    pub shipping_fee: i64,
    /// Service fee
    pub service_fee: i64,
    /// Supplier order time
    pub ordered_at: Option<DateTimeUtc>,
}

/// Inserts a purchase with `pending` status.
pub async fn create_purchase<C>(db: &C, new: NewPurchase) -> Result<purchase::Model>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let model = purchase::ActiveModel {
        order_code: Set(new.order_code),
        invoice_code: Set(new.invoice_code),
        store: Set(new.store),
        total_amount: Set(new.total_amount),
        shipping_fee: Set(new.shipping_fee),
        service_fee: Set(new.service_fee),
        status: Set(PurchaseStatus::Pending.as_str().to_string()),
        ordered_at: Set(new.ordered_at),
        created_at: Set(now),
        updated_at: Set(now),
    };
    model.insert(db).await.map_err(Into::into)
}

/// Inserts a detail line with `pending` status.
pub async fn create_detail<C>(
    db: &C,
    order_code: &str,
    sku: &str,
    product_name: &str,
    quantity: i32,
    unit_price: i64,
) -> Result<purchase_detail::Model>
where
    C: ConnectionTrait,
{
    let model = purchase_detail::ActiveModel {
        order_code: Set(order_code.to_string()),
        sku: Set(sku.to_string()),
        product_name: Set(product_name.to_string()),
        quantity: Set(quantity),
        unit_price: Set(unit_price),
        status: Set(PurchaseStatus::Pending.as_str().to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    model.insert(db).await.map_err(Into::into)
}

/// Returns true when the purchase already has a line for this SKU.
pub async fn detail_exists<C>(db: &C, order_code: &str, sku: &str) -> Result<bool>
where
    C: ConnectionTrait,
{
    let found = PurchaseDetail::find()
        .filter(purchase_detail::Column::OrderCode.eq(order_code))
        .filter(purchase_detail::Column::Sku.eq(sku))
        .one(db)
        .await?;
    Ok(found.is_some())
}
