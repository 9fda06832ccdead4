//! Settlement lookups and the escrow-detail accessor.
//!
//! Settlements arrive from marketplace ingestion outside this crate; here they are
//! only read. `EscrowDetail` wraps the open JSON payload and tolerates missing,
//! null or oddly typed keys.

use crate::{
    entities::{Settlement, settlement},
    errors::{Error, Result},
};
use sea_orm::{Set, prelude::*};
use serde_json::{Map, Value};

/// Escrow key carrying the amount refunded to the buyer.
pub const BUYER_REFUND_KEY: &str = "buyer_refund_amount";

/// Read-only view over a settlement's escrow payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EscrowDetail {
    fields: Map<String, Value>,
}

impl EscrowDetail {
    /// Wraps a JSON value; anything other than an object is treated as empty.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        Self {
            fields: value.as_object().cloned().unwrap_or_default(),
        }
    }

    /// Raw value for a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Integer amount for a key. Accepts JSON integers, floats and numeric strings;
    /// anything else reads as `None`.
    #[must_use]
    pub fn amount(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| {
                #[allow(clippy::cast_possible_truncation)]
                n.as_f64().map(|f| f.round() as i64)
            }),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Amount for a key, zero when absent.
    #[must_use]
    pub fn amount_or_zero(&self, key: &str) -> i64 {
        self.amount(key).unwrap_or(0)
    }

    /// String value for a key
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Number of keys present
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the payload carried no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Escrow accessor for a stored settlement
#[must_use]
pub fn escrow_detail(model: &settlement::Model) -> EscrowDetail {
    EscrowDetail::from_value(&model.escrow_detail)
}

/// Finds a settlement by marketplace order code.
pub async fn get_settlement_by_id<C>(db: &C, order_code: &str) -> Result<Option<settlement::Model>>
where
    C: ConnectionTrait,
{
    Settlement::find_by_id(order_code.to_string())
        .one(db)
        .await
        .map_err(Into::into)
}

/// Finds a settlement, failing with `SettlementNotFound`.
pub async fn require_settlement<C>(db: &C, order_code: &str) -> Result<settlement::Model>
where
    C: ConnectionTrait,
{
    get_settlement_by_id(db, order_code)
        .await?
        .ok_or_else(|| Error::SettlementNotFound {
            reference: order_code.to_string(),
        })
}

/// Returns true when a settlement exists for the order.
pub async fn settlement_exists<C>(db: &C, order_code: &str) -> Result<bool>
where
    C: ConnectionTrait,
{
    Ok(get_settlement_by_id(db, order_code).await?.is_some())
}

/// Stores a settlement. Used by ingestion adapters and tests.
pub async fn create_settlement<C>(
    db: &C,
    order_code: &str,
    store: &str,
    net_income: i64,
    escrow_detail: Value,
) -> Result<settlement::Model>
where
    C: ConnectionTrait,
{
    let model = settlement::ActiveModel {
        order_code: Set(order_code.to_string()),
        store: Set(store.to_string()),
        net_income: Set(net_income),
        escrow_detail: Set(escrow_detail),
        settled_at: Set(chrono::Utc::now()),
    };
    model.insert(db).await.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;
    use serde_json::json;

    #[test]
    fn test_escrow_tolerates_missing_and_mistyped_keys() {
        let escrow = EscrowDetail::from_value(&json!({
            "commission_fee": 1500,
            "service_fee": "250",
            "seller_discount": 12.6,
            "note": "hello",
            "voucher": null,
        }));

        assert_eq!(escrow.amount("commission_fee"), Some(1500));
        assert_eq!(escrow.amount("service_fee"), Some(250));
        assert_eq!(escrow.amount("seller_discount"), Some(13));
        assert_eq!(escrow.amount("note"), None);
        assert_eq!(escrow.amount("voucher"), None);
        assert_eq!(escrow.amount_or_zero("missing"), 0);
        assert_eq!(escrow.text("note"), Some("hello"));
        assert_eq!(escrow.len(), 5);
    }

    #[test]
    fn test_non_object_escrow_is_empty() {
        assert!(EscrowDetail::from_value(&json!([1, 2, 3])).is_empty());
        assert!(EscrowDetail::from_value(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn test_require_settlement() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_settlement(&db, "INV-1", 5000).await?;

        assert!(settlement_exists(&db, "INV-1").await?);
        assert_eq!(require_settlement(&db, "INV-1").await?.net_income, 5000);
        assert!(matches!(
            require_settlement(&db, "INV-2").await,
            Err(Error::SettlementNotFound { .. })
        ));
        Ok(())
    }
}
