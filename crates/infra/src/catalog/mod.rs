//! Read-only catalog lookups consumed by the ledger.
//!
//! The catalog (warehouses, products, variants) is owned elsewhere; the
//! ledger only needs existence, activity and product expiry dates.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockshift_core::{DomainError, DomainResult, ProductId, VariantId, WarehouseId};

use crate::store::StoreError;

pub use in_memory::InMemoryCatalog;
pub use postgres::PostgresCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRef {
    pub id: WarehouseId,
    /// Short human code used in transfer notes.
    pub code: String,
    pub active: bool,
}

impl WarehouseRef {
    pub fn ensure_active(&self) -> DomainResult<()> {
        if !self.active {
            return Err(DomainError::validation("warehouse-inactive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRef {
    pub id: VariantId,
    pub product_id: ProductId,
    pub sku: String,
    pub active: bool,
    pub product_active: bool,
    /// Expiry date of the owning product, if it perishes.
    pub expiry_date: Option<NaiveDate>,
}

impl VariantRef {
    /// A variant can move only while both it and its product are active.
    /// The variant's own flag is checked first.
    pub fn ensure_active(&self) -> DomainResult<()> {
        if !self.active {
            return Err(DomainError::validation("variant-inactive"));
        }
        if !self.product_active {
            return Err(DomainError::validation("product-inactive"));
        }
        Ok(())
    }

    pub fn is_expired_on(&self, business_date: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|expiry| expiry < business_date)
    }

    /// Reject movements of expired stock, except the discard write-off.
    pub fn ensure_movable(&self, business_date: NaiveDate, discard_expired: bool) -> DomainResult<()> {
        if self.is_expired_on(business_date) && !discard_expired {
            return Err(DomainError::validation("expired-item-movement-blocked"));
        }
        Ok(())
    }
}

/// Catalog lookups.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn warehouse(&self, id: WarehouseId) -> Result<Option<WarehouseRef>, StoreError>;

    async fn variant(&self, id: VariantId) -> Result<Option<VariantRef>, StoreError>;

    /// Variants of a product; empty when the product is unknown.
    async fn variants_of_product(&self, product_id: ProductId) -> Result<Vec<VariantId>, StoreError>;

    /// Variants whose product expires on or before `until`.
    async fn expiring_variants(&self, until: NaiveDate) -> Result<Vec<VariantRef>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(expiry_date: Option<NaiveDate>) -> VariantRef {
        VariantRef {
            id: VariantId::new(),
            product_id: ProductId::new(),
            sku: "SKU-1".to_string(),
            active: true,
            product_active: true,
            expiry_date,
        }
    }

    #[test]
    fn expiry_blocks_movement_after_the_expiry_date_only() {
        let expiry = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let item = variant(Some(expiry));

        assert!(item.ensure_movable(expiry, false).is_ok());
        assert_eq!(
            item.ensure_movable(expiry.succ_opt().unwrap(), false),
            Err(DomainError::validation("expired-item-movement-blocked"))
        );
        assert!(item.ensure_movable(expiry.succ_opt().unwrap(), true).is_ok());
        assert!(!variant(None).is_expired_on(NaiveDate::MAX));
    }

    #[test]
    fn inactive_product_is_reported_separately_from_the_variant() {
        let mut item = variant(None);
        item.product_active = false;
        assert_eq!(
            item.ensure_active(),
            Err(DomainError::validation("product-inactive"))
        );

        item.active = false;
        assert_eq!(
            item.ensure_active(),
            Err(DomainError::validation("variant-inactive"))
        );
    }
}
