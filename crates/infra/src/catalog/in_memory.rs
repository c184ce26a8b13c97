use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

use async_trait::async_trait;
use chrono::NaiveDate;

use stockshift_core::{ProductId, VariantId, WarehouseId};

use crate::store::StoreError;

use super::{Catalog, VariantRef, WarehouseRef};

#[derive(Debug, Default)]
struct CatalogState {
    warehouses: HashMap<WarehouseId, WarehouseRef>,
    variants: HashMap<VariantId, VariantRef>,
}

/// In-memory catalog for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CatalogState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("catalog lock poisoned".to_string()))
    }

    /// Insert or replace a warehouse.
    pub fn upsert_warehouse(&self, warehouse: WarehouseRef) {
        if let Ok(mut state) = self.state.write() {
            state.warehouses.insert(warehouse.id, warehouse);
        }
    }

    /// Insert or replace a variant.
    pub fn upsert_variant(&self, variant: VariantRef) {
        if let Ok(mut state) = self.state.write() {
            state.variants.insert(variant.id, variant);
        }
    }

    /// Register an active warehouse and return its id.
    pub fn add_warehouse(&self, code: &str) -> WarehouseId {
        let id = WarehouseId::new();
        self.upsert_warehouse(WarehouseRef {
            id,
            code: code.to_string(),
            active: true,
        });
        id
    }

    /// Register an active variant of `product_id` and return its id.
    pub fn add_variant(
        &self,
        product_id: ProductId,
        sku: &str,
        expiry_date: Option<NaiveDate>,
    ) -> VariantId {
        let id = VariantId::new();
        self.upsert_variant(VariantRef {
            id,
            product_id,
            sku: sku.to_string(),
            active: true,
            product_active: true,
            expiry_date,
        });
        id
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn warehouse(&self, id: WarehouseId) -> Result<Option<WarehouseRef>, StoreError> {
        Ok(self.read()?.warehouses.get(&id).cloned())
    }

    async fn variant(&self, id: VariantId) -> Result<Option<VariantRef>, StoreError> {
        Ok(self.read()?.variants.get(&id).cloned())
    }

    async fn variants_of_product(&self, product_id: ProductId) -> Result<Vec<VariantId>, StoreError> {
        let mut ids: Vec<VariantId> = self
            .read()?
            .variants
            .values()
            .filter(|variant| variant.product_id == product_id)
            .map(|variant| variant.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn expiring_variants(&self, until: NaiveDate) -> Result<Vec<VariantRef>, StoreError> {
        let mut variants: Vec<VariantRef> = self
            .read()?
            .variants
            .values()
            .filter(|variant| variant.expiry_date.is_some_and(|expiry| expiry <= until))
            .cloned()
            .collect();
        variants.sort_by_key(|variant| variant.id);
        Ok(variants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookups_see_registered_entries() {
        let catalog = InMemoryCatalog::new();
        let warehouse = catalog.add_warehouse("WH-A");
        let product = ProductId::new();
        let fresh = catalog.add_variant(product, "MILK-1L", NaiveDate::from_ymd_opt(2030, 1, 1));
        let stale = catalog.add_variant(product, "MILK-2L", NaiveDate::from_ymd_opt(2020, 1, 1));
        catalog.add_variant(ProductId::new(), "SOAP", None);

        assert_eq!(catalog.warehouse(warehouse).await.unwrap().unwrap().code, "WH-A");
        assert!(catalog.warehouse(WarehouseId::new()).await.unwrap().is_none());

        let mut expected = vec![fresh, stale];
        expected.sort();
        assert_eq!(catalog.variants_of_product(product).await.unwrap(), expected);

        let expiring = catalog
            .expiring_variants(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, stale);
    }
}
