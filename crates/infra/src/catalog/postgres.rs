//! Catalog lookups over the `warehouses`, `products` and `product_variants`
//! tables.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use stockshift_core::{ProductId, VariantId, WarehouseId};

use crate::store::StoreError;

use super::{Catalog, VariantRef, WarehouseRef};

const VARIANT_SELECT: &str = "SELECT v.id, v.product_id, v.sku, v.is_active, \
     p.is_active AS product_active, p.expiry_date \
     FROM product_variants v JOIN products p ON p.id = v.product_id";

#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: Arc<PgPool>,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {}", operation))
        }
        _ => StoreError::Backend(format!("catalog query {} failed: {}", operation, err)),
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    #[instrument(skip(self), fields(warehouse_id = %id), err)]
    async fn warehouse(&self, id: WarehouseId) -> Result<Option<WarehouseRef>, StoreError> {
        let row = sqlx::query("SELECT id, code, is_active FROM warehouses WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("warehouse", e))?;

        row.map(|row| WarehouseRow::from_row(&row).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("warehouse", e))
    }

    #[instrument(skip(self), fields(variant_id = %id), err)]
    async fn variant(&self, id: VariantId) -> Result<Option<VariantRef>, StoreError> {
        let row = sqlx::query(&format!("{VARIANT_SELECT} WHERE v.id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("variant", e))?;

        row.map(|row| VariantRow::from_row(&row).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("variant", e))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn variants_of_product(&self, product_id: ProductId) -> Result<Vec<VariantId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM product_variants WHERE product_id = $1 ORDER BY id",
        )
        .bind(product_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("variants_of_product", e))?;

        Ok(ids.into_iter().map(VariantId::from_uuid).collect())
    }

    #[instrument(skip(self), err)]
    async fn expiring_variants(&self, until: NaiveDate) -> Result<Vec<VariantRef>, StoreError> {
        let rows = sqlx::query(&format!(
            "{VARIANT_SELECT} WHERE p.expiry_date IS NOT NULL AND p.expiry_date <= $1 ORDER BY v.id"
        ))
        .bind(until)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expiring_variants", e))?;

        rows.iter()
            .map(|row| VariantRow::from_row(row).map(Into::into))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("expiring_variants", e))
    }
}

// SQLx row types

#[derive(Debug)]
struct WarehouseRow {
    id: Uuid,
    code: String,
    is_active: bool,
}

impl<'r> FromRow<'r, PgRow> for WarehouseRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(WarehouseRow {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            is_active: row.try_get("is_active")?,
        })
    }
}

impl From<WarehouseRow> for WarehouseRef {
    fn from(row: WarehouseRow) -> Self {
        WarehouseRef {
            id: WarehouseId::from_uuid(row.id),
            code: row.code,
            active: row.is_active,
        }
    }
}

#[derive(Debug)]
struct VariantRow {
    id: Uuid,
    product_id: Uuid,
    sku: String,
    is_active: bool,
    product_active: bool,
    expiry_date: Option<NaiveDate>,
}

impl<'r> FromRow<'r, PgRow> for VariantRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(VariantRow {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            sku: row.try_get("sku")?,
            is_active: row.try_get("is_active")?,
            product_active: row.try_get("product_active")?,
            expiry_date: row.try_get("expiry_date")?,
        })
    }
}

impl From<VariantRow> for VariantRef {
    fn from(row: VariantRow) -> Self {
        VariantRef {
            id: VariantId::from_uuid(row.id),
            product_id: ProductId::from_uuid(row.product_id),
            sku: row.sku,
            active: row.is_active,
            product_active: row.product_active,
            expiry_date: row.expiry_date,
        }
    }
}
