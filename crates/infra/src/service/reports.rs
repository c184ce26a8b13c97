//! Read-only stock reports: snapshot, low stock, expiring stock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use stockshift_core::{DomainError, ProductId, ResourceKind, VariantId, WarehouseId};
use stockshift_ledger::report::{sort_expiring, validate_threshold};
use stockshift_ledger::{
    ExpiringRow, ExpiringSortField, ExpiryWindow, LowStockRow, LowStockSortField, Page,
    PageLimits, SnapshotRow, SnapshotSortField,
};

use crate::catalog::Catalog;
use crate::store::{LedgerStore, SnapshotFilter};

use super::{PageParams, ServiceResult};

/// Filters and shaping options of the snapshot report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuery {
    pub warehouse_id: Option<WarehouseId>,
    pub variant_id: Option<VariantId>,
    /// Every variant of this product.
    pub product_id: Option<ProductId>,
    pub include_zero: bool,
    /// One row per variant summed across warehouses.
    pub aggregate_by_warehouse: bool,
    /// Balances as of this instant, computed from the log.
    pub as_of: Option<DateTime<Utc>>,
}

/// Options of the expiring-stock report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringQuery {
    pub warehouse_id: Option<WarehouseId>,
    /// Window length; missing or non-positive means 30 days.
    pub days_ahead: Option<i64>,
    pub include_expired: bool,
    pub aggregate_by_warehouse: bool,
    pub as_of: Option<DateTime<Utc>>,
}

pub struct ReportService<S, C> {
    store: Arc<S>,
    catalog: Arc<C>,
    limits: PageLimits,
}

impl<S, C> ReportService<S, C>
where
    S: LedgerStore,
    C: Catalog,
{
    pub fn new(store: Arc<S>, catalog: Arc<C>, limits: PageLimits) -> Self {
        Self {
            store,
            catalog,
            limits,
        }
    }

    async fn ensure_warehouse(&self, warehouse_id: Option<WarehouseId>) -> ServiceResult<()> {
        if let Some(id) = warehouse_id {
            if self.catalog.warehouse(id).await?.is_none() {
                return Err(DomainError::not_found(ResourceKind::Warehouse, id).into());
            }
        }
        Ok(())
    }

    /// Resolve the variant and product filters into one variant set.
    async fn variant_scope(&self, query: &SnapshotQuery) -> ServiceResult<Option<Vec<VariantId>>> {
        let Some(product_id) = query.product_id else {
            return Ok(query.variant_id.map(|id| vec![id]));
        };

        let mut ids = self.catalog.variants_of_product(product_id).await?;
        if let Some(variant_id) = query.variant_id {
            ids.retain(|id| *id == variant_id);
        }
        Ok(Some(ids))
    }

    #[instrument(skip(self, query, params), err)]
    pub async fn snapshot(
        &self,
        query: &SnapshotQuery,
        params: &PageParams,
    ) -> ServiceResult<Page<SnapshotRow>> {
        let (page, sort) = params.resolve::<SnapshotSortField>(&self.limits)?;
        self.ensure_warehouse(query.warehouse_id).await?;

        let filter = SnapshotFilter {
            warehouse_id: query.warehouse_id,
            variant_ids: self.variant_scope(query).await?,
            include_zero: query.include_zero,
            aggregate_by_warehouse: query.aggregate_by_warehouse,
            as_of: query.as_of,
        };
        if filter.variant_ids.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Page::empty(page));
        }

        Ok(self.store.snapshot(&filter, page, sort).await?)
    }

    /// Balances strictly below `threshold`, read from the projection.
    #[instrument(skip(self, params), err)]
    pub async fn low_stock(
        &self,
        warehouse_id: Option<WarehouseId>,
        threshold: i64,
        params: &PageParams,
    ) -> ServiceResult<Page<LowStockRow>> {
        let threshold = validate_threshold(threshold)?;
        let (page, sort) = params.resolve::<LowStockSortField>(&self.limits)?;
        self.ensure_warehouse(warehouse_id).await?;

        Ok(self
            .store
            .low_stock(warehouse_id, threshold, page, sort)
            .await?)
    }

    #[instrument(skip(self, query, params), err)]
    pub async fn expiring(
        &self,
        query: &ExpiringQuery,
        params: &PageParams,
    ) -> ServiceResult<Page<ExpiringRow>> {
        let (page, sort) = params.resolve::<ExpiringSortField>(&self.limits)?;
        self.ensure_warehouse(query.warehouse_id).await?;

        let window = ExpiryWindow::new(query.as_of, query.days_ahead, query.include_expired);
        let expiry_dates: HashMap<VariantId, _> = self
            .catalog
            .expiring_variants(window.until)
            .await?
            .into_iter()
            .filter_map(|variant| Some((variant.id, variant.expiry_date?)))
            .filter(|(_, expiry)| window.contains(*expiry))
            .collect();
        if expiry_dates.is_empty() {
            return Ok(Page::empty(page));
        }

        let mut variant_ids: Vec<VariantId> = expiry_dates.keys().copied().collect();
        variant_ids.sort();
        let filter = SnapshotFilter {
            warehouse_id: query.warehouse_id,
            variant_ids: Some(variant_ids),
            include_zero: false,
            aggregate_by_warehouse: query.aggregate_by_warehouse,
            as_of: query.as_of,
        };

        let mut rows: Vec<ExpiringRow> = self
            .store
            .balances_for(&filter)
            .await?
            .into_iter()
            .filter_map(|balance| {
                let expiry = *expiry_dates.get(&balance.variant_id)?;
                window.row(balance, expiry)
            })
            .collect();
        sort_expiring(&mut rows, sort);
        Ok(Page::from_sorted(rows, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use stockshift_core::ActorId;
    use stockshift_events::InMemoryEventBus;
    use stockshift_ledger::{ReasonCode, RequestedLine, StockEventType};

    use crate::catalog::InMemoryCatalog;
    use crate::service::{FeedMessage, LedgerServices, ServiceSettings, StockEventRequest};
    use crate::store::InMemoryLedgerStore;

    type Services = LedgerServices<InMemoryLedgerStore, InMemoryCatalog, InMemoryEventBus<FeedMessage>>;

    fn services(catalog: Arc<InMemoryCatalog>) -> Services {
        LedgerServices::new(
            Arc::new(InMemoryLedgerStore::new()),
            catalog,
            InMemoryEventBus::new(),
            ServiceSettings::default(),
        )
    }

    async fn receive(services: &Services, warehouse: WarehouseId, variant: VariantId, quantity: i64) {
        services
            .ledger
            .record_event(
                ActorId::new(),
                StockEventRequest::new(
                    StockEventType::Inbound,
                    warehouse,
                    vec![RequestedLine::new(variant, quantity)],
                ),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_aggregates_and_hides_zero_balances() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let a = catalog.add_warehouse("WH-A");
        let b = catalog.add_warehouse("WH-B");
        let product = ProductId::new();
        let soap = catalog.add_variant(product, "SOAP", None);
        let sponge = catalog.add_variant(ProductId::new(), "SPONGE", None);
        let services = services(catalog);

        receive(&services, a, soap, 5).await;
        receive(&services, b, soap, 7).await;
        receive(&services, a, sponge, 1).await;
        services
            .ledger
            .record_event(
                ActorId::new(),
                StockEventRequest::new(
                    StockEventType::Outbound,
                    a,
                    vec![RequestedLine::new(sponge, 1)],
                ),
                None,
            )
            .await
            .unwrap();

        let page = services
            .reports
            .snapshot(&SnapshotQuery::default(), &PageParams::default())
            .await
            .unwrap();
        assert_eq!(page.total_elements, 2);
        assert!(page.content.iter().all(|row| row.quantity > 0));

        let aggregated = services
            .reports
            .snapshot(
                &SnapshotQuery {
                    product_id: Some(product),
                    aggregate_by_warehouse: true,
                    ..Default::default()
                },
                &PageParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            aggregated.content,
            vec![SnapshotRow {
                warehouse_id: None,
                variant_id: soap,
                quantity: 12
            }]
        );

        let err = services
            .reports
            .snapshot(
                &SnapshotQuery {
                    warehouse_id: Some(WarehouseId::new()),
                    ..Default::default()
                },
                &PageParams::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn low_stock_requires_a_positive_threshold() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let warehouse = catalog.add_warehouse("WH-A");
        let variant = catalog.add_variant(ProductId::new(), "SKU", None);
        let services = services(catalog);
        receive(&services, warehouse, variant, 3).await;

        let err = services
            .reports
            .low_stock(None, 0, &PageParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::validation("threshold-required")));

        let page = services
            .reports
            .low_stock(Some(warehouse), 10, &PageParams::default())
            .await
            .unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].deficit, -7);
    }

    #[tokio::test]
    async fn expiring_report_respects_the_window() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let warehouse = catalog.add_warehouse("WH-A");
        let as_of = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let today = as_of.date_naive();
        let soon = catalog.add_variant(ProductId::new(), "MILK", Some(today + Duration::days(3)));
        let later = catalog.add_variant(ProductId::new(), "CHEESE", Some(today + Duration::days(90)));
        let past = catalog.add_variant(ProductId::new(), "BREAD", NaiveDate::from_ymd_opt(2026, 4, 28));
        let services = services(catalog);

        // Received before the expiry dates so the movement rule allows them.
        for variant in [soon, later, past] {
            services
                .ledger
                .record_event(
                    ActorId::new(),
                    StockEventRequest::new(
                        StockEventType::Inbound,
                        warehouse,
                        vec![RequestedLine::new(variant, 2)],
                    )
                    .with_reason(ReasonCode::Purchase)
                    .occurred_at(as_of - Duration::days(10)),
                    None,
                )
                .await
                .unwrap();
        }

        let query = ExpiringQuery {
            as_of: Some(as_of),
            days_ahead: Some(0),
            ..Default::default()
        };
        let page = services
            .reports
            .expiring(&query, &PageParams::default())
            .await
            .unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].variant_id, soon);
        assert_eq!(page.content[0].days_until_expiry, 3);

        let with_expired = services
            .reports
            .expiring(
                &ExpiringQuery {
                    include_expired: true,
                    ..query
                },
                &PageParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(with_expired.content.len(), 2);
        assert_eq!(with_expired.content[0].variant_id, past);
        assert_eq!(with_expired.content[0].days_until_expiry, -3);
    }

    #[tokio::test]
    async fn expiring_report_accepts_an_unbounded_window() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let warehouse = catalog.add_warehouse("WH-A");
        let as_of = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let jam = catalog.add_variant(
            ProductId::new(),
            "JAM",
            NaiveDate::from_ymd_opt(2031, 1, 1),
        );
        let services = services(catalog);
        receive(&services, warehouse, jam, 4).await;

        let page = services
            .reports
            .expiring(
                &ExpiringQuery {
                    as_of: Some(as_of),
                    days_ahead: Some(i64::MAX),
                    ..Default::default()
                },
                &PageParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].variant_id, jam);
    }
}
