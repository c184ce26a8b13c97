//! Application services over the ledger store.
//!
//! Each service call is one unit of work:
//!
//! ```text
//! request
//!   ↓
//! 1. Parse key, page and sort input
//!   ↓
//! 2. Replay a stored idempotent result, if any (no further checks)
//!   ↓
//! 3. Validate against the catalog (existence, activity, expiry)
//!   ↓
//! 4. Run the store operation, retrying transient failures with backoff
//!   ↓
//! 5. Publish committed events on the change feed
//! ```
//!
//! The services are generic over the store, the catalog and the bus so the
//! same code runs against the in-memory backends in tests and Postgres in
//! production.

pub mod error;
pub mod feed;
pub mod ledger;
pub mod reports;
pub mod transfers;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockshift_core::{DomainError, ResourceKind, VariantId, WarehouseId};
use stockshift_events::EventBus;
use stockshift_ledger::{PageLimits, PageRequest, Sort, SortField};

use crate::catalog::{Catalog, VariantRef, WarehouseRef};
use crate::config::LedgerConfig;
use crate::idempotency::IdempotencyPolicy;
use crate::retry::RetryPolicy;
use crate::store::LedgerStore;

pub use error::{ServiceError, ServiceResult};
pub use feed::{ChangeFeed, FeedMessage};
pub use ledger::{StockEventRequest, StockLedgerService};
pub use reports::{ExpiringQuery, ReportService, SnapshotQuery};
pub use transfers::{TransferDraftRequest, TransferService};

/// Raw paging input as it arrives from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub size: Option<u32>,
    /// `"field"` or `"field,asc|desc"`.
    pub sort: Option<String>,
}

impl PageParams {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page: Some(page),
            size: Some(size),
            sort: None,
        }
    }

    pub fn sorted(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn resolve<F: SortField>(&self, limits: &PageLimits) -> Result<(PageRequest, Sort<F>), DomainError> {
        let request = limits.request(self.page, self.size)?;
        let sort = Sort::parse(self.sort.as_deref())?;
        Ok((request, sort))
    }
}

/// Tunables shared by all services.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceSettings {
    pub retry: RetryPolicy,
    pub idempotency: IdempotencyPolicy,
    pub limits: PageLimits,
}

impl ServiceSettings {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            idempotency: config.idempotency_policy(),
            limits: config.page_limits(),
        }
    }
}

/// The three services wired to one store, catalog and change feed.
pub struct LedgerServices<S, C, B> {
    pub ledger: StockLedgerService<S, C, B>,
    pub transfers: TransferService<S, C, B>,
    pub reports: ReportService<S, C>,
}

impl<S, C, B> LedgerServices<S, C, B>
where
    S: LedgerStore + 'static,
    C: Catalog + 'static,
    B: EventBus<FeedMessage>,
{
    pub fn new(store: Arc<S>, catalog: Arc<C>, bus: B, settings: ServiceSettings) -> Self {
        let feed = Arc::new(ChangeFeed::new(bus));
        Self {
            ledger: StockLedgerService::new(
                store.clone(),
                catalog.clone(),
                feed.clone(),
                settings.clone(),
            ),
            transfers: TransferService::new(store.clone(), catalog.clone(), feed, settings.clone()),
            reports: ReportService::new(store, catalog, settings.limits),
        }
    }
}

/// Existing and active warehouse.
pub(crate) async fn active_warehouse<C: Catalog + ?Sized>(
    catalog: &C,
    id: WarehouseId,
) -> ServiceResult<WarehouseRef> {
    let warehouse = catalog
        .warehouse(id)
        .await?
        .ok_or_else(|| DomainError::not_found(ResourceKind::Warehouse, id))?;
    warehouse.ensure_active()?;
    Ok(warehouse)
}

/// Existing and active variant that may move on `business_date`.
pub(crate) async fn movable_variant<C: Catalog + ?Sized>(
    catalog: &C,
    id: VariantId,
    business_date: NaiveDate,
    discard_expired: bool,
) -> ServiceResult<VariantRef> {
    let variant = catalog
        .variant(id)
        .await?
        .ok_or_else(|| DomainError::not_found(ResourceKind::Variant, id))?;
    variant.ensure_active()?;
    variant.ensure_movable(business_date, discard_expired)?;
    Ok(variant)
}
