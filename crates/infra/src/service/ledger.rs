//! Stock ledger service: record movements, read the log, audit balances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use stockshift_core::{ActorId, DomainError, ResourceKind, StockEventId, VariantId, WarehouseId};
use stockshift_events::EventBus;
use stockshift_ledger::{
    BalanceDrift, BalanceKey, EventSortField, HistoryEntry, HistorySortField, OccurredRange, Page,
    ReasonCode, RecordStockEvent, RequestedLine, StockEvent, StockEventType,
};

use crate::catalog::Catalog;
use crate::idempotency::{
    IdempotencyClaim, IdempotencyKey, IdempotencyScope, stock_event_fingerprint,
};
use crate::retry::retry_transient;
use crate::store::{AppendOutcome, EventFilter, LedgerStore};

use super::{
    ChangeFeed, FeedMessage, PageParams, ServiceResult, ServiceSettings, active_warehouse,
    movable_variant,
};

/// A stock movement as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockEventRequest {
    pub event_type: StockEventType,
    pub warehouse_id: WarehouseId,
    pub lines: Vec<RequestedLine>,
    pub reason_code: Option<ReasonCode>,
    /// Business time; defaults to the time of recording.
    pub occurred_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl StockEventRequest {
    pub fn new(event_type: StockEventType, warehouse_id: WarehouseId, lines: Vec<RequestedLine>) -> Self {
        Self {
            event_type,
            warehouse_id,
            lines,
            reason_code: None,
            occurred_at: None,
            notes: None,
        }
    }

    pub fn with_reason(mut self, reason_code: ReasonCode) -> Self {
        self.reason_code = Some(reason_code);
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    fn into_command(self, now: DateTime<Utc>) -> RecordStockEvent {
        RecordStockEvent {
            event_type: self.event_type,
            warehouse_id: self.warehouse_id,
            reason_code: self.reason_code,
            notes: self.notes,
            occurred_at: self.occurred_at.unwrap_or(now),
            lines: self.lines,
        }
    }
}

pub struct StockLedgerService<S, C, B> {
    store: Arc<S>,
    catalog: Arc<C>,
    feed: Arc<ChangeFeed<B>>,
    settings: ServiceSettings,
}

impl<S, C, B> StockLedgerService<S, C, B>
where
    S: LedgerStore,
    C: Catalog,
    B: EventBus<FeedMessage>,
{
    pub fn new(
        store: Arc<S>,
        catalog: Arc<C>,
        feed: Arc<ChangeFeed<B>>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            feed,
            settings,
        }
    }

    /// Record a stock movement.
    ///
    /// With an idempotency key already bound to an identical request, the
    /// stored event is returned as-is: no catalog or stock checks run and
    /// nothing is published again.
    #[instrument(
        skip(self, request, idempotency_key),
        fields(
            actor_id = %actor,
            event_type = %request.event_type,
            warehouse_id = %request.warehouse_id,
            lines = request.lines.len()
        ),
        err
    )]
    pub async fn record_event(
        &self,
        actor: ActorId,
        request: StockEventRequest,
        idempotency_key: Option<&str>,
    ) -> ServiceResult<StockEvent> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let now = Utc::now();

        let event = request.into_command(now).into_event(
            StockEventId::new(),
            actor,
            now,
            key.as_ref().map(|key| key.as_str().to_string()),
        )?;

        let claim = key.map(|key| {
            IdempotencyClaim::new(
                actor,
                key,
                IdempotencyScope::StockEventCreate,
                stock_event_fingerprint(&event),
                &self.settings.idempotency,
                now,
            )
        });

        if let Some(claim) = &claim {
            if let Some(existing) = self.store.find_idempotency(actor, &claim.key).await? {
                claim.check_replay(&existing)?;
                info!(key = %claim.key, "replaying stored stock event");
                return Ok(existing.replay()?);
            }
        }

        self.check_catalog(&event).await?;

        let outcome = retry_transient(&self.settings.retry, "record_event", || {
            self.store.append_event(event.clone(), claim.clone())
        })
        .await?;

        match &outcome {
            AppendOutcome::Created(event) => {
                info!(event_id = %event.id, sequence = event.sequence, "stock event recorded");
                self.feed.stock_event(event);
            }
            // Lost a race with a concurrent request carrying the same key.
            AppendOutcome::Replayed(event) => {
                info!(event_id = %event.id, "stock event replayed after claim race");
            }
        }
        Ok(outcome.into_event())
    }

    async fn check_catalog(&self, event: &StockEvent) -> ServiceResult<()> {
        active_warehouse(self.catalog.as_ref(), event.warehouse_id).await?;

        let business_date = event.occurred_at.date_naive();
        let discard_expired = event.is_discard_expired();
        for line in &event.lines {
            movable_variant(
                self.catalog.as_ref(),
                line.variant_id,
                business_date,
                discard_expired,
            )
            .await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    pub async fn get_event(&self, id: StockEventId) -> ServiceResult<StockEvent> {
        self.store
            .get_event(id)
            .await?
            .ok_or_else(|| DomainError::not_found(ResourceKind::StockEvent, id).into())
    }

    #[instrument(skip(self, filter), err)]
    pub async fn list_events(
        &self,
        filter: &EventFilter,
        params: &PageParams,
    ) -> ServiceResult<Page<StockEvent>> {
        OccurredRange::new(filter.range.from, filter.range.to)?;
        let (page, sort) = params.resolve::<EventSortField>(&self.settings.limits)?;
        Ok(self.store.list_events(filter, page, sort).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn balance_of(
        &self,
        warehouse_id: WarehouseId,
        variant_id: VariantId,
    ) -> ServiceResult<i64> {
        Ok(self
            .store
            .balance_of(BalanceKey::new(warehouse_id, variant_id))
            .await?)
    }

    /// Running-balance history of one key.
    ///
    /// With `occurred_from`, the first entry's `balance_before` carries every
    /// earlier change. The sort only flips presentation order.
    #[instrument(skip(self, params), err)]
    pub async fn history(
        &self,
        warehouse_id: WarehouseId,
        variant_id: VariantId,
        occurred_from: Option<DateTime<Utc>>,
        occurred_to: Option<DateTime<Utc>>,
        params: &PageParams,
    ) -> ServiceResult<Page<HistoryEntry>> {
        let range = OccurredRange::new(occurred_from, occurred_to)?;
        let (page, sort) = params.resolve::<HistorySortField>(&self.settings.limits)?;
        Ok(self
            .store
            .history(
                BalanceKey::new(warehouse_id, variant_id),
                &range,
                page,
                sort.direction,
            )
            .await?)
    }

    /// Compare every materialized balance with the log.
    #[instrument(skip(self), err)]
    pub async fn verify_balances(&self) -> ServiceResult<Vec<BalanceDrift>> {
        let drift = self.store.verify_balances().await?;
        for entry in &drift {
            warn!(
                key = %entry.key,
                recorded = entry.recorded,
                expected = entry.expected,
                "balance drift"
            );
        }
        Ok(drift)
    }

    #[instrument(skip(self), err)]
    pub async fn rebuild_balances(&self) -> ServiceResult<u64> {
        let written = retry_transient(&self.settings.retry, "rebuild_balances", || {
            self.store.rebuild_balances()
        })
        .await?;
        info!(written, "balances rebuilt from the ledger");
        Ok(written)
    }

    #[instrument(skip(self), err)]
    pub async fn purge_idempotency(&self, now: DateTime<Utc>) -> ServiceResult<u64> {
        let removed = self.store.purge_expired(now).await?;
        info!(removed, "expired idempotency records purged");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use stockshift_core::ProductId;
    use stockshift_events::InMemoryEventBus;

    use crate::catalog::InMemoryCatalog;
    use crate::store::InMemoryLedgerStore;

    type Service = StockLedgerService<InMemoryLedgerStore, InMemoryCatalog, InMemoryEventBus<FeedMessage>>;

    struct Fixture {
        service: Service,
        feed: Arc<ChangeFeed<InMemoryEventBus<FeedMessage>>>,
        catalog: Arc<InMemoryCatalog>,
        warehouse: WarehouseId,
        variant: VariantId,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(InMemoryCatalog::new());
        let warehouse = catalog.add_warehouse("WH-A");
        let variant = catalog.add_variant(ProductId::new(), "SKU-1", None);
        let feed = Arc::new(ChangeFeed::new(InMemoryEventBus::new()));
        let service = StockLedgerService::new(
            Arc::new(InMemoryLedgerStore::new()),
            catalog.clone(),
            feed.clone(),
            ServiceSettings::default(),
        );
        Fixture {
            service,
            feed,
            catalog,
            warehouse,
            variant,
        }
    }

    fn inbound(f: &Fixture, quantity: i64) -> StockEventRequest {
        StockEventRequest::new(
            StockEventType::Inbound,
            f.warehouse,
            vec![RequestedLine::new(f.variant, quantity)],
        )
        .with_reason(ReasonCode::Purchase)
    }

    #[tokio::test]
    async fn recorded_events_move_the_balance_and_reach_the_feed() {
        let f = fixture();
        let subscription = f.feed.bus().subscribe();
        let actor = ActorId::new();

        let event = f.service.record_event(actor, inbound(&f, 10), None).await.unwrap();
        assert_eq!(event.lines[0].quantity, 10);
        assert_eq!(f.service.balance_of(f.warehouse, f.variant).await.unwrap(), 10);
        assert_eq!(f.service.get_event(event.id).await.unwrap(), event);
        assert_eq!(subscription.drain().len(), 1);
    }

    #[tokio::test]
    async fn outbound_beyond_the_balance_is_rejected() {
        let f = fixture();
        let actor = ActorId::new();
        f.service.record_event(actor, inbound(&f, 3), None).await.unwrap();

        let err = f
            .service
            .record_event(
                actor,
                StockEventRequest::new(
                    StockEventType::Outbound,
                    f.warehouse,
                    vec![RequestedLine::new(f.variant, 5)],
                ),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err.domain(),
            Some(&DomainError::insufficient_stock(f.warehouse, f.variant, 3, 5))
        );
        assert_eq!(f.service.balance_of(f.warehouse, f.variant).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn same_key_replays_without_a_second_event() {
        let f = fixture();
        let subscription = f.feed.bus().subscribe();
        let actor = ActorId::new();

        let first = f
            .service
            .record_event(actor, inbound(&f, 4), Some("receipt-9"))
            .await
            .unwrap();
        let second = f
            .service
            .record_event(actor, inbound(&f, 4), Some(" receipt-9 "))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.service.balance_of(f.warehouse, f.variant).await.unwrap(), 4);
        assert_eq!(subscription.drain().len(), 1);

        let err = f
            .service
            .record_event(actor, inbound(&f, 5), Some("receipt-9"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn keys_are_scoped_per_actor() {
        let f = fixture();

        f.service
            .record_event(ActorId::new(), inbound(&f, 2), Some("shared"))
            .await
            .unwrap();
        f.service
            .record_event(ActorId::new(), inbound(&f, 2), Some("shared"))
            .await
            .unwrap();

        assert_eq!(f.service.balance_of(f.warehouse, f.variant).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn catalog_rules_apply_before_the_store() {
        let f = fixture();
        let actor = ActorId::new();

        let unknown_warehouse = StockEventRequest::new(
            StockEventType::Inbound,
            WarehouseId::new(),
            vec![RequestedLine::new(f.variant, 1)],
        );
        let err = f.service.record_event(actor, unknown_warehouse, None).await.unwrap_err();
        assert_eq!(err.http_status(), 404);

        let yesterday = Utc::now().date_naive() - Duration::days(1);
        let expired = f.catalog.add_variant(ProductId::new(), "YOGURT", Some(yesterday));
        let move_expired = StockEventRequest::new(
            StockEventType::Inbound,
            f.warehouse,
            vec![RequestedLine::new(expired, 1)],
        );
        let err = f.service.record_event(actor, move_expired, None).await.unwrap_err();
        assert_eq!(
            err.domain(),
            Some(&DomainError::validation("expired-item-movement-blocked"))
        );
    }

    #[tokio::test]
    async fn history_starts_from_earlier_changes() {
        let f = fixture();
        let actor = ActorId::new();
        let day = |d: u32| {
            NaiveDate::from_ymd_opt(2026, 2, d)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap()
                .and_utc()
        };

        for (d, quantity) in [(1, 5), (2, 7), (3, 2)] {
            f.service
                .record_event(actor, inbound(&f, quantity).occurred_at(day(d)), None)
                .await
                .unwrap();
        }

        let page = f
            .service
            .history(f.warehouse, f.variant, Some(day(2)), None, &PageParams::default())
            .await
            .unwrap();

        assert_eq!(page.total_elements, 2);
        assert_eq!(page.content[0].balance_before, 5);
        assert_eq!(page.content[1].balance_after, 14);

        let err = f
            .service
            .history(f.warehouse, f.variant, Some(day(3)), Some(day(1)), &PageParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::validation("invalid-range")));
    }

    #[tokio::test]
    async fn out_of_range_adjust_is_rejected_and_the_store_keeps_working() {
        let f = fixture();
        let actor = ActorId::new();
        f.service.record_event(actor, inbound(&f, 5), None).await.unwrap();

        let err = f
            .service
            .record_event(
                actor,
                StockEventRequest::new(
                    StockEventType::Adjust,
                    f.warehouse,
                    vec![RequestedLine::new(f.variant, i64::MIN)],
                ),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::validation("quantity-out-of-range")));

        f.service.record_event(actor, inbound(&f, 1), None).await.unwrap();
        assert_eq!(f.service.balance_of(f.warehouse, f.variant).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn inactive_products_and_variants_have_distinct_codes() {
        let f = fixture();
        let actor = ActorId::new();
        let shelved = f.catalog.add_variant(ProductId::new(), "SKU-OLD", None);
        let mut variant = f.catalog.variant(shelved).await.unwrap().unwrap();
        variant.product_active = false;
        f.catalog.upsert_variant(variant.clone());

        let request = || {
            StockEventRequest::new(
                StockEventType::Inbound,
                f.warehouse,
                vec![RequestedLine::new(shelved, 1)],
            )
        };
        let err = f.service.record_event(actor, request(), None).await.unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::validation("product-inactive")));

        variant.active = false;
        f.catalog.upsert_variant(variant);
        let err = f.service.record_event(actor, request(), None).await.unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::validation("variant-inactive")));
    }
}
