//! Transfer orchestration: DRAFT → CONFIRMED | CANCELED.
//!
//! A draft reserves nothing. Confirmation posts the OUTBOUND leg at the
//! origin and the INBOUND leg at the destination in the same unit of work as
//! the status change, so a failed leg leaves the transfer in DRAFT with no
//! ledger effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use stockshift_core::{ActorId, DomainError, ResourceKind, StockEventId, TransferId, WarehouseId};
use stockshift_events::EventBus;
use stockshift_ledger::{
    CancelTransfer, CreateTransferDraft, OccurredRange, Page, Transfer, TransferLine,
    TransferSortField, TransferStatus,
};

use crate::catalog::Catalog;
use crate::idempotency::{
    IdempotencyClaim, IdempotencyKey, IdempotencyScope, transfer_confirm_fingerprint,
};
use crate::retry::retry_transient;
use crate::store::{ConfirmOutcome, ConfirmTransferRequest, LedgerStore, TransferFilter};

use super::{
    ChangeFeed, FeedMessage, PageParams, ServiceResult, ServiceSettings, active_warehouse,
    movable_variant,
};

/// A planned movement between two warehouses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDraftRequest {
    pub origin_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    pub lines: Vec<TransferLine>,
    /// Business time of both legs; defaults to the time of drafting.
    pub occurred_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl TransferDraftRequest {
    pub fn new(origin: WarehouseId, destination: WarehouseId, lines: Vec<TransferLine>) -> Self {
        Self {
            origin_warehouse_id: origin,
            destination_warehouse_id: destination,
            lines,
            occurred_at: None,
            notes: None,
        }
    }
}

pub struct TransferService<S, C, B> {
    store: Arc<S>,
    catalog: Arc<C>,
    feed: Arc<ChangeFeed<B>>,
    settings: ServiceSettings,
}

impl<S, C, B> TransferService<S, C, B>
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

    /// Create a DRAFT transfer. Stock is not checked until confirmation.
    #[instrument(
        skip(self, request),
        fields(
            actor_id = %actor,
            origin = %request.origin_warehouse_id,
            destination = %request.destination_warehouse_id
        ),
        err
    )]
    pub async fn create_draft(
        &self,
        actor: ActorId,
        request: TransferDraftRequest,
    ) -> ServiceResult<Transfer> {
        let now = Utc::now();
        let command = CreateTransferDraft {
            transfer_id: TransferId::new(),
            origin_warehouse_id: request.origin_warehouse_id,
            destination_warehouse_id: request.destination_warehouse_id,
            lines: request.lines,
            notes: request.notes,
            occurred_at: request.occurred_at.unwrap_or(now),
            created_by: actor,
            created_at: now,
        };
        command.validate()?;

        active_warehouse(self.catalog.as_ref(), command.origin_warehouse_id).await?;
        active_warehouse(self.catalog.as_ref(), command.destination_warehouse_id).await?;
        for line in &command.lines {
            self.catalog
                .variant(line.variant_id)
                .await?
                .ok_or_else(|| DomainError::not_found(ResourceKind::Variant, line.variant_id))?
                .ensure_active()?;
        }

        let change = retry_transient(&self.settings.retry, "create_transfer", || {
            self.store.create_transfer(command.clone())
        })
        .await?;

        info!(transfer_id = %change.transfer.id, "transfer drafted");
        self.feed.transfer_events(&change.transfer, &change.events);
        Ok(change.transfer)
    }

    /// Confirm a DRAFT transfer, posting both ledger legs atomically.
    ///
    /// A key already bound to this transfer returns the stored CONFIRMED
    /// transfer; bound to another transfer it is an idempotency conflict.
    #[instrument(skip(self, idempotency_key), fields(actor_id = %actor, transfer_id = %transfer_id), err)]
    pub async fn confirm(
        &self,
        actor: ActorId,
        transfer_id: TransferId,
        idempotency_key: Option<&str>,
    ) -> ServiceResult<Transfer> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let now = Utc::now();

        let claim = key.map(|key| {
            IdempotencyClaim::new(
                actor,
                key,
                IdempotencyScope::TransferConfirm,
                transfer_confirm_fingerprint(transfer_id),
                &self.settings.idempotency,
                now,
            )
        });

        if let Some(claim) = &claim {
            if let Some(existing) = self.store.find_idempotency(actor, &claim.key).await? {
                claim.check_replay(&existing)?;
                info!(key = %claim.key, "replaying stored transfer confirmation");
                return Ok(existing.replay()?);
            }
        }

        let transfer = self.get(transfer_id).await?;
        if transfer.status != TransferStatus::Draft {
            return Err(DomainError::invalid_transition(transfer.status, "confirm").into());
        }

        let origin = active_warehouse(self.catalog.as_ref(), transfer.origin_warehouse_id).await?;
        let destination =
            active_warehouse(self.catalog.as_ref(), transfer.destination_warehouse_id).await?;

        // Both legs share the transfer's business date.
        let business_date = transfer.occurred_at.date_naive();
        for variant_id in transfer.variant_ids() {
            movable_variant(self.catalog.as_ref(), variant_id, business_date, false).await?;
        }

        let request = ConfirmTransferRequest {
            transfer_id,
            outbound_event_id: StockEventId::new(),
            inbound_event_id: StockEventId::new(),
            confirmed_by: actor,
            confirmed_at: now,
            origin_code: origin.code,
            destination_code: destination.code,
            claim,
        };

        let outcome = retry_transient(&self.settings.retry, "confirm_transfer", || {
            self.store.confirm_transfer(request.clone())
        })
        .await?;

        match outcome {
            ConfirmOutcome::Confirmed {
                transfer,
                outbound,
                inbound,
                events,
            } => {
                info!(
                    outbound_event_id = %outbound.id,
                    inbound_event_id = %inbound.id,
                    "transfer confirmed"
                );
                self.feed.stock_event(&outbound);
                self.feed.stock_event(&inbound);
                self.feed.transfer_events(&transfer, &events);
                Ok(transfer)
            }
            ConfirmOutcome::Replayed(transfer) => {
                info!("transfer confirmation replayed after claim race");
                Ok(transfer)
            }
        }
    }

    #[instrument(skip(self), fields(actor_id = %actor, transfer_id = %transfer_id), err)]
    pub async fn cancel(&self, actor: ActorId, transfer_id: TransferId) -> ServiceResult<Transfer> {
        let command = CancelTransfer {
            transfer_id,
            canceled_by: actor,
            canceled_at: Utc::now(),
        };

        let change = retry_transient(&self.settings.retry, "cancel_transfer", || {
            self.store.cancel_transfer(command.clone())
        })
        .await?;

        info!("transfer canceled");
        self.feed.transfer_events(&change.transfer, &change.events);
        Ok(change.transfer)
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, transfer_id: TransferId) -> ServiceResult<Transfer> {
        self.store
            .get_transfer(transfer_id)
            .await?
            .ok_or_else(|| DomainError::not_found(ResourceKind::Transfer, transfer_id).into())
    }

    #[instrument(skip(self, filter), err)]
    pub async fn list(
        &self,
        filter: &TransferFilter,
        params: &PageParams,
    ) -> ServiceResult<Page<Transfer>> {
        OccurredRange::new(filter.range.from, filter.range.to)?;
        let (page, sort) = params.resolve::<TransferSortField>(&self.settings.limits)?;
        Ok(self.store.list_transfers(filter, page, sort).await?)
    }
}
