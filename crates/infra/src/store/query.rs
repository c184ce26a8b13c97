//! Filters and outcomes exchanged with [`LedgerStore`](super::LedgerStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockshift_core::{
    ActorId, Aggregate, DomainResult, StockEventId, TransferId, VariantId, WarehouseId,
};
use stockshift_ledger::{
    BalanceKey, ConfirmTransfer, LegSpec, OccurredRange, ReasonCode, StockEvent, StockEventType,
    Transfer, TransferCommand, TransferEvent, TransferStatus,
};

use crate::idempotency::IdempotencyClaim;

/// Filter criteria for the event listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<StockEventType>,
    pub warehouse_id: Option<WarehouseId>,
    /// Events with at least one line for this variant.
    pub variant_id: Option<VariantId>,
    pub reason_code: Option<ReasonCode>,
    pub range: OccurredRange,
}

impl EventFilter {
    pub fn matches(&self, event: &StockEvent) -> bool {
        self.event_type.is_none_or(|t| t == event.event_type)
            && self.warehouse_id.is_none_or(|w| w == event.warehouse_id)
            && self
                .variant_id
                .is_none_or(|v| event.lines.iter().any(|line| line.variant_id == v))
            && self.reason_code.is_none_or(|r| event.reason_code == Some(r))
            && self.range.contains(event.occurred_at)
    }
}

/// Filter criteria for the transfer listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFilter {
    pub status: Option<TransferStatus>,
    pub origin_warehouse_id: Option<WarehouseId>,
    pub destination_warehouse_id: Option<WarehouseId>,
    pub range: OccurredRange,
}

impl TransferFilter {
    pub fn matches(&self, transfer: &Transfer) -> bool {
        self.status.is_none_or(|s| s == transfer.status)
            && self
                .origin_warehouse_id
                .is_none_or(|w| w == transfer.origin_warehouse_id)
            && self
                .destination_warehouse_id
                .is_none_or(|w| w == transfer.destination_warehouse_id)
            && self.range.contains(transfer.occurred_at)
    }
}

/// Which balances a snapshot reads and how it shapes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    pub warehouse_id: Option<WarehouseId>,
    /// Restrict to these variants; `Some(vec![])` selects nothing.
    pub variant_ids: Option<Vec<VariantId>>,
    pub include_zero: bool,
    pub aggregate_by_warehouse: bool,
    /// Compute from the log up to this instant instead of the projection.
    pub as_of: Option<DateTime<Utc>>,
}

impl SnapshotFilter {
    pub fn selects(&self, warehouse_id: WarehouseId, variant_id: VariantId) -> bool {
        self.warehouse_id.is_none_or(|w| w == warehouse_id)
            && self
                .variant_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&variant_id))
    }
}

/// Result of appending a stock event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Created(StockEvent),
    /// The idempotency key matched an earlier request; nothing was written.
    Replayed(StockEvent),
}

impl AppendOutcome {
    pub fn event(&self) -> &StockEvent {
        match self {
            AppendOutcome::Created(event) | AppendOutcome::Replayed(event) => event,
        }
    }

    pub fn into_event(self) -> StockEvent {
        match self {
            AppendOutcome::Created(event) | AppendOutcome::Replayed(event) => event,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, AppendOutcome::Replayed(_))
    }
}

/// Everything the store needs to realize a transfer confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmTransferRequest {
    pub transfer_id: TransferId,
    pub outbound_event_id: StockEventId,
    pub inbound_event_id: StockEventId,
    pub confirmed_by: ActorId,
    pub confirmed_at: DateTime<Utc>,
    pub origin_code: String,
    pub destination_code: String,
    pub claim: Option<IdempotencyClaim>,
}

impl ConfirmTransferRequest {
    pub fn command(&self) -> ConfirmTransfer {
        ConfirmTransfer {
            transfer_id: self.transfer_id,
            outbound_event_id: self.outbound_event_id,
            inbound_event_id: self.inbound_event_id,
            confirmed_by: self.confirmed_by,
            confirmed_at: self.confirmed_at,
        }
    }

    /// Decide the confirmation against the locked transfer: the state
    /// transition plus both ledger legs, still unapplied.
    pub fn plan(&self, transfer: &Transfer) -> DomainResult<ConfirmationPlan> {
        let events = transfer.handle(&TransferCommand::Confirm(self.command()))?;
        let (outbound, inbound) = transfer.ledger_legs(&LegSpec {
            outbound_event_id: self.outbound_event_id,
            inbound_event_id: self.inbound_event_id,
            origin_code: self.origin_code.clone(),
            destination_code: self.destination_code.clone(),
            actor: self.confirmed_by,
            at: self.confirmed_at,
        })?;
        Ok(ConfirmationPlan {
            events,
            outbound,
            inbound,
        })
    }
}

/// The writes a confirmation will make once its balance keys are locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationPlan {
    pub events: Vec<TransferEvent>,
    pub outbound: StockEvent,
    pub inbound: StockEvent,
}

impl ConfirmationPlan {
    /// Balance keys of both legs, sorted and deduplicated.
    pub fn balance_keys(&self) -> Vec<BalanceKey> {
        let mut keys = self.outbound.balance_keys();
        keys.extend(self.inbound.balance_keys());
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Result of a transfer confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed {
        transfer: Transfer,
        outbound: StockEvent,
        inbound: StockEvent,
        events: Vec<TransferEvent>,
    },
    /// The idempotency key was already bound to this transfer.
    Replayed(Transfer),
}

impl ConfirmOutcome {
    pub fn transfer(&self) -> &Transfer {
        match self {
            ConfirmOutcome::Confirmed { transfer, .. } | ConfirmOutcome::Replayed(transfer) => {
                transfer
            }
        }
    }
}

/// A transfer after a state change, with the domain events that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferChange {
    pub transfer: Transfer,
    pub events: Vec<TransferEvent>,
}
