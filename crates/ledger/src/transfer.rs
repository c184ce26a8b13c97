use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockshift_core::{
    ActorId, Aggregate, AggregateRoot, DomainError, DomainResult, ResourceKind, StockEventId,
    TransferId, VariantId, WarehouseId,
};
use stockshift_events::Event;

use crate::paging::sort_fields;
use crate::stock_event::{
    ReasonCode, RecordStockEvent, RequestedLine, StockEvent, StockEventType,
    ensure_distinct_variants, ensure_notes_len, normalize_notes,
};

/// Transfer status lifecycle: DRAFT → CONFIRMED | CANCELED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Draft,
    Confirmed,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Confirmed | TransferStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Draft => "DRAFT",
            TransferStatus::Confirmed => "CONFIRMED",
            TransferStatus::Canceled => "CANCELED",
        }
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TransferStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(TransferStatus::Draft),
            "CONFIRMED" => Ok(TransferStatus::Confirmed),
            "CANCELED" => Ok(TransferStatus::Canceled),
            _ => Err(DomainError::validation("invalid-transfer-status")),
        }
    }
}

/// Units of a variant moved from origin to destination (always > 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub variant_id: VariantId,
    pub quantity: i64,
}

impl TransferLine {
    pub fn new(variant_id: VariantId, quantity: i64) -> Self {
        Self {
            variant_id,
            quantity,
        }
    }
}

/// Aggregate root: Transfer.
///
/// Stored as a mutable row; state changes still go through `handle`/`apply`
/// so stores share one set of transition rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub origin_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    pub status: TransferStatus,
    pub occurred_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub created_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
    pub confirmed_by: Option<ActorId>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<ActorId>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub outbound_event_id: Option<StockEventId>,
    pub inbound_event_id: Option<StockEventId>,
    pub lines: Vec<TransferLine>,
    pub version: u64,
}

impl Transfer {
    /// Create an empty, not-yet-drafted aggregate instance.
    pub fn empty(id: TransferId) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id,
            origin_warehouse_id: WarehouseId::from_uuid(Uuid::nil()),
            destination_warehouse_id: WarehouseId::from_uuid(Uuid::nil()),
            status: TransferStatus::Draft,
            occurred_at: epoch,
            notes: None,
            created_by: None,
            created_at: epoch,
            confirmed_by: None,
            confirmed_at: None,
            canceled_by: None,
            canceled_at: None,
            outbound_event_id: None,
            inbound_event_id: None,
            lines: Vec::new(),
            version: 0,
        }
    }

    pub fn is_created(&self) -> bool {
        self.version > 0
    }

    pub fn variant_ids(&self) -> impl Iterator<Item = VariantId> + '_ {
        self.lines.iter().map(|line| line.variant_id)
    }

    /// Build the two ledger legs realizing this transfer.
    ///
    /// Both legs reuse the transfer's business time and carry reason OTHER
    /// with notes naming the counterpart warehouse.
    pub fn ledger_legs(&self, legs: &LegSpec) -> DomainResult<(StockEvent, StockEvent)> {
        let lines: Vec<RequestedLine> = self
            .lines
            .iter()
            .map(|line| RequestedLine::new(line.variant_id, line.quantity))
            .collect();

        let outbound = RecordStockEvent {
            event_type: StockEventType::Outbound,
            warehouse_id: self.origin_warehouse_id,
            reason_code: Some(ReasonCode::Other),
            notes: Some(format!("Transfer #{} to {}", self.id, legs.destination_code)),
            occurred_at: self.occurred_at,
            lines: lines.clone(),
        }
        .into_event(legs.outbound_event_id, legs.actor, legs.at, None)?;

        let inbound = RecordStockEvent {
            event_type: StockEventType::Inbound,
            warehouse_id: self.destination_warehouse_id,
            reason_code: Some(ReasonCode::Other),
            notes: Some(format!("Transfer #{} from {}", self.id, legs.origin_code)),
            occurred_at: self.occurred_at,
            lines,
        }
        .into_event(legs.inbound_event_id, legs.actor, legs.at, None)?;

        Ok((outbound, inbound))
    }
}

/// Inputs for [`Transfer::ledger_legs`] resolved outside the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegSpec {
    pub outbound_event_id: StockEventId,
    pub inbound_event_id: StockEventId,
    pub origin_code: String,
    pub destination_code: String,
    pub actor: ActorId,
    pub at: DateTime<Utc>,
}

impl AggregateRoot for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateTransferDraft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferDraft {
    pub transfer_id: TransferId,
    pub origin_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    pub lines: Vec<TransferLine>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

impl CreateTransferDraft {
    /// Payload checks that need no catalog or ledger state.
    pub fn validate(&self) -> DomainResult<()> {
        if self.origin_warehouse_id == self.destination_warehouse_id {
            return Err(DomainError::validation("same-warehouse"));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation("empty-lines"));
        }
        if self.lines.iter().any(|line| line.quantity <= 0) {
            return Err(DomainError::validation("quantity-must-be-positive"));
        }
        ensure_distinct_variants(self.lines.iter().map(|line| line.variant_id))?;
        ensure_notes_len(self.notes.as_deref())
    }
}

/// Command: ConfirmTransfer (event ids are allocated by the caller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmTransfer {
    pub transfer_id: TransferId,
    pub outbound_event_id: StockEventId,
    pub inbound_event_id: StockEventId,
    pub confirmed_by: ActorId,
    pub confirmed_at: DateTime<Utc>,
}

/// Command: CancelTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub transfer_id: TransferId,
    pub canceled_by: ActorId,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    CreateDraft(CreateTransferDraft),
    Confirm(ConfirmTransfer),
    Cancel(CancelTransfer),
}

/// Event: TransferDrafted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDrafted {
    pub transfer_id: TransferId,
    pub origin_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    pub lines: Vec<TransferLine>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

/// Event: TransferConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfirmed {
    pub transfer_id: TransferId,
    pub outbound_event_id: StockEventId,
    pub inbound_event_id: StockEventId,
    pub confirmed_by: ActorId,
    pub confirmed_at: DateTime<Utc>,
}

/// Event: TransferCanceled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCanceled {
    pub transfer_id: TransferId,
    pub canceled_by: ActorId,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Drafted(TransferDrafted),
    Confirmed(TransferConfirmed),
    Canceled(TransferCanceled),
}

impl TransferEvent {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            TransferEvent::Drafted(e) => e.transfer_id,
            TransferEvent::Confirmed(e) => e.transfer_id,
            TransferEvent::Canceled(e) => e.transfer_id,
        }
    }
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::Drafted(_) => "stock.transfer.drafted",
            TransferEvent::Confirmed(_) => "stock.transfer.confirmed",
            TransferEvent::Canceled(_) => "stock.transfer.canceled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::Drafted(e) => e.occurred_at,
            TransferEvent::Confirmed(e) => e.confirmed_at,
            TransferEvent::Canceled(e) => e.canceled_at,
        }
    }

    fn stream_id(&self) -> Uuid {
        *self.transfer_id().as_uuid()
    }

    fn stream_type(&self) -> &'static str {
        "stock.transfer"
    }
}

impl Aggregate for Transfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Drafted(e) => {
                self.id = e.transfer_id;
                self.origin_warehouse_id = e.origin_warehouse_id;
                self.destination_warehouse_id = e.destination_warehouse_id;
                self.status = TransferStatus::Draft;
                self.occurred_at = e.occurred_at;
                self.notes = e.notes.clone();
                self.created_by = Some(e.created_by);
                self.created_at = e.created_at;
                self.lines = e.lines.clone();
            }
            TransferEvent::Confirmed(e) => {
                self.status = TransferStatus::Confirmed;
                self.confirmed_by = Some(e.confirmed_by);
                self.confirmed_at = Some(e.confirmed_at);
                self.outbound_event_id = Some(e.outbound_event_id);
                self.inbound_event_id = Some(e.inbound_event_id);
            }
            TransferEvent::Canceled(e) => {
                self.status = TransferStatus::Canceled;
                self.canceled_by = Some(e.canceled_by);
                self.canceled_at = Some(e.canceled_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferCommand::CreateDraft(cmd) => self.handle_create(cmd),
            TransferCommand::Confirm(cmd) => self.handle_confirm(cmd),
            TransferCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Transfer {
    fn ensure_transfer_id(&self, transfer_id: TransferId) -> Result<(), DomainError> {
        if self.id != transfer_id {
            return Err(DomainError::not_found(ResourceKind::Transfer, transfer_id));
        }
        Ok(())
    }

    fn ensure_draft(&self, transfer_id: TransferId, action: &str) -> Result<(), DomainError> {
        if !self.is_created() {
            return Err(DomainError::not_found(ResourceKind::Transfer, transfer_id));
        }
        self.ensure_transfer_id(transfer_id)?;
        if self.status != TransferStatus::Draft {
            return Err(DomainError::invalid_transition(self.status, action));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateTransferDraft) -> Result<Vec<TransferEvent>, DomainError> {
        if self.is_created() {
            return Err(DomainError::invalid_transition(self.status, "create"));
        }
        cmd.validate()?;

        Ok(vec![TransferEvent::Drafted(TransferDrafted {
            transfer_id: cmd.transfer_id,
            origin_warehouse_id: cmd.origin_warehouse_id,
            destination_warehouse_id: cmd.destination_warehouse_id,
            lines: cmd.lines.clone(),
            notes: normalize_notes(cmd.notes.clone()),
            occurred_at: cmd.occurred_at,
            created_by: cmd.created_by,
            created_at: cmd.created_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_draft(cmd.transfer_id, "confirm")?;

        Ok(vec![TransferEvent::Confirmed(TransferConfirmed {
            transfer_id: cmd.transfer_id,
            outbound_event_id: cmd.outbound_event_id,
            inbound_event_id: cmd.inbound_event_id,
            confirmed_by: cmd.confirmed_by,
            confirmed_at: cmd.confirmed_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_draft(cmd.transfer_id, "cancel")?;

        Ok(vec![TransferEvent::Canceled(TransferCanceled {
            transfer_id: cmd.transfer_id,
            canceled_by: cmd.canceled_by,
            canceled_at: cmd.canceled_at,
        })])
    }
}

sort_fields! {
    /// Sortable properties of the transfer listing.
    TransferSortField { OccurredAt => "occurredAt", CreatedAt => "createdAt" }
    default OccurredAt Desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockshift_events::execute;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn draft_cmd(transfer_id: TransferId) -> CreateTransferDraft {
        CreateTransferDraft {
            transfer_id,
            origin_warehouse_id: WarehouseId::new(),
            destination_warehouse_id: WarehouseId::new(),
            lines: vec![TransferLine::new(VariantId::new(), 10)],
            notes: Some("restock".to_string()),
            occurred_at: test_time(),
            created_by: ActorId::new(),
            created_at: test_time(),
        }
    }

    fn drafted() -> Transfer {
        let id = TransferId::new();
        let mut transfer = Transfer::empty(id);
        execute(&mut transfer, &TransferCommand::CreateDraft(draft_cmd(id))).unwrap();
        transfer
    }

    fn confirm_cmd(transfer_id: TransferId) -> TransferCommand {
        TransferCommand::Confirm(ConfirmTransfer {
            transfer_id,
            outbound_event_id: StockEventId::new(),
            inbound_event_id: StockEventId::new(),
            confirmed_by: ActorId::new(),
            confirmed_at: test_time(),
        })
    }

    fn cancel_cmd(transfer_id: TransferId) -> TransferCommand {
        TransferCommand::Cancel(CancelTransfer {
            transfer_id,
            canceled_by: ActorId::new(),
            canceled_at: test_time(),
        })
    }

    #[test]
    fn create_draft_emits_drafted_event_without_event_ids() {
        let transfer = drafted();

        assert_eq!(transfer.status, TransferStatus::Draft);
        assert_eq!(transfer.version, 1);
        assert_eq!(transfer.outbound_event_id, None);
        assert_eq!(transfer.inbound_event_id, None);
        assert_eq!(transfer.lines.len(), 1);
    }

    #[test]
    fn same_origin_and_destination_is_rejected() {
        let id = TransferId::new();
        let mut cmd = draft_cmd(id);
        cmd.destination_warehouse_id = cmd.origin_warehouse_id;

        let err = Transfer::empty(id)
            .handle(&TransferCommand::CreateDraft(cmd))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) if msg == "same-warehouse" => {}
            _ => panic!("Expected Validation(same-warehouse)"),
        }
    }

    #[test]
    fn draft_lines_must_be_positive_and_present() {
        let id = TransferId::new();

        let mut cmd = draft_cmd(id);
        cmd.lines.clear();
        let err = Transfer::empty(id).handle(&TransferCommand::CreateDraft(cmd)).unwrap_err();
        assert_eq!(err, DomainError::validation("empty-lines"));

        let mut cmd = draft_cmd(id);
        cmd.lines[0].quantity = 0;
        let err = Transfer::empty(id).handle(&TransferCommand::CreateDraft(cmd)).unwrap_err();
        assert_eq!(err, DomainError::validation("quantity-must-be-positive"));
    }

    #[test]
    fn confirm_sets_both_event_ids_together() {
        let mut transfer = drafted();
        let id = transfer.id;

        let events = execute(&mut transfer, &confirm_cmd(id)).unwrap();

        match &events[0] {
            TransferEvent::Confirmed(e) => {
                assert_eq!(transfer.outbound_event_id, Some(e.outbound_event_id));
                assert_eq!(transfer.inbound_event_id, Some(e.inbound_event_id));
                assert_eq!(transfer.confirmed_by, Some(e.confirmed_by));
            }
            _ => panic!("Expected Confirmed event"),
        }
        assert_eq!(transfer.status, TransferStatus::Confirmed);
        assert!(transfer.status.is_terminal());
    }

    #[test]
    fn confirmed_transfers_cannot_be_confirmed_or_canceled_again() {
        let mut transfer = drafted();
        let id = transfer.id;
        execute(&mut transfer, &confirm_cmd(id)).unwrap();

        for (cmd, action) in [(confirm_cmd(id), "confirm"), (cancel_cmd(id), "cancel")] {
            let err = transfer.handle(&cmd).unwrap_err();
            match err {
                DomainError::InvalidStateTransition { from, action: a }
                    if from == "CONFIRMED" && a == action => {}
                other => panic!("Expected InvalidStateTransition, got {other:?}"),
            }
        }
    }

    #[test]
    fn canceled_transfers_cannot_be_confirmed() {
        let mut transfer = drafted();
        let id = transfer.id;
        execute(&mut transfer, &cancel_cmd(id)).unwrap();
        assert_eq!(transfer.status, TransferStatus::Canceled);
        assert_eq!(transfer.outbound_event_id, None);

        let before = transfer.clone();
        let err = execute(&mut transfer, &confirm_cmd(id)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert_eq!(transfer, before);
    }

    #[test]
    fn commands_on_missing_transfers_are_not_found() {
        let id = TransferId::new();
        let err = Transfer::empty(id).handle(&confirm_cmd(id)).unwrap_err();
        assert!(matches!(err, DomainError::NotFound { resource: ResourceKind::Transfer, .. }));
    }

    #[test]
    fn ledger_legs_mirror_the_lines_with_opposite_signs() {
        let transfer = drafted();
        let spec = LegSpec {
            outbound_event_id: StockEventId::new(),
            inbound_event_id: StockEventId::new(),
            origin_code: "WH-A".to_string(),
            destination_code: "WH-B".to_string(),
            actor: ActorId::new(),
            at: test_time(),
        };

        let (outbound, inbound) = transfer.ledger_legs(&spec).unwrap();

        assert_eq!(outbound.id, spec.outbound_event_id);
        assert_eq!(outbound.warehouse_id, transfer.origin_warehouse_id);
        assert_eq!(outbound.lines[0].quantity, -10);
        assert_eq!(outbound.notes.as_deref(), Some(format!("Transfer #{} to WH-B", transfer.id).as_str()));

        assert_eq!(inbound.id, spec.inbound_event_id);
        assert_eq!(inbound.warehouse_id, transfer.destination_warehouse_id);
        assert_eq!(inbound.lines[0].quantity, 10);
        assert_eq!(inbound.reason_code, Some(ReasonCode::Other));
        assert_eq!(inbound.occurred_at, transfer.occurred_at);
    }
}
