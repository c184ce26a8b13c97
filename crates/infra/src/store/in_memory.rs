use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use stockshift_core::{
    ActorId, Aggregate, DomainError, ResourceKind, StockEventId, TransferId, WarehouseId,
};
use stockshift_events::execute;
use stockshift_ledger::report::{
    aggregate_by_variant, low_stock_row, sort_low_stock, sort_snapshot,
};
use stockshift_ledger::{
    BalanceDrift, BalanceKey, BalanceSheet, CancelTransfer, CreateTransferDraft, EventSortField,
    HistoryEntry, LedgerMovement, LowStockRow, LowStockSortField, OccurredRange, Page, PageRequest,
    SnapshotRow, SnapshotSortField, Sort, SortDirection, StockEvent, Transfer, TransferCommand,
    TransferSortField, detect_drift, replay, replay_totals,
};

use crate::idempotency::{
    IdempotencyClaim, IdempotencyKey, IdempotencyRecord, IdempotencyStore, encode_response,
};

use super::keyed_lock::KeyedLocks;
use super::query::{
    AppendOutcome, ConfirmOutcome, ConfirmTransferRequest, EventFilter, SnapshotFilter,
    TransferChange, TransferFilter,
};
use super::r#trait::{LedgerStore, StoreError};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

type ClaimSlot = (ActorId, IdempotencyKey);

#[derive(Debug, Default)]
struct LedgerState {
    /// Committed events in sequence order.
    events: Vec<StockEvent>,
    positions: HashMap<StockEventId, usize>,
    balances: BTreeMap<BalanceKey, i64>,
    transfers: HashMap<TransferId, Transfer>,
    idempotency: HashMap<ClaimSlot, IdempotencyRecord>,
    last_sequence: u64,
}

impl LedgerState {
    fn sheet_for(&self, keys: &[BalanceKey]) -> BalanceSheet {
        keys.iter()
            .map(|key| (*key, self.balances.get(key).copied().unwrap_or(0)))
            .collect()
    }

    /// Allocate the next ledger position. An aborted write leaves a gap.
    fn next_sequence(&mut self) -> u64 {
        self.last_sequence += 1;
        self.last_sequence
    }

    fn push_event(&mut self, event: StockEvent) {
        self.positions.insert(event.id, self.events.len());
        self.events.push(event);
    }

    fn write_balances(&mut self, sheet: &BalanceSheet) {
        for (key, quantity) in sheet.balances() {
            self.balances.insert(*key, *quantity);
        }
    }

    /// Per-key balances as of `as_of` (log replay) or now (projection).
    fn balances_at(&self, as_of: Option<DateTime<Utc>>) -> BTreeMap<BalanceKey, i64> {
        match as_of {
            Some(as_of) => replay_totals(self.events.iter().filter(|e| e.occurred_at <= as_of)),
            None => self.balances.clone(),
        }
    }

    fn snapshot_rows(&self, filter: &SnapshotFilter) -> Vec<SnapshotRow> {
        let rows = self
            .balances_at(filter.as_of)
            .into_iter()
            .filter(|(key, _)| filter.selects(key.warehouse_id, key.variant_id))
            .map(|(key, quantity)| SnapshotRow {
                warehouse_id: Some(key.warehouse_id),
                variant_id: key.variant_id,
                quantity,
            });

        let mut rows: Vec<SnapshotRow> = if filter.aggregate_by_warehouse {
            aggregate_by_variant(rows)
        } else {
            rows.collect()
        };
        if !filter.include_zero {
            rows.retain(|row| row.quantity != 0);
        }
        rows
    }
}

/// In-memory ledger store.
///
/// State lives behind one `RwLock` that is only held for synchronous
/// sections; per-key async mutexes provide the same serialization and lock
/// timeout behaviour as row locks in Postgres.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
    claim_locks: KeyedLocks<ClaimSlot>,
    transfer_locks: KeyedLocks<TransferId>,
    balance_locks: KeyedLocks<BalanceKey>,
    lock_timeout: Duration,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            claim_locks: KeyedLocks::new(),
            transfer_locks: KeyedLocks::new(),
            balance_locks: KeyedLocks::new(),
            lock_timeout,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("ledger state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("ledger state lock poisoned".to_string()))
    }

    async fn lock_claim(
        &self,
        claim: Option<&IdempotencyClaim>,
    ) -> Result<Option<OwnedMutexGuard<()>>, StoreError> {
        match claim {
            Some(claim) => Ok(Some(
                self.claim_locks
                    .lock(&(claim.actor_id, claim.key.clone()), self.lock_timeout)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    fn existing_record(&self, claim: &IdempotencyClaim) -> Result<Option<IdempotencyRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .idempotency
            .get(&(claim.actor_id, claim.key.clone()))
            .cloned())
    }

    /// Test hook: overwrite a materialized balance without touching the log.
    #[cfg(test)]
    pub(crate) fn corrupt_balance(&self, key: BalanceKey, quantity: i64) {
        if let Ok(mut state) = self.state.write() {
            state.balances.insert(key, quantity);
        }
    }
}

fn event_order(sort: Sort<EventSortField>) -> impl Fn(&StockEvent, &StockEvent) -> Ordering {
    move |a, b| {
        let primary = match sort.field {
            EventSortField::OccurredAt => a.occurred_at.cmp(&b.occurred_at),
            EventSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        sort.direction
            .apply(primary.then_with(|| a.sequence.cmp(&b.sequence)))
    }
}

fn transfer_order(sort: Sort<TransferSortField>) -> impl Fn(&Transfer, &Transfer) -> Ordering {
    move |a, b| {
        let primary = match sort.field {
            TransferSortField::OccurredAt => a.occurred_at.cmp(&b.occurred_at),
            TransferSortField::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        sort.direction.apply(primary.then_with(|| a.id.cmp(&b.id)))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryLedgerStore {
    async fn find_idempotency(
        &self,
        actor_id: ActorId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let state = self.read()?;
        Ok(state.idempotency.get(&(actor_id, key.clone())).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| !record.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append_event(
        &self,
        event: StockEvent,
        claim: Option<IdempotencyClaim>,
    ) -> Result<AppendOutcome, StoreError> {
        let _claim_guard = self.lock_claim(claim.as_ref()).await?;
        if let Some(claim) = &claim {
            if let Some(record) = self.existing_record(claim)? {
                claim.check_replay(&record)?;
                return Ok(AppendOutcome::Replayed(record.replay()?));
            }
        }

        let keys = event.balance_keys();
        let _balance_guards = self.balance_locks.lock_all(keys.clone(), self.lock_timeout).await?;

        let mut state = self.write()?;
        let mut sheet = state.sheet_for(&keys);
        sheet.apply(&event)?;

        let mut event = event;
        event.sequence = state.next_sequence();
        let record = match claim {
            Some(claim) => Some(claim.into_record(*event.id.as_uuid(), encode_response(&event)?)),
            None => None,
        };

        state.write_balances(&sheet);
        state.push_event(event.clone());
        if let Some(record) = record {
            state
                .idempotency
                .insert((record.actor_id, record.key.clone()), record);
        }

        Ok(AppendOutcome::Created(event))
    }

    async fn get_event(&self, id: StockEventId) -> Result<Option<StockEvent>, StoreError> {
        let state = self.read()?;
        Ok(state.positions.get(&id).map(|&pos| state.events[pos].clone()))
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        page: PageRequest,
        sort: Sort<EventSortField>,
    ) -> Result<Page<StockEvent>, StoreError> {
        let state = self.read()?;
        let mut events: Vec<StockEvent> = state
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by(event_order(sort));
        Ok(Page::from_sorted(events, page))
    }

    async fn balance_of(&self, key: BalanceKey) -> Result<i64, StoreError> {
        let state = self.read()?;
        Ok(state.balances.get(&key).copied().unwrap_or(0))
    }

    async fn history(
        &self,
        key: BalanceKey,
        range: &OccurredRange,
        page: PageRequest,
        direction: SortDirection,
    ) -> Result<Page<HistoryEntry>, StoreError> {
        let movements: Vec<LedgerMovement> = {
            let state = self.read()?;
            state
                .events
                .iter()
                .filter_map(|event| LedgerMovement::from_event(event, &key))
                .collect()
        };

        let mut entries = replay(key, movements, range);
        if !direction.is_ascending() {
            entries.reverse();
        }
        Ok(Page::from_sorted(entries, page))
    }

    async fn verify_balances(&self) -> Result<Vec<BalanceDrift>, StoreError> {
        let state = self.read()?;
        Ok(detect_drift(&state.balances, &replay_totals(&state.events)))
    }

    async fn rebuild_balances(&self) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        state.balances = replay_totals(&state.events);
        Ok(state.balances.len() as u64)
    }

    async fn create_transfer(
        &self,
        command: CreateTransferDraft,
    ) -> Result<TransferChange, StoreError> {
        let mut state = self.write()?;
        let mut transfer = state
            .transfers
            .get(&command.transfer_id)
            .cloned()
            .unwrap_or_else(|| Transfer::empty(command.transfer_id));

        let events = execute(&mut transfer, &TransferCommand::CreateDraft(command))?;
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(TransferChange { transfer, events })
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let state = self.read()?;
        Ok(state.transfers.get(&id).cloned())
    }

    async fn list_transfers(
        &self,
        filter: &TransferFilter,
        page: PageRequest,
        sort: Sort<TransferSortField>,
    ) -> Result<Page<Transfer>, StoreError> {
        let state = self.read()?;
        let mut transfers: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|transfer| filter.matches(transfer))
            .cloned()
            .collect();
        transfers.sort_by(transfer_order(sort));
        Ok(Page::from_sorted(transfers, page))
    }

    async fn confirm_transfer(
        &self,
        request: ConfirmTransferRequest,
    ) -> Result<ConfirmOutcome, StoreError> {
        let _claim_guard = self.lock_claim(request.claim.as_ref()).await?;
        if let Some(claim) = &request.claim {
            if let Some(record) = self.existing_record(claim)? {
                claim.check_replay(&record)?;
                return Ok(ConfirmOutcome::Replayed(record.replay()?));
            }
        }

        let _transfer_guard = self
            .transfer_locks
            .lock(&request.transfer_id, self.lock_timeout)
            .await?;

        let (transfer, plan) = {
            let state = self.read()?;
            let transfer = state
                .transfers
                .get(&request.transfer_id)
                .cloned()
                .ok_or_else(|| DomainError::not_found(ResourceKind::Transfer, request.transfer_id))?;
            let plan = request.plan(&transfer)?;
            (transfer, plan)
        };

        let keys = plan.balance_keys();
        let _balance_guards = self.balance_locks.lock_all(keys.clone(), self.lock_timeout).await?;

        let mut state = self.write()?;
        let mut sheet = state.sheet_for(&keys);
        sheet.apply(&plan.outbound)?;
        sheet.apply(&plan.inbound)?;

        let mut transfer = transfer;
        for event in &plan.events {
            transfer.apply(event);
        }

        let mut outbound = plan.outbound;
        let mut inbound = plan.inbound;
        outbound.sequence = state.next_sequence();
        inbound.sequence = state.next_sequence();

        let record = match request.claim {
            Some(claim) => Some(claim.into_record(*transfer.id.as_uuid(), encode_response(&transfer)?)),
            None => None,
        };

        state.write_balances(&sheet);
        state.push_event(outbound.clone());
        state.push_event(inbound.clone());
        state.transfers.insert(transfer.id, transfer.clone());
        if let Some(record) = record {
            state
                .idempotency
                .insert((record.actor_id, record.key.clone()), record);
        }

        Ok(ConfirmOutcome::Confirmed {
            transfer,
            outbound,
            inbound,
            events: plan.events,
        })
    }

    async fn cancel_transfer(&self, command: CancelTransfer) -> Result<TransferChange, StoreError> {
        let _transfer_guard = self
            .transfer_locks
            .lock(&command.transfer_id, self.lock_timeout)
            .await?;

        let mut state = self.write()?;
        let mut transfer = state
            .transfers
            .get(&command.transfer_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(ResourceKind::Transfer, command.transfer_id))?;

        let events = execute(&mut transfer, &TransferCommand::Cancel(command))?;
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(TransferChange { transfer, events })
    }

    async fn snapshot(
        &self,
        filter: &SnapshotFilter,
        page: PageRequest,
        sort: Sort<SnapshotSortField>,
    ) -> Result<Page<SnapshotRow>, StoreError> {
        let mut rows = self.read()?.snapshot_rows(filter);
        sort_snapshot(&mut rows, sort);
        Ok(Page::from_sorted(rows, page))
    }

    async fn low_stock(
        &self,
        warehouse_id: Option<WarehouseId>,
        threshold: i64,
        page: PageRequest,
        sort: Sort<LowStockSortField>,
    ) -> Result<Page<LowStockRow>, StoreError> {
        let mut rows: Vec<LowStockRow> = {
            let state = self.read()?;
            state
                .balances
                .iter()
                .filter(|(key, _)| warehouse_id.is_none_or(|w| w == key.warehouse_id))
                .filter_map(|(key, quantity)| {
                    low_stock_row(key.warehouse_id, key.variant_id, *quantity, threshold)
                })
                .collect()
        };
        sort_low_stock(&mut rows, sort);
        Ok(Page::from_sorted(rows, page))
    }

    async fn balances_for(&self, filter: &SnapshotFilter) -> Result<Vec<SnapshotRow>, StoreError> {
        Ok(self.read()?.snapshot_rows(filter))
    }
}
