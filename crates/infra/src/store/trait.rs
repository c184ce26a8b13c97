use async_trait::async_trait;
use thiserror::Error;

use stockshift_core::{DomainError, StockEventId, TransferId, WarehouseId};
use stockshift_ledger::{
    BalanceDrift, BalanceKey, EventSortField, HistoryEntry, LowStockRow, LowStockSortField,
    OccurredRange, Page, PageRequest, SnapshotRow, SnapshotSortField, Sort, SortDirection,
    StockEvent, Transfer, TransferSortField,
};
use stockshift_ledger::transfer::{CancelTransfer, CreateTransferDraft};

use crate::idempotency::{IdempotencyClaim, IdempotencyStore};

use super::query::{
    AppendOutcome, ConfirmOutcome, ConfirmTransferRequest, EventFilter, SnapshotFilter,
    TransferChange, TransferFilter,
};

/// Ledger store operation error.
///
/// Business rejections travel as [`StoreError::Domain`]. The remaining
/// variants are infrastructure failures; only `LockTimeout` and `Transient`
/// are worth retrying.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    /// Serialization failure, deadlock or pool exhaustion.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_) | StoreError::Transient(_))
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            StoreError::Domain(err) => Some(err),
            _ => None,
        }
    }
}

/// Transactional stock ledger store.
///
/// Every mutating method is one atomic unit of work: it either commits all of
/// its writes (events, balances, transfer row, idempotency record) or none.
///
/// ## Locking
///
/// Writers lock, in this order: the idempotency slot `(actor, key)`, the
/// transfer (for transfer operations), then every affected balance key in
/// ascending [`BalanceKey`] order. Waits are bounded by the store's lock
/// timeout and fail with [`StoreError::LockTimeout`].
///
/// ## Idempotency
///
/// When a claim is supplied and a record already exists for its key, the
/// store validates the claim against the record and returns the stored
/// result without writing anything.
#[async_trait]
pub trait LedgerStore: IdempotencyStore {
    /// Append a validated event (sequence 0) and update its balances.
    ///
    /// Any decreasing line that would end below zero rejects the whole event
    /// with `InsufficientStock`.
    async fn append_event(
        &self,
        event: StockEvent,
        claim: Option<IdempotencyClaim>,
    ) -> Result<AppendOutcome, StoreError>;

    async fn get_event(&self, id: StockEventId) -> Result<Option<StockEvent>, StoreError>;

    async fn list_events(
        &self,
        filter: &EventFilter,
        page: PageRequest,
        sort: Sort<EventSortField>,
    ) -> Result<Page<StockEvent>, StoreError>;

    /// Materialized balance; 0 for keys that never moved.
    async fn balance_of(&self, key: BalanceKey) -> Result<i64, StoreError>;

    /// Running-balance history. Balances are computed chronologically;
    /// `direction` only changes presentation order.
    async fn history(
        &self,
        key: BalanceKey,
        range: &OccurredRange,
        page: PageRequest,
        direction: SortDirection,
    ) -> Result<Page<HistoryEntry>, StoreError>;

    /// Keys whose materialized balance disagrees with the log.
    async fn verify_balances(&self) -> Result<Vec<BalanceDrift>, StoreError>;

    /// Rewrite the projection from the log; returns the number of keys written.
    async fn rebuild_balances(&self) -> Result<u64, StoreError>;

    async fn create_transfer(&self, command: CreateTransferDraft) -> Result<TransferChange, StoreError>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError>;

    async fn list_transfers(
        &self,
        filter: &TransferFilter,
        page: PageRequest,
        sort: Sort<TransferSortField>,
    ) -> Result<Page<Transfer>, StoreError>;

    /// Post both ledger legs and mark the transfer CONFIRMED, atomically.
    async fn confirm_transfer(
        &self,
        request: ConfirmTransferRequest,
    ) -> Result<ConfirmOutcome, StoreError>;

    async fn cancel_transfer(&self, command: CancelTransfer) -> Result<TransferChange, StoreError>;

    async fn snapshot(
        &self,
        filter: &SnapshotFilter,
        page: PageRequest,
        sort: Sort<SnapshotSortField>,
    ) -> Result<Page<SnapshotRow>, StoreError>;

    /// Balances below `threshold` (projection only).
    async fn low_stock(
        &self,
        warehouse_id: Option<WarehouseId>,
        threshold: i64,
        page: PageRequest,
        sort: Sort<LowStockSortField>,
    ) -> Result<Page<LowStockRow>, StoreError>;

    /// Unpaginated balances matching `filter`, in (warehouse, variant) order.
    async fn balances_for(&self, filter: &SnapshotFilter) -> Result<Vec<SnapshotRow>, StoreError>;
}
