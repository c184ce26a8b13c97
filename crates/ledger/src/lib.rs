//! `stockshift-ledger`: pure stock ledger domain.
//!
//! Stock events and their sign rules, the balance projection arithmetic,
//! running-balance history, the transfer state machine and report math.
//! No IO: stores in `stockshift-infra` drive these types under their locks.

pub mod paging;

pub mod balance;
pub mod history;
pub mod report;
pub mod stock_event;
pub mod transfer;

pub use balance::{BalanceChange, BalanceDrift, BalanceKey, BalanceSheet, detect_drift, replay_totals};
pub use history::{HistoryEntry, HistorySortField, LedgerMovement, OccurredRange, replay};
pub use paging::{Page, PageLimits, PageRequest, Sort, SortDirection, SortField};
pub use report::{
    ExpiringRow, ExpiringSortField, ExpiryWindow, LowStockRow, LowStockSortField, SnapshotRow,
    SnapshotSortField,
};
pub use stock_event::{
    EventSortField, ReasonCode, RecordStockEvent, RequestedLine, StockEvent, StockEventLine,
    StockEventType,
};
pub use transfer::{
    CancelTransfer, ConfirmTransfer, CreateTransferDraft, LegSpec, Transfer, TransferCommand,
    TransferEvent, TransferLine, TransferSortField, TransferStatus,
};
