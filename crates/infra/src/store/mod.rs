//! Transactional stock ledger storage.
//!
//! [`LedgerStore`] is the boundary the services talk to. Two backends:
//! [`InMemoryLedgerStore`] for tests and embedded use, and
//! [`PostgresLedgerStore`] for production.

pub mod in_memory;
pub mod keyed_lock;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use keyed_lock::KeyedLocks;
pub use postgres::PostgresLedgerStore;
pub use query::{
    AppendOutcome, ConfirmOutcome, ConfirmTransferRequest, ConfirmationPlan, EventFilter,
    SnapshotFilter, TransferChange, TransferFilter,
};
pub use r#trait::{LedgerStore, StoreError};
