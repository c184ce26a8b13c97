//! Infrastructure layer: ledger stores, catalog adapters, idempotency,
//! configuration and the application services built on them.

pub mod catalog;
pub mod config;
pub mod idempotency;
pub mod retry;
pub mod service;
pub mod store;


pub use catalog::{Catalog, InMemoryCatalog, PostgresCatalog};
pub use config::LedgerConfig;
pub use service::{
    LedgerServices, PageParams, ReportService, ServiceError, ServiceResult, ServiceSettings,
    StockLedgerService, TransferService,
};
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError};
