//! `stockshift-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the ledger and its
//! infrastructure (no IO, no storage).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot};
pub use error::{DomainError, DomainResult, ResourceKind};
pub use id::{ActorId, ProductId, StockEventId, TransferId, VariantId, WarehouseId};
