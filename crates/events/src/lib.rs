//! Change-feed contracts: domain events, envelopes and the publication bus.
//!
//! The ledger is the source of truth. Everything in this crate describes what
//! happens *after* a commit: wrapping committed facts in envelopes and fanning
//! them out to subscribers (projections, notifications, audit sinks).

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
