//! Post-commit publication of ledger and transfer events.
//!
//! The store has already committed when these run, so a failure here is
//! logged and swallowed: the ledger stays the source of truth and consumers
//! catch up by re-reading it.

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use stockshift_events::{Event, EventBus, EventEnvelope};
use stockshift_ledger::{StockEvent, Transfer, TransferEvent};

/// Message type carried on the change feed.
pub type FeedMessage = EventEnvelope<JsonValue>;

pub struct ChangeFeed<B> {
    bus: B,
}

impl<B> ChangeFeed<B>
where
    B: EventBus<FeedMessage>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Publish a committed stock event under its ledger sequence.
    pub fn stock_event(&self, event: &StockEvent) {
        self.publish(event, event.sequence);
    }

    /// Publish transfer events; `transfer` is the state after all of them.
    pub fn transfer_events(&self, transfer: &Transfer, events: &[TransferEvent]) {
        let first_version = transfer.version.saturating_sub(events.len() as u64);
        for (offset, event) in events.iter().enumerate() {
            self.publish(event, first_version + offset as u64 + 1);
        }
    }

    fn publish<E>(&self, event: &E, sequence: u64)
    where
        E: Event + serde::Serialize,
    {
        let envelope = match EventEnvelope::encode(event, sequence) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    event_type = event.event_type(),
                    stream_id = %event.stream_id(),
                    error = %err,
                    "change feed encoding failed"
                );
                return;
            }
        };

        match self.bus.publish(envelope) {
            Ok(()) => debug!(event_type = event.event_type(), sequence, "published"),
            Err(err) => warn!(
                event_type = event.event_type(),
                stream_id = %event.stream_id(),
                sequence,
                error = ?err,
                "change feed publication failed"
            ),
        }
    }
}
