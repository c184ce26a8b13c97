use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A committed business fact.
///
/// Events are immutable, versioned for schema evolution, and grouped into
/// streams (one stream per warehouse for stock movements, one per transfer for
/// workflow changes).
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "stock.event.outbound").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Identifier of the stream this event belongs to.
    fn stream_id(&self) -> Uuid;

    /// Stream family, e.g. "stock.ledger" or "stock.transfer".
    fn stream_type(&self) -> &'static str;
}
