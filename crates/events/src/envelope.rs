use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::event::Event;

/// Envelope for a committed event, carrying stream metadata.
///
/// This is the unit published on the change feed.
///
/// Notes:
/// - `sequence_number` is the store-assigned position: the global ledger
///   sequence for stock events, the aggregate version for transfers.
/// - `payload` is the serialized domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,

    stream_id: Uuid,
    stream_type: String,

    sequence_number: u64,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        stream_id: Uuid,
        stream_type: impl Into<String>,
        sequence_number: u64,
        event_type: impl Into<String>,
        event_version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            stream_type: stream_type.into(),
            sequence_number,
            event_type: event_type.into(),
            event_version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Serialize a typed event into a JSON envelope.
    ///
    /// The envelope id is freshly generated; consumers deduplicate on
    /// `(stream_id, sequence_number, event_type)`.
    pub fn encode<E>(event: &E, sequence_number: u64) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(
            Uuid::now_v7(),
            event.stream_id(),
            event.stream_type(),
            sequence_number,
            event.event_type(),
            event.version(),
            event.occurred_at(),
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Counted {
        stream: Uuid,
        at: DateTime<Utc>,
        amount: i64,
    }

    impl Event for Counted {
        fn event_type(&self) -> &'static str {
            "test.counted"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }

        fn stream_id(&self) -> Uuid {
            self.stream
        }

        fn stream_type(&self) -> &'static str {
            "test.stream"
        }
    }

    #[test]
    fn encode_copies_event_metadata() {
        let event = Counted {
            stream: Uuid::now_v7(),
            at: Utc::now(),
            amount: -75,
        };

        let envelope = EventEnvelope::encode(&event, 7).unwrap();

        assert_eq!(envelope.stream_id(), event.stream);
        assert_eq!(envelope.stream_type(), "test.stream");
        assert_eq!(envelope.sequence_number(), 7);
        assert_eq!(envelope.event_type(), "test.counted");
        assert_eq!(envelope.event_version(), 2);
        assert_eq!(envelope.occurred_at(), event.at);
        assert_eq!(envelope.payload()["amount"], -75);
    }
}
