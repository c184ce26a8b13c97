use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockshift_core::{ActorId, DomainError, DomainResult, StockEventId, VariantId, WarehouseId};
use stockshift_events::Event;

use crate::balance::BalanceKey;
use crate::paging::sort_fields;

/// Maximum length of free-text notes on events and transfers.
pub const MAX_NOTES_LEN: usize = 500;

/// Direction of a ledger movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockEventType {
    Inbound,
    Outbound,
    Adjust,
}

impl StockEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockEventType::Inbound => "INBOUND",
            StockEventType::Outbound => "OUTBOUND",
            StockEventType::Adjust => "ADJUST",
        }
    }

    /// Turn a requested quantity into the signed delta stored on the line.
    ///
    /// INBOUND and OUTBOUND take a positive magnitude; OUTBOUND is negated.
    /// ADJUST takes the caller's signed delta as-is; zero is rejected, and so is
    /// a decrease whose magnitude does not fit in an `i64`.
    pub fn signed_quantity(&self, requested: i64) -> DomainResult<i64> {
        match self {
            StockEventType::Inbound | StockEventType::Outbound if requested <= 0 => {
                Err(DomainError::validation("quantity-must-be-positive"))
            }
            StockEventType::Inbound => Ok(requested),
            StockEventType::Outbound => requested
                .checked_neg()
                .ok_or_else(|| DomainError::validation("quantity-out-of-range")),
            StockEventType::Adjust if requested == 0 => {
                Err(DomainError::validation("quantity-must-not-be-zero"))
            }
            StockEventType::Adjust if requested == i64::MIN => {
                Err(DomainError::validation("quantity-out-of-range"))
            }
            StockEventType::Adjust => Ok(requested),
        }
    }
}

impl core::fmt::Display for StockEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for StockEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INBOUND" => Ok(StockEventType::Inbound),
            "OUTBOUND" => Ok(StockEventType::Outbound),
            "ADJUST" => Ok(StockEventType::Adjust),
            _ => Err(DomainError::validation("invalid-event-type")),
        }
    }
}

/// Business reason attached to a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Purchase,
    Sale,
    Return,
    CountCorrection,
    Damage,
    DiscardExpired,
    Other,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Purchase => "PURCHASE",
            ReasonCode::Sale => "SALE",
            ReasonCode::Return => "RETURN",
            ReasonCode::CountCorrection => "COUNT_CORRECTION",
            ReasonCode::Damage => "DAMAGE",
            ReasonCode::DiscardExpired => "DISCARD_EXPIRED",
            ReasonCode::Other => "OTHER",
        }
    }
}

impl core::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReasonCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PURCHASE" => Ok(ReasonCode::Purchase),
            "SALE" => Ok(ReasonCode::Sale),
            "RETURN" => Ok(ReasonCode::Return),
            "COUNT_CORRECTION" => Ok(ReasonCode::CountCorrection),
            "DAMAGE" => Ok(ReasonCode::Damage),
            "DISCARD_EXPIRED" => Ok(ReasonCode::DiscardExpired),
            "OTHER" => Ok(ReasonCode::Other),
            _ => Err(DomainError::validation("invalid-reason-code")),
        }
    }
}

/// A stored ledger line: `quantity` is the signed delta applied to the balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEventLine {
    pub variant_id: VariantId,
    pub quantity: i64,
}

/// A line as requested by the caller (magnitude for INBOUND/OUTBOUND, signed
/// delta for ADJUST).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedLine {
    pub variant_id: VariantId,
    pub quantity: i64,
}

impl RequestedLine {
    pub fn new(variant_id: VariantId, quantity: i64) -> Self {
        Self {
            variant_id,
            quantity,
        }
    }
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockEvent {
    pub id: StockEventId,
    pub event_type: StockEventType,
    pub warehouse_id: WarehouseId,
    pub occurred_at: DateTime<Utc>,
    pub reason_code: Option<ReasonCode>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    /// Store-assigned position in the ledger (0 until committed).
    pub sequence: u64,
    pub lines: Vec<StockEventLine>,
}

impl StockEvent {
    /// Balance keys touched by this event, sorted and deduplicated.
    ///
    /// Stores lock keys in this order, which keeps lock acquisition
    /// deadlock-free across concurrent writers.
    pub fn balance_keys(&self) -> Vec<BalanceKey> {
        let mut keys: Vec<BalanceKey> = self
            .lines
            .iter()
            .map(|line| BalanceKey::new(self.warehouse_id, line.variant_id))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn quantity_for(&self, variant_id: VariantId) -> i64 {
        self.lines
            .iter()
            .filter(|line| line.variant_id == variant_id)
            .map(|line| line.quantity)
            .sum()
    }

    /// Whether this event is the sanctioned way to write off expired stock.
    pub fn is_discard_expired(&self) -> bool {
        self.event_type == StockEventType::Adjust
            && self.reason_code == Some(ReasonCode::DiscardExpired)
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self.event_type {
            StockEventType::Inbound => "stock.event.inbound",
            StockEventType::Outbound => "stock.event.outbound",
            StockEventType::Adjust => "stock.event.adjust",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn stream_id(&self) -> Uuid {
        *self.warehouse_id.as_uuid()
    }

    fn stream_type(&self) -> &'static str {
        "stock.ledger"
    }
}

/// Command: record a movement in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStockEvent {
    pub event_type: StockEventType,
    pub warehouse_id: WarehouseId,
    pub reason_code: Option<ReasonCode>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub lines: Vec<RequestedLine>,
}

impl RecordStockEvent {
    /// Validate the payload and resolve the signed lines, in request order.
    pub fn signed_lines(&self) -> DomainResult<Vec<StockEventLine>> {
        if self.lines.is_empty() {
            return Err(DomainError::validation("empty-lines"));
        }
        ensure_notes_len(self.notes.as_deref())?;
        ensure_distinct_variants(self.lines.iter().map(|line| line.variant_id))?;

        self.lines
            .iter()
            .map(|line| {
                Ok(StockEventLine {
                    variant_id: line.variant_id,
                    quantity: self.event_type.signed_quantity(line.quantity)?,
                })
            })
            .collect()
    }

    /// Whether this request writes off expired stock (ADJUST + DISCARD_EXPIRED).
    pub fn is_discard_expired(&self) -> bool {
        self.event_type == StockEventType::Adjust
            && self.reason_code == Some(ReasonCode::DiscardExpired)
    }

    /// Build the uncommitted event (sequence 0).
    pub fn into_event(
        self,
        id: StockEventId,
        created_by: ActorId,
        created_at: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> DomainResult<StockEvent> {
        let lines = self.signed_lines()?;
        Ok(StockEvent {
            id,
            event_type: self.event_type,
            warehouse_id: self.warehouse_id,
            occurred_at: self.occurred_at,
            reason_code: self.reason_code,
            notes: normalize_notes(self.notes),
            idempotency_key,
            created_by,
            created_at,
            sequence: 0,
            lines,
        })
    }
}

sort_fields! {
    /// Sortable properties of the event listing.
    EventSortField { OccurredAt => "occurredAt", CreatedAt => "createdAt" }
    default OccurredAt Desc
}

pub(crate) fn ensure_distinct_variants(
    variants: impl IntoIterator<Item = VariantId>,
) -> DomainResult<()> {
    let mut seen = HashSet::new();
    for variant_id in variants {
        if !seen.insert(variant_id) {
            return Err(DomainError::validation("duplicate-variant-line"));
        }
    }
    Ok(())
}

pub(crate) fn ensure_notes_len(notes: Option<&str>) -> DomainResult<()> {
    match notes {
        Some(notes) if notes.chars().count() > MAX_NOTES_LEN => {
            Err(DomainError::validation("notes-too-long"))
        }
        _ => Ok(()),
    }
}

/// Trim notes; blank notes become `None`.
pub(crate) fn normalize_notes(notes: Option<String>) -> Option<String> {
    notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}
