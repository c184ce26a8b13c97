//! Running-balance history for one (warehouse, variant) key.

use core::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockshift_core::{DomainError, DomainResult, StockEventId};

use crate::balance::BalanceKey;
use crate::paging::sort_fields;
use crate::stock_event::{ReasonCode, StockEvent, StockEventType};

/// One line of one event, as seen from a single balance key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMovement {
    pub event_id: StockEventId,
    pub event_type: StockEventType,
    pub reason_code: Option<ReasonCode>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub quantity: i64,
}

impl LedgerMovement {
    /// Extract the movement for `key`, if the event touches it.
    pub fn from_event(event: &StockEvent, key: &BalanceKey) -> Option<Self> {
        if event.warehouse_id != key.warehouse_id {
            return None;
        }
        let mut lines = event
            .lines
            .iter()
            .filter(|line| line.variant_id == key.variant_id)
            .peekable();
        lines.peek()?;
        Some(Self {
            event_id: event.id,
            event_type: event.event_type,
            reason_code: event.reason_code,
            notes: event.notes.clone(),
            occurred_at: event.occurred_at,
            created_at: event.created_at,
            sequence: event.sequence,
            quantity: lines.map(|line| line.quantity).sum(),
        })
    }

    /// Chronological order: business time, then creation time, then ledger
    /// sequence as the final tie-break.
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.occurred_at
            .cmp(&other.occurred_at)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// A history row with the balance around the movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_id: StockEventId,
    pub event_type: StockEventType,
    pub reason_code: Option<ReasonCode>,
    pub notes: Option<String>,
    pub key: BalanceKey,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub quantity_change: i64,
    pub balance_before: i64,
    pub balance_after: i64,
}

sort_fields! {
    /// History is only ever ordered by business time; direction is the knob.
    HistorySortField { OccurredAt => "occurredAt" }
    default OccurredAt Asc
}

/// Bounds for a history query (inclusive).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurredRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl OccurredRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> DomainResult<Self> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(DomainError::validation("invalid-range"));
            }
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at <= to)
    }

    /// Whether `at` falls strictly before the range start.
    pub fn is_before(&self, at: DateTime<Utc>) -> bool {
        self.from.is_some_and(|from| at < from)
    }
}

/// Replay movements in chronological order, producing balance rows.
///
/// Movements before `range.from` only contribute to the starting balance;
/// movements after `range.to` are dropped. The result is ascending; callers
/// reverse it for descending presentation, which leaves the balances intact.
pub fn replay(
    key: BalanceKey,
    mut movements: Vec<LedgerMovement>,
    range: &OccurredRange,
) -> Vec<HistoryEntry> {
    movements.sort_by(LedgerMovement::chronological_cmp);

    let mut balance = 0i64;
    let mut entries = Vec::new();
    for movement in movements {
        if range.is_before(movement.occurred_at) {
            balance += movement.quantity;
            continue;
        }
        if !range.contains(movement.occurred_at) {
            continue;
        }

        let before = balance;
        balance += movement.quantity;
        entries.push(HistoryEntry {
            event_id: movement.event_id,
            event_type: movement.event_type,
            reason_code: movement.reason_code,
            notes: movement.notes,
            key,
            occurred_at: movement.occurred_at,
            created_at: movement.created_at,
            quantity_change: movement.quantity,
            balance_before: before,
            balance_after: balance,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use stockshift_core::{VariantId, WarehouseId};

    fn key() -> BalanceKey {
        BalanceKey::new(WarehouseId::new(), VariantId::new())
    }

    fn movement(occurred_at: DateTime<Utc>, sequence: u64, quantity: i64) -> LedgerMovement {
        LedgerMovement {
            event_id: StockEventId::new(),
            event_type: if quantity >= 0 {
                StockEventType::Inbound
            } else {
                StockEventType::Outbound
            },
            reason_code: None,
            notes: None,
            occurred_at,
            created_at: occurred_at,
            sequence,
            quantity,
        }
    }

    #[test]
    fn balances_chain_in_chronological_order() {
        let t0 = Utc::now();
        let movements = vec![
            movement(t0 + Duration::hours(2), 3, -30),
            movement(t0, 1, 100),
            movement(t0 + Duration::hours(1), 2, -20),
        ];

        let entries = replay(key(), movements, &OccurredRange::default());

        let balances: Vec<(i64, i64, i64)> = entries
            .iter()
            .map(|e| (e.balance_before, e.quantity_change, e.balance_after))
            .collect();
        assert_eq!(balances, vec![(0, 100, 100), (100, -20, 80), (80, -30, 50)]);
    }

    #[test]
    fn equal_timestamps_fall_back_to_insertion_order() {
        let t0 = Utc::now();
        let entries = replay(
            key(),
            vec![movement(t0, 2, -5), movement(t0, 1, 10)],
            &OccurredRange::default(),
        );
        assert_eq!(entries[0].quantity_change, 10);
        assert_eq!(entries[1].balance_after, 5);
    }

    #[test]
    fn range_start_carries_the_earlier_balance() {
        let t0 = Utc::now();
        let range = OccurredRange::new(Some(t0 + Duration::hours(1)), None).unwrap();
        let entries = replay(
            key(),
            vec![
                movement(t0, 1, 40),
                movement(t0 + Duration::hours(2), 2, -15),
                movement(t0 + Duration::hours(3), 3, 5),
            ],
            &range,
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].balance_before, 40);
        assert_eq!(entries[1].balance_after, 30);
    }

    #[test]
    fn inverted_range_is_invalid() {
        let t0 = Utc::now();
        let err = OccurredRange::new(Some(t0), Some(t0 - Duration::seconds(1))).unwrap_err();
        assert_eq!(err, DomainError::validation("invalid-range"));
    }

    #[test]
    fn movement_sums_lines_for_the_key_only() {
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let other = VariantId::new();
        let event = StockEvent {
            id: StockEventId::new(),
            event_type: StockEventType::Inbound,
            warehouse_id: warehouse,
            occurred_at: Utc::now(),
            reason_code: None,
            notes: None,
            idempotency_key: None,
            created_by: stockshift_core::ActorId::new(),
            created_at: Utc::now(),
            sequence: 4,
            lines: vec![
                crate::stock_event::StockEventLine { variant_id: variant, quantity: 6 },
                crate::stock_event::StockEventLine { variant_id: other, quantity: 9 },
            ],
        };

        let m = LedgerMovement::from_event(&event, &BalanceKey::new(warehouse, variant)).unwrap();
        assert_eq!(m.quantity, 6);
        assert!(LedgerMovement::from_event(&event, &BalanceKey::new(WarehouseId::new(), variant)).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        /// Property: after replay, each entry's before equals the previous
        /// entry's after, and the last after equals the plain sum.
        #[test]
        fn replay_chains_and_ends_at_the_sum(
            deltas in prop::collection::vec((-100i64..100, 0i64..5), 1..40)
        ) {
            let t0 = Utc::now();
            let movements: Vec<LedgerMovement> = deltas
                .iter()
                .enumerate()
                .map(|(i, (qty, hours))| movement(t0 + Duration::hours(*hours), i as u64, *qty))
                .collect();
            let total: i64 = deltas.iter().map(|(qty, _)| qty).sum();

            let entries = replay(key(), movements, &OccurredRange::default());

            prop_assert_eq!(entries[0].balance_before, 0);
            for pair in entries.windows(2) {
                prop_assert_eq!(pair[0].balance_after, pair[1].balance_before);
            }
            for entry in &entries {
                prop_assert_eq!(entry.balance_after, entry.balance_before + entry.quantity_change);
            }
            prop_assert_eq!(entries.last().map(|e| e.balance_after), Some(total));
        }
    }
}
