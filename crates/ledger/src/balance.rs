//! Balance projection rules.
//!
//! A balance is the signed sum of every line quantity recorded for a
//! (warehouse, variant) key. Stores keep it materialized; this module owns the
//! arithmetic and the non-negative rule so every store enforces it the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stockshift_core::{DomainError, DomainResult, VariantId, WarehouseId};

use crate::stock_event::{StockEvent, StockEventLine};

/// Key of a materialized balance.
///
/// Ordering is (warehouse, variant). Lock acquisition follows this order.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BalanceKey {
    pub warehouse_id: WarehouseId,
    pub variant_id: VariantId,
}

impl BalanceKey {
    pub fn new(warehouse_id: WarehouseId, variant_id: VariantId) -> Self {
        Self {
            warehouse_id,
            variant_id,
        }
    }
}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.warehouse_id, self.variant_id)
    }
}

/// Effect of one event line on one balance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub key: BalanceKey,
    pub before: i64,
    pub after: i64,
}

impl BalanceChange {
    pub fn delta(&self) -> i64 {
        self.after - self.before
    }
}

/// Working copy of the balances locked for one unit of work.
///
/// Seed it with the current values of the locked keys, apply one or more
/// events, then persist [`BalanceSheet::balances`]. `apply` is all-or-nothing
/// per event: a rejected event leaves the sheet untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceSheet {
    balances: BTreeMap<BalanceKey, i64>,
}

impl BalanceSheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: BalanceKey, quantity: i64) {
        self.balances.insert(key, quantity);
    }

    pub fn get(&self, key: &BalanceKey) -> i64 {
        self.balances.get(key).copied().unwrap_or(0)
    }

    pub fn balances(&self) -> &BTreeMap<BalanceKey, i64> {
        &self.balances
    }

    /// Apply an event's lines, rejecting any decrease that ends below zero.
    pub fn apply(&mut self, event: &StockEvent) -> DomainResult<Vec<BalanceChange>> {
        let changes = plan_lines(self, event.warehouse_id, &event.lines)?;
        for change in &changes {
            self.balances.insert(change.key, change.after);
        }
        Ok(changes)
    }
}

impl FromIterator<(BalanceKey, i64)> for BalanceSheet {
    fn from_iter<I: IntoIterator<Item = (BalanceKey, i64)>>(iter: I) -> Self {
        Self {
            balances: iter.into_iter().collect(),
        }
    }
}

fn plan_lines(
    sheet: &BalanceSheet,
    warehouse_id: WarehouseId,
    lines: &[StockEventLine],
) -> DomainResult<Vec<BalanceChange>> {
    let mut changes: Vec<BalanceChange> = Vec::with_capacity(lines.len());

    for line in lines {
        let key = BalanceKey::new(warehouse_id, line.variant_id);
        // Duplicate variants are rejected upstream; chain them anyway.
        let before = changes
            .iter()
            .rev()
            .find(|c| c.key == key)
            .map(|c| c.after)
            .unwrap_or_else(|| sheet.get(&key));

        let after = before
            .checked_add(line.quantity)
            .ok_or_else(|| DomainError::validation("quantity-out-of-range"))?;

        if line.quantity < 0 && after < 0 {
            let requested = line.quantity.checked_neg().unwrap_or(i64::MAX);
            return Err(DomainError::insufficient_stock(
                warehouse_id,
                line.variant_id,
                before,
                requested,
            ));
        }

        changes.push(BalanceChange { key, before, after });
    }

    Ok(changes)
}

/// Sum every event's lines into per-key totals (full log replay).
pub fn replay_totals<'a>(events: impl IntoIterator<Item = &'a StockEvent>) -> BTreeMap<BalanceKey, i64> {
    let mut totals = BTreeMap::new();
    for event in events {
        for line in &event.lines {
            *totals
                .entry(BalanceKey::new(event.warehouse_id, line.variant_id))
                .or_insert(0) += line.quantity;
        }
    }
    totals
}

/// A materialized balance that disagrees with the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDrift {
    pub key: BalanceKey,
    pub recorded: i64,
    pub expected: i64,
}

/// Compare materialized balances against log totals.
///
/// Keys missing on either side count as zero, so a stray zero row is not drift.
pub fn detect_drift(
    recorded: &BTreeMap<BalanceKey, i64>,
    expected: &BTreeMap<BalanceKey, i64>,
) -> Vec<BalanceDrift> {
    let mut keys: Vec<&BalanceKey> = recorded.keys().chain(expected.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| {
            let recorded = recorded.get(key).copied().unwrap_or(0);
            let expected = expected.get(key).copied().unwrap_or(0);
            (recorded != expected).then_some(BalanceDrift {
                key: *key,
                recorded,
                expected,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use stockshift_core::{ActorId, StockEventId};

    use crate::stock_event::{RecordStockEvent, RequestedLine, StockEventType};

    fn event(
        warehouse_id: WarehouseId,
        event_type: StockEventType,
        lines: Vec<(VariantId, i64)>,
    ) -> StockEvent {
        RecordStockEvent {
            event_type,
            warehouse_id,
            reason_code: None,
            notes: None,
            occurred_at: Utc::now(),
            lines: lines
                .into_iter()
                .map(|(v, q)| RequestedLine::new(v, q))
                .collect(),
        }
        .into_event(StockEventId::new(), ActorId::new(), Utc::now(), None)
        .unwrap()
    }

    #[test]
    fn outbound_beyond_balance_is_rejected_and_sheet_unchanged() {
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let mut sheet = BalanceSheet::new();

        let err = sheet
            .apply(&event(warehouse, StockEventType::Outbound, vec![(variant, 10)]))
            .unwrap_err();

        assert_eq!(
            err,
            DomainError::insufficient_stock(warehouse, variant, 0, 10)
        );
        assert_eq!(sheet.get(&BalanceKey::new(warehouse, variant)), 0);
    }

    #[test]
    fn rejection_on_a_later_line_discards_earlier_lines() {
        let warehouse = WarehouseId::new();
        let stocked = VariantId::new();
        let empty = VariantId::new();
        let mut sheet: BalanceSheet = [(BalanceKey::new(warehouse, stocked), 20)]
            .into_iter()
            .collect();

        let err = sheet
            .apply(&event(
                warehouse,
                StockEventType::Outbound,
                vec![(stocked, 5), (empty, 1)],
            ))
            .unwrap_err();

        assert!(matches!(err, DomainError::InsufficientStock { .. }));
        assert_eq!(sheet.get(&BalanceKey::new(warehouse, stocked)), 20);
    }

    #[test]
    fn changes_report_before_and_after() {
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let key = BalanceKey::new(warehouse, variant);
        let mut sheet: BalanceSheet = [(key, 100)].into_iter().collect();

        let changes = sheet
            .apply(&event(warehouse, StockEventType::Outbound, vec![(variant, 75)]))
            .unwrap();

        assert_eq!(
            changes,
            vec![BalanceChange {
                key,
                before: 100,
                after: 25
            }]
        );
        assert_eq!(changes[0].delta(), -75);
    }

    #[test]
    fn negative_adjust_is_checked_like_outbound() {
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let key = BalanceKey::new(warehouse, variant);
        let mut sheet: BalanceSheet = [(key, 3)].into_iter().collect();

        let err = sheet
            .apply(&event(warehouse, StockEventType::Adjust, vec![(variant, -4)]))
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { available: 3, requested: 4, .. }));

        sheet
            .apply(&event(warehouse, StockEventType::Adjust, vec![(variant, -3)]))
            .unwrap();
        assert_eq!(sheet.get(&key), 0);
    }

    #[test]
    fn most_negative_adjust_is_rejected_without_touching_the_sheet() {
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let key = BalanceKey::new(warehouse, variant);
        let sheet: BalanceSheet = [(key, 5)].into_iter().collect();
        let line = StockEventLine {
            variant_id: variant,
            quantity: i64::MIN,
        };

        let err = plan_lines(&sheet, warehouse, &[line]).unwrap_err();
        assert_eq!(
            err,
            DomainError::insufficient_stock(warehouse, variant, 5, i64::MAX)
        );

        let command = RecordStockEvent {
            event_type: StockEventType::Adjust,
            warehouse_id: warehouse,
            reason_code: None,
            notes: None,
            occurred_at: Utc::now(),
            lines: vec![RequestedLine::new(variant, i64::MIN)],
        };
        assert_eq!(
            command
                .into_event(StockEventId::new(), ActorId::new(), Utc::now(), None)
                .unwrap_err(),
            DomainError::validation("quantity-out-of-range")
        );
        assert_eq!(sheet.get(&key), 5);
    }

    #[test]
    fn increases_are_accepted_even_when_the_balance_is_negative() {
        let warehouse = WarehouseId::new();
        let variant = VariantId::new();
        let key = BalanceKey::new(warehouse, variant);
        let mut sheet: BalanceSheet = [(key, -2)].into_iter().collect();

        sheet
            .apply(&event(warehouse, StockEventType::Inbound, vec![(variant, 1)]))
            .unwrap();
        assert_eq!(sheet.get(&key), -1);
    }

    #[test]
    fn drift_treats_missing_keys_as_zero() {
        let a = BalanceKey::new(WarehouseId::new(), VariantId::new());
        let b = BalanceKey::new(WarehouseId::new(), VariantId::new());

        let recorded = BTreeMap::from([(a, 0), (b, 7)]);
        let expected = BTreeMap::from([(b, 5)]);

        assert_eq!(
            detect_drift(&recorded, &expected),
            vec![BalanceDrift {
                key: b,
                recorded: 7,
                expected: 5
            }]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        /// Property: accepted events never leave a negative balance, and the
        /// sheet always equals the replay of the accepted events.
        #[test]
        fn sheet_matches_replay_of_accepted_events(
            moves in prop::collection::vec((any::<bool>(), 1i64..50), 1..60)
        ) {
            let warehouse = WarehouseId::new();
            let variant = VariantId::new();
            let key = BalanceKey::new(warehouse, variant);
            let mut sheet = BalanceSheet::new();
            let mut accepted = Vec::new();

            for (inbound, qty) in moves {
                let event_type = if inbound { StockEventType::Inbound } else { StockEventType::Outbound };
                let ev = event(warehouse, event_type, vec![(variant, qty)]);
                let before = sheet.get(&key);
                match sheet.apply(&ev) {
                    Ok(_) => accepted.push(ev),
                    Err(DomainError::InsufficientStock { available, requested, .. }) => {
                        prop_assert_eq!(available, before);
                        prop_assert!(requested > available);
                        prop_assert_eq!(sheet.get(&key), before);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
                }
                prop_assert!(sheet.get(&key) >= 0);
            }

            let totals = replay_totals(&accepted);
            prop_assert_eq!(totals.get(&key).copied().unwrap_or(0), sheet.get(&key));
        }
    }
}
