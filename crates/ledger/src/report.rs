//! Report rows and the arithmetic behind them.
//!
//! Stores produce raw balances; this module turns them into snapshot,
//! low-stock and expiry rows and owns their ordering.

use core::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockshift_core::{DomainError, DomainResult, VariantId, WarehouseId};

use crate::paging::{Sort, sort_fields};

/// Horizon of the expiry report when the caller gives none (or a non-positive one).
pub const DEFAULT_DAYS_AHEAD: i64 = 30;

/// One balance line of a snapshot. `warehouse_id` is `None` when the
/// snapshot is aggregated across warehouses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub warehouse_id: Option<WarehouseId>,
    pub variant_id: VariantId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockRow {
    pub warehouse_id: WarehouseId,
    pub variant_id: VariantId,
    pub quantity: i64,
    pub threshold: i64,
    /// `quantity - threshold`; always negative for reported rows.
    pub deficit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringRow {
    pub warehouse_id: Option<WarehouseId>,
    pub variant_id: VariantId,
    pub quantity: i64,
    pub expiry_date: NaiveDate,
    pub days_until_expiry: i64,
}

sort_fields! {
    SnapshotSortField {
        Quantity => "quantity",
        WarehouseId => "warehouseId",
        VariantId => "variantId",
    }
    default Quantity Desc
}

sort_fields! {
    LowStockSortField { Deficit => "deficit", Quantity => "quantity" }
    default Deficit Asc
}

sort_fields! {
    ExpiringSortField {
        ExpiryDate => "expiryDate",
        DaysUntilExpiry => "daysUntilExpiry",
        Quantity => "quantity",
    }
    default ExpiryDate Asc
}

pub fn validate_threshold(threshold: i64) -> DomainResult<i64> {
    if threshold <= 0 {
        return Err(DomainError::validation("threshold-required"));
    }
    Ok(threshold)
}

/// Low-stock row for a balance, if it sits below the threshold.
pub fn low_stock_row(
    warehouse_id: WarehouseId,
    variant_id: VariantId,
    quantity: i64,
    threshold: i64,
) -> Option<LowStockRow> {
    (quantity < threshold).then(|| LowStockRow {
        warehouse_id,
        variant_id,
        quantity,
        threshold,
        deficit: quantity.saturating_sub(threshold),
    })
}

pub fn effective_days_ahead(days_ahead: Option<i64>) -> i64 {
    match days_ahead {
        Some(days) if days > 0 => days,
        _ => DEFAULT_DAYS_AHEAD,
    }
}

/// Inclusive date window of the expiry report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryWindow {
    pub as_of: NaiveDate,
    pub until: NaiveDate,
    pub include_expired: bool,
}

impl ExpiryWindow {
    pub fn new(as_of: Option<DateTime<Utc>>, days_ahead: Option<i64>, include_expired: bool) -> Self {
        let as_of = as_of.unwrap_or_else(Utc::now).date_naive();
        let until = u64::try_from(effective_days_ahead(days_ahead))
            .ok()
            .and_then(|days| as_of.checked_add_days(Days::new(days)))
            .unwrap_or(NaiveDate::MAX);
        Self {
            as_of,
            until,
            include_expired,
        }
    }

    pub fn contains(&self, expiry_date: NaiveDate) -> bool {
        expiry_date <= self.until && (self.include_expired || expiry_date >= self.as_of)
    }

    /// Signed distance in days from the window start.
    pub fn days_until(&self, expiry_date: NaiveDate) -> i64 {
        (expiry_date - self.as_of).num_days()
    }

    pub fn row(&self, balance: SnapshotRow, expiry_date: NaiveDate) -> Option<ExpiringRow> {
        if balance.quantity == 0 || !self.contains(expiry_date) {
            return None;
        }
        Some(ExpiringRow {
            warehouse_id: balance.warehouse_id,
            variant_id: balance.variant_id,
            quantity: balance.quantity,
            expiry_date,
            days_until_expiry: self.days_until(expiry_date),
        })
    }
}

/// Collapse per-warehouse balances into one row per variant.
pub fn aggregate_by_variant(rows: impl IntoIterator<Item = SnapshotRow>) -> Vec<SnapshotRow> {
    let mut totals: BTreeMap<VariantId, i64> = BTreeMap::new();
    for row in rows {
        *totals.entry(row.variant_id).or_insert(0) += row.quantity;
    }
    totals
        .into_iter()
        .map(|(variant_id, quantity)| SnapshotRow {
            warehouse_id: None,
            variant_id,
            quantity,
        })
        .collect()
}

fn key_cmp(
    a: (Option<WarehouseId>, VariantId),
    b: (Option<WarehouseId>, VariantId),
) -> Ordering {
    a.cmp(&b)
}

pub fn sort_snapshot(rows: &mut [SnapshotRow], sort: Sort<SnapshotSortField>) {
    rows.sort_by(|a, b| {
        let primary = match sort.field {
            SnapshotSortField::Quantity => a.quantity.cmp(&b.quantity),
            SnapshotSortField::WarehouseId => a.warehouse_id.cmp(&b.warehouse_id),
            SnapshotSortField::VariantId => a.variant_id.cmp(&b.variant_id),
        };
        sort.direction
            .apply(primary)
            .then_with(|| key_cmp((a.warehouse_id, a.variant_id), (b.warehouse_id, b.variant_id)))
    });
}

pub fn sort_low_stock(rows: &mut [LowStockRow], sort: Sort<LowStockSortField>) {
    rows.sort_by(|a, b| {
        let primary = match sort.field {
            LowStockSortField::Deficit => a.deficit.cmp(&b.deficit),
            LowStockSortField::Quantity => a.quantity.cmp(&b.quantity),
        };
        sort.direction.apply(primary).then_with(|| {
            key_cmp(
                (Some(a.warehouse_id), a.variant_id),
                (Some(b.warehouse_id), b.variant_id),
            )
        })
    });
}

pub fn sort_expiring(rows: &mut [ExpiringRow], sort: Sort<ExpiringSortField>) {
    rows.sort_by(|a, b| {
        let primary = match sort.field {
            ExpiringSortField::ExpiryDate => a.expiry_date.cmp(&b.expiry_date),
            ExpiringSortField::DaysUntilExpiry => a.days_until_expiry.cmp(&b.days_until_expiry),
            ExpiringSortField::Quantity => a.quantity.cmp(&b.quantity),
        };
        sort.direction
            .apply(primary)
            .then_with(|| key_cmp((a.warehouse_id, a.variant_id), (b.warehouse_id, b.variant_id)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(warehouse: Option<WarehouseId>, variant: VariantId, quantity: i64) -> SnapshotRow {
        SnapshotRow {
            warehouse_id: warehouse,
            variant_id: variant,
            quantity,
        }
    }

    #[test]
    fn low_stock_deficit_is_quantity_minus_threshold() {
        let r = low_stock_row(WarehouseId::new(), VariantId::new(), 10, 40).unwrap();
        assert_eq!(r.deficit, -30);
        assert!(low_stock_row(WarehouseId::new(), VariantId::new(), 40, 40).is_none());
    }

    #[test]
    fn non_positive_thresholds_are_rejected() {
        for threshold in [0, -1] {
            assert_eq!(
                validate_threshold(threshold).unwrap_err(),
                DomainError::validation("threshold-required")
            );
        }
        assert_eq!(validate_threshold(5).unwrap(), 5);
    }

    #[test]
    fn days_ahead_falls_back_to_thirty() {
        assert_eq!(effective_days_ahead(None), 30);
        assert_eq!(effective_days_ahead(Some(0)), 30);
        assert_eq!(effective_days_ahead(Some(-4)), 30);
        assert_eq!(effective_days_ahead(Some(7)), 7);
    }

    #[test]
    fn expiry_window_is_inclusive_and_excludes_past_dates_by_default() {
        let as_of = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        let window = ExpiryWindow::new(Some(as_of), Some(10), false);

        assert!(window.contains(day(2024, 3, 1)));
        assert!(window.contains(day(2024, 3, 11)));
        assert!(!window.contains(day(2024, 3, 12)));
        assert!(!window.contains(day(2024, 2, 29)));

        let widened = ExpiryWindow { include_expired: true, ..window };
        assert!(widened.contains(day(2024, 2, 29)));
        assert_eq!(widened.days_until(day(2024, 2, 29)), -1);
    }

    #[test]
    fn oversized_window_is_clamped_to_the_last_date() {
        let as_of = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap();
        let window = ExpiryWindow::new(Some(as_of), Some(i64::MAX), false);

        assert_eq!(window.until, NaiveDate::MAX);
        assert!(window.contains(day(9000, 1, 1)));
        assert!(!window.contains(day(2024, 2, 29)));
    }

    #[test]
    fn deficit_saturates_for_extreme_balances() {
        let r = low_stock_row(WarehouseId::new(), VariantId::new(), i64::MIN, 5).unwrap();
        assert_eq!(r.deficit, i64::MIN);
    }

    #[test]
    fn zero_balances_never_produce_expiry_rows() {
        let window = ExpiryWindow::new(None, None, false);
        let expiry = window.as_of;
        assert!(window.row(row(None, VariantId::new(), 0), expiry).is_none());

        let r = window.row(row(None, VariantId::new(), 4), expiry).unwrap();
        assert_eq!(r.days_until_expiry, 0);
    }

    #[test]
    fn aggregation_sums_a_variant_across_warehouses() {
        let variant = VariantId::new();
        let rows = aggregate_by_variant(vec![
            row(Some(WarehouseId::new()), variant, 7),
            row(Some(WarehouseId::new()), variant, 5),
        ]);
        assert_eq!(rows, vec![row(None, variant, 12)]);
    }

    #[test]
    fn snapshot_sort_defaults_to_quantity_descending() {
        let mut rows = vec![
            row(None, VariantId::new(), 3),
            row(None, VariantId::new(), 9),
            row(None, VariantId::new(), 5),
        ];
        sort_snapshot(&mut rows, Sort::default());
        let quantities: Vec<i64> = rows.iter().map(|r| r.quantity).collect();
        assert_eq!(quantities, vec![9, 5, 3]);
    }

    #[test]
    fn low_stock_sort_puts_the_largest_shortfall_first() {
        let warehouse = WarehouseId::new();
        let mut rows = vec![
            low_stock_row(warehouse, VariantId::new(), 8, 10).unwrap(),
            low_stock_row(warehouse, VariantId::new(), 1, 10).unwrap(),
        ];
        sort_low_stock(&mut rows, Sort::default());
        assert_eq!(rows[0].deficit, -9);
    }
}
