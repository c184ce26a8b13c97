//! Postgres-backed ledger store.
//!
//! Every mutation runs in one transaction with a session-local
//! `lock_timeout`. Row locks follow the order documented on
//! [`LedgerStore`]: the idempotency row, the transfer row, then the
//! `stock_items` rows in ascending key order.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (lock not available) | `55P03` | `LockTimeout` |
//! | Database (serialization failure) | `40001` | `Transient` |
//! | Database (deadlock detected) | `40P01` | `Transient` |
//! | Database (other) | Any other | `Backend` |
//! | PoolTimedOut, Io | N/A | `Transient` |
//! | ColumnDecode, Decode | N/A | `Serialization` |
//! | Other | N/A | `Backend` |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use stockshift_core::{
    ActorId, Aggregate, DomainError, ResourceKind, StockEventId, TransferId, VariantId,
    WarehouseId,
};
use stockshift_events::execute;
use stockshift_ledger::report::low_stock_row;
use stockshift_ledger::{
    BalanceDrift, BalanceKey, BalanceSheet, CancelTransfer, CreateTransferDraft, EventSortField,
    HistoryEntry, LowStockRow, LowStockSortField, OccurredRange, Page, PageRequest, SnapshotRow,
    SnapshotSortField, Sort, SortDirection, StockEvent, StockEventLine, Transfer,
    TransferCommand, TransferLine, TransferSortField, TransferStatus, detect_drift,
};

use crate::idempotency::{
    IdempotencyClaim, IdempotencyKey, IdempotencyRecord, IdempotencyScope, IdempotencyStore,
    encode_response,
};

use super::in_memory::DEFAULT_LOCK_TIMEOUT;
use super::query::{
    AppendOutcome, ConfirmOutcome, ConfirmTransferRequest, EventFilter, SnapshotFilter,
    TransferChange, TransferFilter,
};
use super::r#trait::{LedgerStore, StoreError};

const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

const EVENT_COLUMNS: &str = "e.id, e.sequence, e.event_type, e.warehouse_id, e.occurred_at, \
     e.reason_code, e.notes, e.idempotency_key, e.created_by, e.created_at";

const TRANSFER_COLUMNS: &str = "t.id, t.origin_warehouse_id, t.destination_warehouse_id, \
     t.status, t.occurred_at, t.notes, t.created_by, t.created_at, t.confirmed_by, \
     t.confirmed_at, t.canceled_by, t.canceled_at, t.outbound_event_id, t.inbound_event_id, \
     t.version";

/// Postgres-backed stock ledger.
///
/// ## Thread Safety
///
/// Uses the SQLx connection pool, which is `Send + Sync`. Clones share the
/// pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_lock_timeout(pool, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
        info!("ledger schema is up to date");
        Ok(())
    }

    /// Begin a write transaction whose row lock waits are bounded.
    async fn begin_write(
        &self,
        operation: &'static str,
    ) -> Result<sqlx::Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        Ok(tx)
    }

    async fn fetch_events(
        &self,
        conn: &mut PgConnection,
        rows: Vec<PgRow>,
    ) -> Result<Vec<StockEvent>, StoreError> {
        let rows = rows
            .iter()
            .map(EventRow::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("decode_event", e))?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut lines = load_event_lines(conn, &ids).await?;

        rows.into_iter()
            .map(|row| {
                let event_lines = lines.remove(&row.id).unwrap_or_default();
                row.into_event(event_lines)
            })
            .collect()
    }

    async fn fetch_transfers(
        &self,
        conn: &mut PgConnection,
        rows: Vec<PgRow>,
    ) -> Result<Vec<Transfer>, StoreError> {
        let rows = rows
            .iter()
            .map(TransferRow::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("decode_transfer", e))?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut lines = load_transfer_lines(conn, &ids).await?;

        rows.into_iter()
            .map(|row| {
                let transfer_lines = lines.remove(&row.id).unwrap_or_default();
                row.into_transfer(transfer_lines)
            })
            .collect()
    }
}

#[async_trait]
impl IdempotencyStore for PostgresLedgerStore {
    #[instrument(skip(self, key), fields(actor_id = %actor_id), err)]
    async fn find_idempotency(
        &self,
        actor_id: ActorId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("find_idempotency", e))?;
        load_idempotency(&mut conn, actor_id, key).await
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(
        skip(self, event, claim),
        fields(
            event_id = %event.id,
            warehouse_id = %event.warehouse_id,
            line_count = event.lines.len(),
            idempotent = claim.is_some()
        ),
        err
    )]
    async fn append_event(
        &self,
        event: StockEvent,
        claim: Option<IdempotencyClaim>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.begin_write("append_event").await?;

        if let Some(claim) = &claim {
            if let Some(record) = claim_slot(&mut tx, claim).await? {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                claim.check_replay(&record)?;
                return Ok(AppendOutcome::Replayed(record.replay()?));
            }
        }

        let keys = event.balance_keys();
        let mut sheet = lock_balances(&mut tx, &keys).await?;
        sheet.apply(&event)?;

        let mut event = event;
        event.sequence = insert_event(&mut tx, &event).await?;
        write_balances(&mut tx, &sheet).await?;

        if let Some(claim) = claim {
            let response = encode_response(&event)?;
            complete_claim(&mut tx, &claim, *event.id.as_uuid(), &response).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        debug!(sequence = event.sequence, "stock event committed");
        Ok(AppendOutcome::Created(event))
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get_event(&self, id: StockEventId) -> Result<Option<StockEvent>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;

        let rows = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM stock_events e WHERE e.id = $1"))
            .bind(id.as_uuid())
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;

        Ok(self.fetch_events(&mut conn, rows).await?.into_iter().next())
    }

    #[instrument(skip(self, filter), err)]
    async fn list_events(
        &self,
        filter: &EventFilter,
        page: PageRequest,
        sort: Sort<EventSortField>,
    ) -> Result<Page<StockEvent>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("list_events", e))?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM stock_events e WHERE TRUE");
        push_event_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("list_events", e))?;

        let column = match sort.field {
            EventSortField::OccurredAt => "e.occurred_at",
            EventSortField::CreatedAt => "e.created_at",
        };
        let direction = sort.direction.as_sql();

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM stock_events e WHERE TRUE"
        ));
        push_event_filter(&mut select, filter);
        select.push(format!(" ORDER BY {column} {direction}, e.sequence {direction}"));
        push_page(&mut select, page);

        let rows = select
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("list_events", e))?;
        let events = self.fetch_events(&mut conn, rows).await?;

        Ok(Page::new(events, page, total as u64))
    }

    #[instrument(skip(self), fields(warehouse_id = %key.warehouse_id, variant_id = %key.variant_id), err)]
    async fn balance_of(&self, key: BalanceKey) -> Result<i64, StoreError> {
        let quantity: Option<i64> = sqlx::query_scalar(
            "SELECT quantity FROM stock_items WHERE warehouse_id = $1 AND variant_id = $2",
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance_of", e))?;

        Ok(quantity.unwrap_or(0))
    }

    #[instrument(skip(self, range), fields(warehouse_id = %key.warehouse_id, variant_id = %key.variant_id), err)]
    async fn history(
        &self,
        key: BalanceKey,
        range: &OccurredRange,
        page: PageRequest,
        direction: SortDirection,
    ) -> Result<Page<HistoryEntry>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("history", e))?;

        let mut count = QueryBuilder::<Postgres>::new("");
        push_history_source(&mut count, key);
        count.push("SELECT COUNT(*) FROM running WHERE TRUE");
        push_range(&mut count, "occurred_at", range);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("history", e))?;

        // Balances are computed over the whole stream before the range and
        // direction are applied, so both only affect which rows are shown.
        let dir = direction.as_sql();
        let mut select = QueryBuilder::<Postgres>::new("");
        push_history_source(&mut select, key);
        select.push(
            "SELECT id, event_type, reason_code, notes, occurred_at, created_at, quantity, \
             balance_after FROM running WHERE TRUE",
        );
        push_range(&mut select, "occurred_at", range);
        select.push(format!(
            " ORDER BY occurred_at {dir}, created_at {dir}, sequence {dir}"
        ));
        push_page(&mut select, page);

        let rows = select
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("history", e))?;

        let entries = rows
            .iter()
            .map(|row| {
                HistoryRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_history", e))
                    .and_then(|row| row.into_entry(key))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(entries, page, total as u64))
    }

    #[instrument(skip(self), err)]
    async fn verify_balances(&self) -> Result<Vec<BalanceDrift>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("verify_balances", e))?;

        // Both reads must see the same snapshot.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("verify_balances", e))?;

        let recorded = balance_map(
            &mut tx,
            "SELECT warehouse_id, variant_id, quantity FROM stock_items",
        )
        .await?;
        let expected = balance_map(
            &mut tx,
            "SELECT e.warehouse_id, l.variant_id, SUM(l.quantity)::bigint AS quantity \
             FROM stock_events e JOIN stock_event_lines l ON l.event_id = e.id \
             GROUP BY e.warehouse_id, l.variant_id",
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(detect_drift(&recorded, &expected))
    }

    #[instrument(skip(self), err)]
    async fn rebuild_balances(&self) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("rebuild_balances", e))?;

        // Blocks every writer until the projection is rewritten.
        sqlx::query("LOCK TABLE stock_items IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("rebuild_balances", e))?;

        sqlx::query("UPDATE stock_items SET quantity = 0, updated_at = NOW()")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("rebuild_balances", e))?;

        let written = sqlx::query(
            r#"
            INSERT INTO stock_items (warehouse_id, variant_id, quantity, updated_at)
            SELECT e.warehouse_id, l.variant_id, SUM(l.quantity)::bigint, NOW()
            FROM stock_events e
            JOIN stock_event_lines l ON l.event_id = e.id
            GROUP BY e.warehouse_id, l.variant_id
            ON CONFLICT (warehouse_id, variant_id)
            DO UPDATE SET quantity = EXCLUDED.quantity, updated_at = EXCLUDED.updated_at
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("rebuild_balances", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        info!(keys = written, "balance projection rebuilt from the ledger");
        Ok(written)
    }

    #[instrument(skip(self, command), fields(transfer_id = %command.transfer_id), err)]
    async fn create_transfer(
        &self,
        command: CreateTransferDraft,
    ) -> Result<TransferChange, StoreError> {
        let mut tx = self.begin_write("create_transfer").await?;

        let mut transfer = match load_transfer(&mut tx, command.transfer_id, true).await? {
            Some(existing) => existing,
            None => Transfer::empty(command.transfer_id),
        };
        let events = execute(&mut transfer, &TransferCommand::CreateDraft(command))?;

        sqlx::query(
            r#"
            INSERT INTO stock_transfers (
                id, origin_warehouse_id, destination_warehouse_id, status, occurred_at, notes,
                created_by, created_at, confirmed_by, confirmed_at, canceled_by, canceled_at,
                outbound_event_id, inbound_event_id, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(transfer.id.as_uuid())
        .bind(transfer.origin_warehouse_id.as_uuid())
        .bind(transfer.destination_warehouse_id.as_uuid())
        .bind(transfer.status.as_str())
        .bind(transfer.occurred_at)
        .bind(transfer.notes.as_deref())
        .bind(transfer.created_by.map(Uuid::from))
        .bind(transfer.created_at)
        .bind(transfer.confirmed_by.map(Uuid::from))
        .bind(transfer.confirmed_at)
        .bind(transfer.canceled_by.map(Uuid::from))
        .bind(transfer.canceled_at)
        .bind(transfer.outbound_event_id.map(Uuid::from))
        .bind(transfer.inbound_event_id.map(Uuid::from))
        .bind(transfer.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Domain(DomainError::invalid_transition(TransferStatus::Draft, "create"))
            } else {
                map_sqlx_error("insert_transfer", e)
            }
        })?;

        for (line_no, line) in transfer.lines.iter().enumerate() {
            sqlx::query(
                "INSERT INTO stock_transfer_lines (transfer_id, line_no, variant_id, quantity) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(transfer.id.as_uuid())
            .bind(line_no as i32)
            .bind(line.variant_id.as_uuid())
            .bind(line.quantity)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_transfer_line", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(TransferChange { transfer, events })
    }

    #[instrument(skip(self), fields(transfer_id = %id), err)]
    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("get_transfer", e))?;
        load_transfer(&mut conn, id, false).await
    }

    #[instrument(skip(self, filter), err)]
    async fn list_transfers(
        &self,
        filter: &TransferFilter,
        page: PageRequest,
        sort: Sort<TransferSortField>,
    ) -> Result<Page<Transfer>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("list_transfers", e))?;

        let mut count =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM stock_transfers t WHERE TRUE");
        push_transfer_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("list_transfers", e))?;

        let column = match sort.field {
            TransferSortField::OccurredAt => "t.occurred_at",
            TransferSortField::CreatedAt => "t.created_at",
        };
        let direction = sort.direction.as_sql();

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TRANSFER_COLUMNS} FROM stock_transfers t WHERE TRUE"
        ));
        push_transfer_filter(&mut select, filter);
        select.push(format!(" ORDER BY {column} {direction}, t.id {direction}"));
        push_page(&mut select, page);

        let rows = select
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("list_transfers", e))?;
        let transfers = self.fetch_transfers(&mut conn, rows).await?;

        Ok(Page::new(transfers, page, total as u64))
    }

    #[instrument(
        skip(self, request),
        fields(transfer_id = %request.transfer_id, idempotent = request.claim.is_some()),
        err
    )]
    async fn confirm_transfer(
        &self,
        request: ConfirmTransferRequest,
    ) -> Result<ConfirmOutcome, StoreError> {
        let mut tx = self.begin_write("confirm_transfer").await?;

        if let Some(claim) = &request.claim {
            if let Some(record) = claim_slot(&mut tx, claim).await? {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                claim.check_replay(&record)?;
                return Ok(ConfirmOutcome::Replayed(record.replay()?));
            }
        }

        let mut transfer = load_transfer(&mut tx, request.transfer_id, true)
            .await?
            .ok_or_else(|| DomainError::not_found(ResourceKind::Transfer, request.transfer_id))?;
        let plan = request.plan(&transfer)?;

        let keys = plan.balance_keys();
        let mut sheet = lock_balances(&mut tx, &keys).await?;
        sheet.apply(&plan.outbound)?;
        sheet.apply(&plan.inbound)?;

        let mut outbound = plan.outbound;
        let mut inbound = plan.inbound;
        outbound.sequence = insert_event(&mut tx, &outbound).await?;
        inbound.sequence = insert_event(&mut tx, &inbound).await?;
        write_balances(&mut tx, &sheet).await?;

        for event in &plan.events {
            transfer.apply(event);
        }
        update_transfer_state(&mut tx, &transfer).await?;

        if let Some(claim) = &request.claim {
            let response = encode_response(&transfer)?;
            complete_claim(&mut tx, claim, *transfer.id.as_uuid(), &response).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(ConfirmOutcome::Confirmed {
            transfer,
            outbound,
            inbound,
            events: plan.events,
        })
    }

    #[instrument(skip(self, command), fields(transfer_id = %command.transfer_id), err)]
    async fn cancel_transfer(&self, command: CancelTransfer) -> Result<TransferChange, StoreError> {
        let mut tx = self.begin_write("cancel_transfer").await?;

        let mut transfer = load_transfer(&mut tx, command.transfer_id, true)
            .await?
            .ok_or_else(|| DomainError::not_found(ResourceKind::Transfer, command.transfer_id))?;
        let events = execute(&mut transfer, &TransferCommand::Cancel(command))?;
        update_transfer_state(&mut tx, &transfer).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(TransferChange { transfer, events })
    }

    #[instrument(skip(self, filter), err)]
    async fn snapshot(
        &self,
        filter: &SnapshotFilter,
        page: PageRequest,
        sort: Sort<SnapshotSortField>,
    ) -> Result<Page<SnapshotRow>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("snapshot", e))?;

        let mut count = QueryBuilder::<Postgres>::new("");
        push_snapshot_source(&mut count, filter);
        count.push("SELECT COUNT(*) FROM shaped");
        push_zero_filter(&mut count, filter.include_zero);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("snapshot", e))?;

        let column = match sort.field {
            SnapshotSortField::Quantity => "quantity",
            SnapshotSortField::WarehouseId => "warehouse_id",
            SnapshotSortField::VariantId => "variant_id",
        };

        let mut select = QueryBuilder::<Postgres>::new("");
        push_snapshot_source(&mut select, filter);
        select.push("SELECT warehouse_id, variant_id, quantity FROM shaped");
        push_zero_filter(&mut select, filter.include_zero);
        select.push(format!(
            " ORDER BY {column} {} {}, warehouse_id ASC NULLS FIRST, variant_id ASC",
            sort.direction.as_sql(),
            nulls(sort.direction)
        ));
        push_page(&mut select, page);

        let rows = select
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("snapshot", e))?;

        Ok(Page::new(decode_snapshot_rows(&rows)?, page, total as u64))
    }

    #[instrument(skip(self), err)]
    async fn low_stock(
        &self,
        warehouse_id: Option<WarehouseId>,
        threshold: i64,
        page: PageRequest,
        sort: Sort<LowStockSortField>,
    ) -> Result<Page<LowStockRow>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("low_stock", e))?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM stock_items");
        push_low_stock_filter(&mut count, warehouse_id, threshold);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("low_stock", e))?;

        // deficit = quantity - threshold, so both fields order by quantity.
        let column = match sort.field {
            LowStockSortField::Deficit | LowStockSortField::Quantity => "quantity",
        };
        let mut select =
            QueryBuilder::<Postgres>::new("SELECT warehouse_id, variant_id, quantity FROM stock_items");
        push_low_stock_filter(&mut select, warehouse_id, threshold);
        select.push(format!(
            " ORDER BY {column} {}, warehouse_id ASC, variant_id ASC",
            sort.direction.as_sql()
        ));
        push_page(&mut select, page);

        let rows = select
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("low_stock", e))?;

        let mut content = Vec::with_capacity(rows.len());
        for row in decode_snapshot_rows(&rows)? {
            let Some(warehouse_id) = row.warehouse_id else {
                continue;
            };
            content.extend(low_stock_row(warehouse_id, row.variant_id, row.quantity, threshold));
        }

        Ok(Page::new(content, page, total as u64))
    }

    #[instrument(skip(self, filter), err)]
    async fn balances_for(&self, filter: &SnapshotFilter) -> Result<Vec<SnapshotRow>, StoreError> {
        let mut select = QueryBuilder::<Postgres>::new("");
        push_snapshot_source(&mut select, filter);
        select.push("SELECT warehouse_id, variant_id, quantity FROM shaped");
        push_zero_filter(&mut select, filter.include_zero);
        select.push(" ORDER BY warehouse_id ASC NULLS FIRST, variant_id ASC");

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balances_for", e))?;

        decode_snapshot_rows(&rows)
    }
}

// ---------------------------------------------------------------------------
// Write helpers (run inside the caller's transaction)
// ---------------------------------------------------------------------------

/// Claim `(actor, key)` for this transaction.
///
/// Returns the committed record when the key was already taken. A concurrent
/// claimer holding the row makes this wait, bounded by `lock_timeout`.
async fn claim_slot(
    conn: &mut PgConnection,
    claim: &IdempotencyClaim,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency_records
            (actor_id, idempotency_key, scope, fingerprint, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (actor_id, idempotency_key) DO NOTHING
        "#,
    )
    .bind(claim.actor_id.as_uuid())
    .bind(claim.key.as_str())
    .bind(claim.scope.as_str())
    .bind(&claim.fingerprint)
    .bind(claim.created_at)
    .bind(claim.expires_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("claim_idempotency", e))?
    .rows_affected();

    if inserted == 1 {
        return Ok(None);
    }

    load_idempotency(conn, claim.actor_id, &claim.key)
        .await?
        .map(Some)
        .ok_or_else(|| StoreError::Transient(format!("idempotency key {} vanished", claim.key)))
}

async fn complete_claim(
    conn: &mut PgConnection,
    claim: &IdempotencyClaim,
    resource_id: Uuid,
    response: &JsonValue,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE idempotency_records SET resource_id = $3, response = $4 \
         WHERE actor_id = $1 AND idempotency_key = $2",
    )
    .bind(claim.actor_id.as_uuid())
    .bind(claim.key.as_str())
    .bind(resource_id)
    .bind(response)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("complete_idempotency", e))?;
    Ok(())
}

async fn load_idempotency(
    conn: &mut PgConnection,
    actor_id: ActorId,
    key: &IdempotencyKey,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT actor_id, idempotency_key, scope, resource_id, fingerprint, response,
               created_at, expires_at
        FROM idempotency_records
        WHERE actor_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(actor_id.as_uuid())
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_idempotency", e))?;

    match row {
        Some(row) => IdempotencyRow::from_row(&row)
            .map_err(|e| map_sqlx_error("decode_idempotency", e))?
            .into_record()
            .map(Some),
        None => Ok(None),
    }
}

/// Lock the balance rows for `keys` (already sorted), creating missing rows at 0.
async fn lock_balances(
    conn: &mut PgConnection,
    keys: &[BalanceKey],
) -> Result<BalanceSheet, StoreError> {
    let mut sheet = BalanceSheet::new();
    for key in keys {
        sqlx::query(
            "INSERT INTO stock_items (warehouse_id, variant_id, quantity) VALUES ($1, $2, 0) \
             ON CONFLICT (warehouse_id, variant_id) DO NOTHING",
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_balance", e))?;

        let quantity: i64 = sqlx::query_scalar(
            "SELECT quantity FROM stock_items WHERE warehouse_id = $1 AND variant_id = $2 FOR UPDATE",
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_balance", e))?;

        sheet.insert(*key, quantity);
    }
    Ok(sheet)
}

async fn write_balances(conn: &mut PgConnection, sheet: &BalanceSheet) -> Result<(), StoreError> {
    for (key, quantity) in sheet.balances() {
        sqlx::query(
            "UPDATE stock_items SET quantity = $3, updated_at = NOW() \
             WHERE warehouse_id = $1 AND variant_id = $2",
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.variant_id.as_uuid())
        .bind(*quantity)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("write_balance", e))?;
    }
    Ok(())
}

/// Insert an event and its lines; returns the assigned ledger sequence.
async fn insert_event(conn: &mut PgConnection, event: &StockEvent) -> Result<u64, StoreError> {
    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO stock_events (
            id, event_type, warehouse_id, occurred_at, reason_code, notes,
            idempotency_key, created_by, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING sequence
        "#,
    )
    .bind(event.id.as_uuid())
    .bind(event.event_type.as_str())
    .bind(event.warehouse_id.as_uuid())
    .bind(event.occurred_at)
    .bind(event.reason_code.map(|r| r.as_str()))
    .bind(event.notes.as_deref())
    .bind(event.idempotency_key.as_deref())
    .bind(event.created_by.as_uuid())
    .bind(event.created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Backend(format!("stock event {} already exists", event.id))
        } else {
            map_sqlx_error("insert_event", e)
        }
    })?;

    for (line_no, line) in event.lines.iter().enumerate() {
        sqlx::query(
            "INSERT INTO stock_event_lines (event_id, line_no, variant_id, quantity) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(event.id.as_uuid())
        .bind(line_no as i32)
        .bind(line.variant_id.as_uuid())
        .bind(line.quantity)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_event_line", e))?;
    }

    Ok(sequence as u64)
}

async fn update_transfer_state(
    conn: &mut PgConnection,
    transfer: &Transfer,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE stock_transfers
        SET status = $2,
            confirmed_by = $3,
            confirmed_at = $4,
            canceled_by = $5,
            canceled_at = $6,
            outbound_event_id = $7,
            inbound_event_id = $8,
            version = $9
        WHERE id = $1
        "#,
    )
    .bind(transfer.id.as_uuid())
    .bind(transfer.status.as_str())
    .bind(transfer.confirmed_by.map(Uuid::from))
    .bind(transfer.confirmed_at)
    .bind(transfer.canceled_by.map(Uuid::from))
    .bind(transfer.canceled_at)
    .bind(transfer.outbound_event_id.map(Uuid::from))
    .bind(transfer.inbound_event_id.map(Uuid::from))
    .bind(transfer.version as i64)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_transfer", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

async fn load_event_lines(
    conn: &mut PgConnection,
    event_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<StockEventLine>>, StoreError> {
    if event_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query(
        "SELECT event_id, variant_id, quantity FROM stock_event_lines \
         WHERE event_id = ANY($1) ORDER BY event_id, line_no",
    )
    .bind(event_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_event_lines", e))?;

    let mut lines: HashMap<Uuid, Vec<StockEventLine>> = HashMap::new();
    for row in rows {
        let event_id: Uuid = row.try_get("event_id").map_err(|e| map_sqlx_error("decode_line", e))?;
        let variant_id: Uuid = row.try_get("variant_id").map_err(|e| map_sqlx_error("decode_line", e))?;
        let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("decode_line", e))?;
        lines.entry(event_id).or_default().push(StockEventLine {
            variant_id: VariantId::from_uuid(variant_id),
            quantity,
        });
    }
    Ok(lines)
}

async fn load_transfer_lines(
    conn: &mut PgConnection,
    transfer_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<TransferLine>>, StoreError> {
    if transfer_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query(
        "SELECT transfer_id, variant_id, quantity FROM stock_transfer_lines \
         WHERE transfer_id = ANY($1) ORDER BY transfer_id, line_no",
    )
    .bind(transfer_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_transfer_lines", e))?;

    let mut lines: HashMap<Uuid, Vec<TransferLine>> = HashMap::new();
    for row in rows {
        let transfer_id: Uuid = row.try_get("transfer_id").map_err(|e| map_sqlx_error("decode_line", e))?;
        let variant_id: Uuid = row.try_get("variant_id").map_err(|e| map_sqlx_error("decode_line", e))?;
        let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("decode_line", e))?;
        lines
            .entry(transfer_id)
            .or_default()
            .push(TransferLine::new(VariantId::from_uuid(variant_id), quantity));
    }
    Ok(lines)
}

async fn load_transfer(
    conn: &mut PgConnection,
    id: TransferId,
    for_update: bool,
) -> Result<Option<Transfer>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {TRANSFER_COLUMNS} FROM stock_transfers t WHERE t.id = $1{lock}"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_transfer", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let row = TransferRow::from_row(&row).map_err(|e| map_sqlx_error("decode_transfer", e))?;
    let mut lines = load_transfer_lines(conn, &[row.id]).await?;
    let transfer_lines = lines.remove(&row.id).unwrap_or_default();
    row.into_transfer(transfer_lines).map(Some)
}

async fn balance_map(
    conn: &mut PgConnection,
    sql: &str,
) -> Result<BTreeMap<BalanceKey, i64>, StoreError> {
    let rows = sqlx::query(sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_balances", e))?;

    let mut balances = BTreeMap::new();
    for row in decode_snapshot_rows(&rows)? {
        if let Some(warehouse_id) = row.warehouse_id {
            balances.insert(BalanceKey::new(warehouse_id, row.variant_id), row.quantity);
        }
    }
    Ok(balances)
}

fn decode_snapshot_rows(rows: &[PgRow]) -> Result<Vec<SnapshotRow>, StoreError> {
    rows.iter()
        .map(|row| -> Result<SnapshotRow, sqlx::Error> {
            let warehouse_id: Option<Uuid> = row.try_get("warehouse_id")?;
            let variant_id: Uuid = row.try_get("variant_id")?;
            let quantity: i64 = row.try_get("quantity")?;
            Ok(SnapshotRow {
                warehouse_id: warehouse_id.map(WarehouseId::from_uuid),
                variant_id: VariantId::from_uuid(variant_id),
                quantity,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode_balance", e))
}

// ---------------------------------------------------------------------------
// Query fragments
// ---------------------------------------------------------------------------

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, page: PageRequest) {
    qb.push(" LIMIT ")
        .push_bind(page.limit() as i64)
        .push(" OFFSET ")
        .push_bind(page.offset() as i64);
}

fn push_range(qb: &mut QueryBuilder<'_, Postgres>, column: &str, range: &OccurredRange) {
    if let Some(from) = range.from {
        qb.push(format!(" AND {column} >= ")).push_bind(from);
    }
    if let Some(to) = range.to {
        qb.push(format!(" AND {column} <= ")).push_bind(to);
    }
}

fn push_low_stock_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    warehouse_id: Option<WarehouseId>,
    threshold: i64,
) {
    qb.push(" WHERE quantity < ").push_bind(threshold);
    if let Some(warehouse_id) = warehouse_id {
        qb.push(" AND warehouse_id = ").push_bind(*warehouse_id.as_uuid());
    }
}

fn push_event_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    if let Some(event_type) = filter.event_type {
        qb.push(" AND e.event_type = ").push_bind(event_type.as_str());
    }
    if let Some(warehouse_id) = filter.warehouse_id {
        qb.push(" AND e.warehouse_id = ").push_bind(*warehouse_id.as_uuid());
    }
    if let Some(variant_id) = filter.variant_id {
        qb.push(
            " AND EXISTS (SELECT 1 FROM stock_event_lines l WHERE l.event_id = e.id AND l.variant_id = ",
        )
        .push_bind(*variant_id.as_uuid())
        .push(")");
    }
    if let Some(reason_code) = filter.reason_code {
        qb.push(" AND e.reason_code = ").push_bind(reason_code.as_str());
    }
    push_range(qb, "e.occurred_at", &filter.range);
}

fn push_transfer_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TransferFilter) {
    if let Some(status) = filter.status {
        qb.push(" AND t.status = ").push_bind(status.as_str());
    }
    if let Some(origin) = filter.origin_warehouse_id {
        qb.push(" AND t.origin_warehouse_id = ").push_bind(*origin.as_uuid());
    }
    if let Some(destination) = filter.destination_warehouse_id {
        qb.push(" AND t.destination_warehouse_id = ").push_bind(*destination.as_uuid());
    }
    push_range(qb, "t.occurred_at", &filter.range);
}

/// CTEs `movements` and `running` for one balance key. `running.balance_after`
/// is the cumulative balance in chronological order over the whole stream.
fn push_history_source(qb: &mut QueryBuilder<'_, Postgres>, key: BalanceKey) {
    qb.push(
        "WITH movements AS (\
           SELECT e.id, e.event_type, e.reason_code, e.notes, e.occurred_at, e.created_at, \
                  e.sequence, SUM(l.quantity)::bigint AS quantity \
           FROM stock_events e JOIN stock_event_lines l ON l.event_id = e.id \
           WHERE e.warehouse_id = ",
    )
    .push_bind(*key.warehouse_id.as_uuid())
    .push(" AND l.variant_id = ")
    .push_bind(*key.variant_id.as_uuid())
    .push(
        " GROUP BY e.id), \
         running AS (\
           SELECT m.*, (SUM(m.quantity) OVER (\
               ORDER BY m.occurred_at, m.created_at, m.sequence \
               ROWS UNBOUNDED PRECEDING))::bigint AS balance_after \
           FROM movements m) ",
    );
}

/// CTEs `balances`, `filtered` and `shaped` for a snapshot.
fn push_snapshot_source(qb: &mut QueryBuilder<'_, Postgres>, filter: &SnapshotFilter) {
    qb.push("WITH balances AS (");
    match filter.as_of {
        Some(as_of) => {
            qb.push(
                "SELECT e.warehouse_id, l.variant_id, SUM(l.quantity)::bigint AS quantity \
                 FROM stock_events e JOIN stock_event_lines l ON l.event_id = e.id \
                 WHERE e.occurred_at <= ",
            )
            .push_bind(as_of)
            .push(" GROUP BY e.warehouse_id, l.variant_id");
        }
        None => {
            qb.push("SELECT warehouse_id, variant_id, quantity FROM stock_items");
        }
    }

    qb.push("), filtered AS (SELECT warehouse_id, variant_id, quantity FROM balances WHERE TRUE");
    if let Some(warehouse_id) = filter.warehouse_id {
        qb.push(" AND warehouse_id = ").push_bind(*warehouse_id.as_uuid());
    }
    if let Some(variant_ids) = &filter.variant_ids {
        let ids: Vec<Uuid> = variant_ids.iter().map(|v| *v.as_uuid()).collect();
        qb.push(" AND variant_id = ANY(").push_bind(ids).push(")");
    }

    qb.push("), shaped AS (");
    if filter.aggregate_by_warehouse {
        qb.push(
            "SELECT NULL::uuid AS warehouse_id, variant_id, SUM(quantity)::bigint AS quantity \
             FROM filtered GROUP BY variant_id",
        );
    } else {
        qb.push("SELECT warehouse_id, variant_id, quantity FROM filtered");
    }
    qb.push(") ");
}

fn push_zero_filter(qb: &mut QueryBuilder<'_, Postgres>, include_zero: bool) {
    if !include_zero {
        qb.push(" WHERE quantity <> 0");
    }
}

/// Null placement matching `Option` ordering (`None` first when ascending).
fn nulls(direction: SortDirection) -> &'static str {
    if direction.is_ascending() {
        "NULLS FIRST"
    } else {
        "NULLS LAST"
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => classify_sqlstate(
            db_err.code().as_deref(),
            format!("database error in {}: {}", operation, db_err.message()),
        ),
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(io) => StoreError::Transient(format!("io error in {}: {}", operation, io)),
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("row decoding failed in {}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Map a Postgres SQLSTATE onto the store taxonomy.
///
/// Lock waits, serialization failures and deadlocks are retryable and never
/// surface as business conflicts. Unique violations are only meaningful to
/// the statement that raised them, so callers check [`is_unique_violation`]
/// first; anything reaching this point is a backend failure.
fn classify_sqlstate(code: Option<&str>, message: String) -> StoreError {
    match code {
        Some(LOCK_NOT_AVAILABLE) => StoreError::LockTimeout(message),
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => StoreError::Transient(message),
        _ => StoreError::Backend(message),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

fn decode<T>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr<Err = DomainError>,
{
    raw.parse()
        .map_err(|e| StoreError::Serialization(format!("unreadable {column} {raw:?}: {e}")))
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    id: Uuid,
    sequence: i64,
    event_type: String,
    warehouse_id: Uuid,
    occurred_at: DateTime<Utc>,
    reason_code: Option<String>,
    notes: Option<String>,
    idempotency_key: Option<String>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            sequence: row.try_get("sequence")?,
            event_type: row.try_get("event_type")?,
            warehouse_id: row.try_get("warehouse_id")?,
            occurred_at: row.try_get("occurred_at")?,
            reason_code: row.try_get("reason_code")?,
            notes: row.try_get("notes")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl EventRow {
    fn into_event(self, lines: Vec<StockEventLine>) -> Result<StockEvent, StoreError> {
        Ok(StockEvent {
            id: StockEventId::from_uuid(self.id),
            event_type: decode("event_type", &self.event_type)?,
            warehouse_id: WarehouseId::from_uuid(self.warehouse_id),
            occurred_at: self.occurred_at,
            reason_code: self
                .reason_code
                .as_deref()
                .map(|raw| decode("reason_code", raw))
                .transpose()?,
            notes: self.notes,
            idempotency_key: self.idempotency_key,
            created_by: ActorId::from_uuid(self.created_by),
            created_at: self.created_at,
            sequence: self.sequence as u64,
            lines,
        })
    }
}

#[derive(Debug)]
struct HistoryRow {
    id: Uuid,
    event_type: String,
    reason_code: Option<String>,
    notes: Option<String>,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    quantity: i64,
    balance_after: i64,
}

impl<'r> FromRow<'r, PgRow> for HistoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HistoryRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            reason_code: row.try_get("reason_code")?,
            notes: row.try_get("notes")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            quantity: row.try_get("quantity")?,
            balance_after: row.try_get("balance_after")?,
        })
    }
}

impl HistoryRow {
    fn into_entry(self, key: BalanceKey) -> Result<HistoryEntry, StoreError> {
        Ok(HistoryEntry {
            event_id: StockEventId::from_uuid(self.id),
            event_type: decode("event_type", &self.event_type)?,
            reason_code: self
                .reason_code
                .as_deref()
                .map(|raw| decode("reason_code", raw))
                .transpose()?,
            notes: self.notes,
            key,
            occurred_at: self.occurred_at,
            created_at: self.created_at,
            quantity_change: self.quantity,
            balance_before: self.balance_after - self.quantity,
            balance_after: self.balance_after,
        })
    }
}

#[derive(Debug)]
struct TransferRow {
    id: Uuid,
    origin_warehouse_id: Uuid,
    destination_warehouse_id: Uuid,
    status: String,
    occurred_at: DateTime<Utc>,
    notes: Option<String>,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    confirmed_by: Option<Uuid>,
    confirmed_at: Option<DateTime<Utc>>,
    canceled_by: Option<Uuid>,
    canceled_at: Option<DateTime<Utc>>,
    outbound_event_id: Option<Uuid>,
    inbound_event_id: Option<Uuid>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for TransferRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransferRow {
            id: row.try_get("id")?,
            origin_warehouse_id: row.try_get("origin_warehouse_id")?,
            destination_warehouse_id: row.try_get("destination_warehouse_id")?,
            status: row.try_get("status")?,
            occurred_at: row.try_get("occurred_at")?,
            notes: row.try_get("notes")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            confirmed_by: row.try_get("confirmed_by")?,
            confirmed_at: row.try_get("confirmed_at")?,
            canceled_by: row.try_get("canceled_by")?,
            canceled_at: row.try_get("canceled_at")?,
            outbound_event_id: row.try_get("outbound_event_id")?,
            inbound_event_id: row.try_get("inbound_event_id")?,
            version: row.try_get("version")?,
        })
    }
}

impl TransferRow {
    fn into_transfer(self, lines: Vec<TransferLine>) -> Result<Transfer, StoreError> {
        Ok(Transfer {
            id: TransferId::from_uuid(self.id),
            origin_warehouse_id: WarehouseId::from_uuid(self.origin_warehouse_id),
            destination_warehouse_id: WarehouseId::from_uuid(self.destination_warehouse_id),
            status: decode("status", &self.status)?,
            occurred_at: self.occurred_at,
            notes: self.notes,
            created_by: self.created_by.map(ActorId::from_uuid),
            created_at: self.created_at,
            confirmed_by: self.confirmed_by.map(ActorId::from_uuid),
            confirmed_at: self.confirmed_at,
            canceled_by: self.canceled_by.map(ActorId::from_uuid),
            canceled_at: self.canceled_at,
            outbound_event_id: self.outbound_event_id.map(StockEventId::from_uuid),
            inbound_event_id: self.inbound_event_id.map(StockEventId::from_uuid),
            lines,
            version: self.version as u64,
        })
    }
}

#[derive(Debug)]
struct IdempotencyRow {
    actor_id: Uuid,
    idempotency_key: String,
    scope: String,
    resource_id: Option<Uuid>,
    fingerprint: String,
    response: Option<JsonValue>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for IdempotencyRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(IdempotencyRow {
            actor_id: row.try_get("actor_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            scope: row.try_get("scope")?,
            resource_id: row.try_get("resource_id")?,
            fingerprint: row.try_get("fingerprint")?,
            response: row.try_get("response")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl IdempotencyRow {
    fn into_record(self) -> Result<IdempotencyRecord, StoreError> {
        let scope = IdempotencyScope::parse(&self.scope).ok_or_else(|| {
            StoreError::Serialization(format!("unknown idempotency scope {:?}", self.scope))
        })?;
        let key = IdempotencyKey::parse(Some(&self.idempotency_key))
            .ok()
            .flatten()
            .ok_or_else(|| {
                StoreError::Serialization(format!(
                    "stored idempotency key {:?} is not a valid key",
                    self.idempotency_key
                ))
            })?;
        // Both are NULL until the claiming transaction completes its claim.
        let (Some(resource_id), Some(response)) = (self.resource_id, self.response) else {
            return Err(StoreError::Transient(format!(
                "idempotent request for key {key} is still in flight"
            )));
        };

        Ok(IdempotencyRecord {
            actor_id: ActorId::from_uuid(self.actor_id),
            key,
            scope,
            resource_id,
            fingerprint: self.fingerprint,
            response,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: &str) -> StoreError {
        classify_sqlstate(Some(code), format!("sqlstate {code}"))
    }

    #[test]
    fn lock_waits_are_lock_timeouts() {
        let err = classify(LOCK_NOT_AVAILABLE);
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert!(err.is_transient());
        assert!(err.domain().is_none());
    }

    #[test]
    fn serialization_failures_and_deadlocks_are_transient() {
        for code in [SERIALIZATION_FAILURE, DEADLOCK_DETECTED] {
            let err = classify(code);
            assert!(matches!(err, StoreError::Transient(_)), "{code} -> {err:?}");
            assert!(err.is_transient());
            assert!(err.domain().is_none());
        }
    }

    #[test]
    fn unique_and_unknown_codes_are_backend_failures() {
        for code in [UNIQUE_VIOLATION, "23503", "42P01"] {
            let err = classify(code);
            assert!(matches!(err, StoreError::Backend(_)), "{code} -> {err:?}");
            assert!(!err.is_transient());
        }
        assert!(matches!(
            classify_sqlstate(None, "no code".to_string()),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn non_database_errors_follow_their_kind() {
        assert!(map_sqlx_error("append_event", sqlx::Error::PoolTimedOut).is_transient());
        assert!(matches!(
            map_sqlx_error("append_event", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            map_sqlx_error("get_event", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
