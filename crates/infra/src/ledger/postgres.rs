//! Postgres-backed ledger store.
//!
//! Balances live in `inventory`, movements in `inventory_movements` (schema in
//! `migrations/0001_inventory.sql`). Optional key parts are stored as NULL and
//! matched with `IS NOT DISTINCT FROM`, so the unscoped balance never collides
//! with a store-scoped one.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation on the reference index) | `23505` | `Duplicate` | Movement for the same key + reference already recorded |
//! | Database (other) | Any other | `Backend` | Check constraint, lost connection, etc. |
//! | PoolClosed / Other | N/A | `Backend` | Pool shut down, network errors |
//! | Row decode failure | N/A | `Corrupt` | Column missing or unknown movement type |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{
    ActorId, BalanceId, MerchantId, MovementId, PageRequest, Paged, ProductId, StockKey, StoreId,
    VariantId,
};
use stockledger_inventory::{MovementFilter, MovementRecord, MovementType, StockBalance};

use async_trait::async_trait;

use super::{LedgerError, LedgerStore};

const REFERENCE_INDEX: &str = "inventory_movements_reference_unique";

const BALANCE_COLUMNS: &str = "id, merchant_id, store_id, product_id, variant_id, quantity, \
     reserved_quantity, reorder_point, reorder_quantity, last_counted_at, updated_at";

const MOVEMENT_COLUMNS: &str = "id, merchant_id, store_id, product_id, variant_id, movement_type, \
     quantity_change, quantity_before, quantity_after, reference_type, reference_id, notes, \
     created_by, created_at";

/// Ledger store over a shared SQLx pool.
///
/// `apply_adjustment` runs the balance upsert and the movement insert in one
/// transaction; either both rows are visible or neither is.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(include_str!("../../migrations/0001_inventory.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn get_balance(&self, key: &StockKey) -> Result<Option<StockBalance>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {BALANCE_COLUMNS}
            FROM inventory
            WHERE merchant_id = $1
              AND store_id IS NOT DISTINCT FROM $2
              AND product_id = $3
              AND variant_id IS NOT DISTINCT FROM $4
            "#
        ))
        .bind(key.merchant_id.as_str())
        .bind(key.store_id.as_ref().map(StoreId::as_str))
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_ref().map(VariantId::as_str))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_balance", e))?;

        row.map(|r| decode_balance(&r)).transpose()
    }

    #[instrument(
        skip(self, balance, movement),
        fields(
            key = %balance.key,
            movement_id = %movement.movement_id,
            quantity_after = movement.quantity_after
        ),
        err
    )]
    async fn apply_adjustment(
        &self,
        balance: &StockBalance,
        movement: &MovementRecord,
    ) -> Result<(), LedgerError> {
        if balance.key != movement.key {
            return Err(LedgerError::Backend("balance and movement keys differ".to_string()));
        }
        let key = &balance.key;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO inventory (
                id, merchant_id, store_id, product_id, variant_id,
                quantity, reserved_quantity, reorder_point, reorder_quantity,
                last_counted_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT ON CONSTRAINT inventory_stock_key_unique
            DO UPDATE SET
                quantity = EXCLUDED.quantity,
                reserved_quantity = EXCLUDED.reserved_quantity,
                last_counted_at = EXCLUDED.last_counted_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(balance.balance_id.as_uuid())
        .bind(key.merchant_id.as_str())
        .bind(key.store_id.as_ref().map(StoreId::as_str))
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_ref().map(VariantId::as_str))
        .bind(balance.quantity)
        .bind(balance.reserved_quantity)
        .bind(balance.reorder_point)
        .bind(balance.reorder_quantity)
        .bind(balance.last_counted_at)
        .bind(balance.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_balance", e))?;

        sqlx::query(
            r#"
            INSERT INTO inventory_movements (
                id, merchant_id, store_id, product_id, variant_id,
                movement_type, quantity_change, quantity_before, quantity_after,
                reference_type, reference_id, notes, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(movement.movement_id.as_uuid())
        .bind(key.merchant_id.as_str())
        .bind(key.store_id.as_ref().map(StoreId::as_str))
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_ref().map(VariantId::as_str))
        .bind(movement.movement_type.as_str())
        .bind(movement.quantity_change)
        .bind(movement.quantity_before)
        .bind(movement.quantity_after)
        .bind(movement.reference_type.as_deref())
        .bind(movement.reference_id.as_deref())
        .bind(&movement.notes)
        .bind(movement.created_by.as_ref().map(ActorId::as_str))
        .bind(movement.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_movement", e))?;

        // Dropping `tx` on any early return above rolls back.
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn find_movement_by_reference(
        &self,
        key: &StockKey,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Option<MovementRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM inventory_movements
            WHERE merchant_id = $1
              AND store_id IS NOT DISTINCT FROM $2
              AND product_id = $3
              AND variant_id IS NOT DISTINCT FROM $4
              AND reference_type = $5
              AND reference_id = $6
            LIMIT 1
            "#
        ))
        .bind(key.merchant_id.as_str())
        .bind(key.store_id.as_ref().map(StoreId::as_str))
        .bind(key.product_id.as_str())
        .bind(key.variant_id.as_ref().map(VariantId::as_str))
        .bind(reference_type)
        .bind(reference_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_movement_by_reference", e))?;

        row.map(|r| decode_movement(&r)).transpose()
    }

    #[instrument(
        skip(self),
        fields(merchant_id = %merchant_id, row_count = tracing::field::Empty),
        err
    )]
    async fn list_low_stock(
        &self,
        merchant_id: &MerchantId,
        store_id: Option<&StoreId>,
        page: PageRequest,
    ) -> Result<Paged<StockBalance>, LedgerError> {
        let push_where = |qb: &mut QueryBuilder<'_, Postgres>| {
            qb.push(" WHERE merchant_id = ")
                .push_bind(merchant_id.as_str().to_string())
                .push(" AND available_quantity <= reorder_point AND reorder_point > 0");
            if let Some(store) = store_id {
                qb.push(" AND store_id = ").push_bind(store.as_str().to_string());
            }
        };

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM inventory");
        push_where(&mut count);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_low_stock", e))?;

        let mut query = QueryBuilder::<Postgres>::new(format!("SELECT {BALANCE_COLUMNS} FROM inventory"));
        push_where(&mut query);
        push_page(&mut query, " ORDER BY updated_at DESC, id DESC", page);
        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_low_stock", e))?;

        let items = rows.iter().map(decode_balance).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("row_count", items.len());
        Ok(Paged {
            items,
            total: u64::try_from(total).unwrap_or(0),
            page,
        })
    }

    #[instrument(skip(self), fields(merchant_id = %filter.merchant_id), err)]
    async fn list_movements(
        &self,
        filter: &MovementFilter,
        page: PageRequest,
    ) -> Result<Paged<MovementRecord>, LedgerError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM inventory_movements");
        push_movement_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_movements", e))?;

        let mut query =
            QueryBuilder::<Postgres>::new(format!("SELECT {MOVEMENT_COLUMNS} FROM inventory_movements"));
        push_movement_filter(&mut query, filter);
        push_page(&mut query, " ORDER BY created_at DESC, id DESC", page);
        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_movements", e))?;

        let items = rows.iter().map(decode_movement).collect::<Result<Vec<_>, _>>()?;
        Ok(Paged {
            items,
            total: u64::try_from(total).unwrap_or(0),
            page,
        })
    }
}

fn push_movement_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &MovementFilter) {
    qb.push(" WHERE merchant_id = ")
        .push_bind(filter.merchant_id.as_str().to_string());
    if let Some(product) = &filter.product_id {
        qb.push(" AND product_id = ").push_bind(product.as_str().to_string());
    }
    if let Some(store) = &filter.store_id {
        qb.push(" AND store_id = ").push_bind(store.as_str().to_string());
    }
    if let Some(kind) = filter.movement_type {
        qb.push(" AND movement_type = ").push_bind(kind.as_str());
    }
    if let Some(from) = filter.created_from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
}

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, order_by: &str, page: PageRequest) {
    qb.push(order_by)
        .push(" LIMIT ")
        .push_bind(i64::try_from(page.limit()).unwrap_or(i64::MAX))
        .push(" OFFSET ")
        .push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let is_unique = db_err.code().is_some_and(|c| c.as_ref() == "23505");
            if is_unique && db_err.constraint() == Some(REFERENCE_INDEX) {
                LedgerError::Duplicate(msg)
            } else {
                LedgerError::Backend(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            LedgerError::Corrupt(format!("{} in {}", err, operation))
        }
        _ => LedgerError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct BalanceRow {
    id: Uuid,
    merchant_id: String,
    store_id: Option<String>,
    product_id: String,
    variant_id: Option<String>,
    quantity: f64,
    reserved_quantity: f64,
    reorder_point: f64,
    reorder_quantity: f64,
    last_counted_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BalanceRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(BalanceRow {
            id: row.try_get("id")?,
            merchant_id: row.try_get("merchant_id")?,
            store_id: row.try_get("store_id")?,
            product_id: row.try_get("product_id")?,
            variant_id: row.try_get("variant_id")?,
            quantity: row.try_get("quantity")?,
            reserved_quantity: row.try_get("reserved_quantity")?,
            reorder_point: row.try_get("reorder_point")?,
            reorder_quantity: row.try_get("reorder_quantity")?,
            last_counted_at: row.try_get("last_counted_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug)]
struct MovementRow {
    id: Uuid,
    merchant_id: String,
    store_id: Option<String>,
    product_id: String,
    variant_id: Option<String>,
    movement_type: String,
    quantity_change: f64,
    quantity_before: f64,
    quantity_after: f64,
    reference_type: Option<String>,
    reference_id: Option<String>,
    notes: String,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for MovementRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            id: row.try_get("id")?,
            merchant_id: row.try_get("merchant_id")?,
            store_id: row.try_get("store_id")?,
            product_id: row.try_get("product_id")?,
            variant_id: row.try_get("variant_id")?,
            movement_type: row.try_get("movement_type")?,
            quantity_change: row.try_get("quantity_change")?,
            quantity_before: row.try_get("quantity_before")?,
            quantity_after: row.try_get("quantity_after")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            notes: row.try_get("notes")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn row_key(
    merchant_id: String,
    store_id: Option<String>,
    product_id: String,
    variant_id: Option<String>,
) -> StockKey {
    StockKey::new(
        MerchantId::new(merchant_id),
        store_id.map(StoreId::new),
        ProductId::new(product_id),
        variant_id.map(VariantId::new),
    )
}

fn decode_balance(row: &sqlx::postgres::PgRow) -> Result<StockBalance, LedgerError> {
    let r = BalanceRow::from_row(row)
        .map_err(|e| LedgerError::Corrupt(format!("failed to deserialize balance row: {}", e)))?;
    Ok(StockBalance {
        balance_id: BalanceId::from_uuid(r.id),
        key: row_key(r.merchant_id, r.store_id, r.product_id, r.variant_id),
        quantity: r.quantity,
        reserved_quantity: r.reserved_quantity,
        reorder_point: r.reorder_point,
        reorder_quantity: r.reorder_quantity,
        last_counted_at: r.last_counted_at,
        updated_at: r.updated_at,
    })
}

fn decode_movement(row: &sqlx::postgres::PgRow) -> Result<MovementRecord, LedgerError> {
    let r = MovementRow::from_row(row)
        .map_err(|e| LedgerError::Corrupt(format!("failed to deserialize movement row: {}", e)))?;
    let movement_type = r
        .movement_type
        .parse::<MovementType>()
        .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    Ok(MovementRecord {
        movement_id: MovementId::from_uuid(r.id),
        key: row_key(r.merchant_id, r.store_id, r.product_id, r.variant_id),
        movement_type,
        quantity_change: r.quantity_change,
        quantity_before: r.quantity_before,
        quantity_after: r.quantity_after,
        reference_type: r.reference_type,
        reference_id: r.reference_id,
        notes: r.notes,
        created_by: r.created_by.map(ActorId::new),
        created_at: r.created_at,
    })
}
