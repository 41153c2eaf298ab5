//! Database Repository
//!
//! SQLite implementation of `TradeStore`.

use super::models::TradeRow;
use super::DbPool;
use crate::domain::entities::trade::{NewTrade, PositionState, TradeRecord};
use crate::domain::repositories::{StoreError, StoreResult, TradeStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct SqliteTradeStore {
    pool: DbPool,
}

impl SqliteTradeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn query_error(context: &str, e: sqlx::Error) -> StoreError {
        error!("{}: {}", context, e);
        StoreError::Query(format!("{}: {}", context, e))
    }

    fn into_records(rows: Vec<TradeRow>) -> StoreResult<Vec<TradeRecord>> {
        rows.into_iter().map(TradeRecord::try_from).collect()
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn insert(&self, trade: NewTrade, now: DateTime<Utc>) -> StoreResult<TradeRecord> {
        let row = sqlx::query_as::<_, TradeRow>(
            r#"
            INSERT INTO trades (
                symbol, quantity, requested_entry_price, stop_loss, target, strategy_id,
                entry_order_id, entry_order_status, position_state, created_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8, ?9, ?9
            WHERE NOT EXISTS (SELECT 1 FROM trades WHERE exit_order_id = ?7)
            RETURNING *
            "#,
        )
        .bind(&trade.symbol)
        .bind(i64::from(trade.quantity))
        .bind(trade.requested_entry_price)
        .bind(trade.stop_loss)
        .bind(trade.target)
        .bind(&trade.strategy_id)
        .bind(&trade.entry_order_id)
        .bind(PositionState::EntryPending.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateOrderId(trade.entry_order_id.clone())
            }
            other => Self::query_error("Failed to insert trade", other),
        })?
        .ok_or_else(|| StoreError::DuplicateOrderId(trade.entry_order_id.clone()))?;

        let record = TradeRecord::try_from(row)?;
        debug!(trade_id = record.id, symbol = %record.symbol, "Inserted trade");
        Ok(record)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<TradeRecord>> {
        let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::query_error("Failed to get trade", e))?;

        row.map(TradeRecord::try_from).transpose()
    }

    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<TradeRecord>> {
        let row = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT * FROM trades
            WHERE entry_order_id = ?1 OR exit_order_id = ?1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::query_error("Failed to find trade by order id", e))?;

        row.map(TradeRecord::try_from).transpose()
    }

    async fn update(&self, trade: &TradeRecord) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE trades
            SET entry_order_status = ?1, entry_fill_price = ?2, entry_fill_time = ?3,
                exit_order_id = ?4, exit_order_status = ?5, exit_fill_price = ?6,
                exit_fill_time = ?7, exit_reason = ?8, position_state = ?9, updated_at = ?10
            WHERE id = ?11
              AND (?4 IS NULL OR NOT EXISTS (
                  SELECT 1 FROM trades AS peer
                  WHERE peer.entry_order_id = ?4
                     OR (peer.exit_order_id = ?4 AND peer.id <> ?11)
              ))
            "#,
        )
        .bind(trade.entry_order_status.as_str())
        .bind(trade.entry_fill_price)
        .bind(trade.entry_fill_time)
        .bind(trade.exit_order_id.as_deref())
        .bind(trade.exit_order_status.map(|s| s.as_str()))
        .bind(trade.exit_fill_price)
        .bind(trade.exit_fill_time)
        .bind(trade.exit_reason.as_deref())
        .bind(trade.position_state.as_str())
        .bind(trade.updated_at)
        .bind(trade.id)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateOrderId(trade.exit_order_id.clone().unwrap_or_default())
            }
            other => Self::query_error("Failed to update trade", other),
        })?
        .rows_affected();

        if rows_affected == 0 {
            return match (self.get(trade.id).await?, trade.exit_order_id.as_deref()) {
                (Some(_), Some(exit_id)) => Err(StoreError::DuplicateOrderId(exit_id.to_string())),
                _ => Err(StoreError::NotFound(trade.id)),
            };
        }

        debug!(trade_id = trade.id, state = %trade.position_state, "Updated trade");
        Ok(())
    }

    async fn open_trades(&self) -> StoreResult<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT * FROM trades
            WHERE position_state IN ('ENTRY_PENDING', 'ENTRY_FILLED', 'EXIT_PENDING')
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::query_error("Failed to load open trades", e))?;

        Self::into_records(rows)
    }

    async fn trades_closed_on(&self, date: NaiveDate) -> StoreResult<Vec<TradeRecord>> {
        let (Some(start), Some(end)) = (
            date.and_hms_opt(0, 0, 0).map(|d| d.and_utc()),
            date.succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| d.and_utc()),
        ) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT * FROM trades
            WHERE position_state = 'EXIT_FILLED'
              AND exit_fill_time >= ?1 AND exit_fill_time < ?2
            ORDER BY exit_fill_time
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::query_error("Failed to load closed trades", e))?;

        Self::into_records(rows)
    }
}
