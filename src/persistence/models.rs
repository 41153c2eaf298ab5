//! Database Models
//!
//! Row shape of the `trades` table and its conversion to the domain record.
//! Enum columns are stored as their wire strings and parsed on the way out,
//! so a row with an unknown state surfaces as an error instead of a guess.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::domain::entities::trade::{OrderStatus, PositionState, TradeRecord};
use crate::domain::repositories::StoreError;

#[derive(Debug, Clone, FromRow)]
pub struct TradeRow {
    pub id: i64,
    pub symbol: String,
    pub quantity: i64,
    pub requested_entry_price: f64,
    pub stop_loss: f64,
    pub target: Option<f64>,
    pub strategy_id: String,
    pub entry_order_id: String,
    pub entry_order_status: String,
    pub entry_fill_price: Option<f64>,
    pub entry_fill_time: Option<DateTime<Utc>>,
    pub exit_order_id: Option<String>,
    pub exit_order_status: Option<String>,
    pub exit_fill_price: Option<f64>,
    pub exit_fill_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub position_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = StoreError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id, reason };

        let quantity = u32::try_from(row.quantity)
            .map_err(|_| corrupt(format!("quantity out of range: {}", row.quantity)))?;
        let entry_order_status: OrderStatus = row.entry_order_status.parse().map_err(corrupt)?;
        let exit_order_status = row
            .exit_order_status
            .as_deref()
            .map(str::parse::<OrderStatus>)
            .transpose()
            .map_err(corrupt)?;
        let position_state: PositionState = row.position_state.parse().map_err(corrupt)?;

        Ok(TradeRecord {
            id: row.id,
            symbol: row.symbol,
            quantity,
            requested_entry_price: row.requested_entry_price,
            stop_loss: row.stop_loss,
            target: row.target,
            strategy_id: row.strategy_id,
            entry_order_id: row.entry_order_id,
            entry_order_status,
            entry_fill_price: row.entry_fill_price,
            entry_fill_time: row.entry_fill_time,
            exit_order_id: row.exit_order_id,
            exit_order_status,
            exit_fill_price: row.exit_fill_price,
            exit_fill_time: row.exit_fill_time,
            exit_reason: row.exit_reason,
            position_state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
