use thiserror::Error;

use crate::domain::entities::trade::{OrderStatus, PositionState};

/// Refused lifecycle changes on a trade record
///
/// A refused transition leaves the record untouched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransitionError {
    #[error("illegal transition for trade {trade_id}: {from} -> {to}")]
    IllegalTransition {
        trade_id: i64,
        from: PositionState,
        to: PositionState,
    },

    #[error("order {order_id} reported {status} without a fill price")]
    MissingFillPrice {
        order_id: String,
        status: OrderStatus,
    },

    #[error("order {order_id} does not belong to trade {trade_id}")]
    OrderNotOnTrade { trade_id: i64, order_id: String },

    #[error("trade {trade_id} already has exit order {order_id} pending")]
    ExitAlreadyPending { trade_id: i64, order_id: String },

    #[error("trade {trade_id} is {state}, no filled entry to exit")]
    NotHolding { trade_id: i64, state: PositionState },
}
