//! Trade Store Trait
//!
//! Persistence boundary for trade records. The fill reconciler reads and
//! writes through this trait so it runs the same against SQLite and the
//! in-memory store used in tests.

use crate::domain::entities::trade::{NewTrade, TradeRecord};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("trade not found: {0}")]
    NotFound(i64),

    #[error("order id already recorded: {0}")]
    DuplicateOrderId(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("corrupt trade row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Trade-record reads and writes keyed by trade ID and broker order ID
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Persist a new trade at `ENTRY_PENDING` and return it with its ID.
    ///
    /// An order ID names at most one leg of one trade; an entry ID already
    /// used by any entry or exit is `DuplicateOrderId`.
    async fn insert(&self, trade: NewTrade, now: DateTime<Utc>) -> StoreResult<TradeRecord>;

    async fn get(&self, id: i64) -> StoreResult<Option<TradeRecord>>;

    /// Trade whose entry or exit order carries `order_id`, whatever its state
    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<TradeRecord>>;

    /// Overwrite a trade's mutable fields.
    ///
    /// `DuplicateOrderId` when the exit order ID is this trade's entry ID or
    /// any leg of another trade.
    async fn update(&self, trade: &TradeRecord) -> StoreResult<()>;

    /// Trades in `ENTRY_PENDING`, `ENTRY_FILLED` or `EXIT_PENDING`
    async fn open_trades(&self) -> StoreResult<Vec<TradeRecord>>;

    /// `EXIT_FILLED` trades whose exit filled on `date` (UTC)
    async fn trades_closed_on(&self, date: NaiveDate) -> StoreResult<Vec<TradeRecord>>;
}
