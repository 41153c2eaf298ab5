//! In-memory `TradeStore` for paper sessions and tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::domain::entities::trade::{NewTrade, PositionState, TradeRecord};
use crate::domain::repositories::{StoreError, StoreResult, TradeStore};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    trades: BTreeMap<i64, TradeRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    inner: RwLock<Inner>,
}

impl InMemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.trades.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.trades.is_empty()
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn insert(&self, trade: NewTrade, now: DateTime<Utc>) -> StoreResult<TradeRecord> {
        let mut inner = self.inner.write().await;
        if inner
            .trades
            .values()
            .any(|t| t.leg_for(&trade.entry_order_id).is_some())
        {
            return Err(StoreError::DuplicateOrderId(trade.entry_order_id));
        }

        inner.next_id += 1;
        let record = TradeRecord::pending(inner.next_id, trade, now);
        inner.trades.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<TradeRecord>> {
        Ok(self.inner.read().await.trades.get(&id).cloned())
    }

    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<TradeRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .trades
            .values()
            .rev()
            .find(|t| t.leg_for(order_id).is_some())
            .cloned())
    }

    async fn update(&self, trade: &TradeRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(exit_id) = trade.exit_order_id.as_deref() {
            let taken = trade.entry_order_id == exit_id
                || inner
                    .trades
                    .values()
                    .any(|t| t.id != trade.id && t.leg_for(exit_id).is_some());
            if taken {
                return Err(StoreError::DuplicateOrderId(exit_id.to_string()));
            }
        }
        match inner.trades.get_mut(&trade.id) {
            Some(slot) => {
                *slot = trade.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(trade.id)),
        }
    }

    async fn open_trades(&self) -> StoreResult<Vec<TradeRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .trades
            .values()
            .filter(|t| t.is_open())
            .cloned()
            .collect())
    }

    async fn trades_closed_on(&self, date: NaiveDate) -> StoreResult<Vec<TradeRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .trades
            .values()
            .filter(|t| {
                t.position_state == PositionState::ExitFilled
                    && t.exit_fill_time.map(|ts| ts.date_naive()) == Some(date)
            })
            .cloned()
            .collect())
    }
}
