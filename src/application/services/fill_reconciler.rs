//! Fill reconciliation
//!
//! Applies broker postbacks to persisted trades. Each trade has its own async
//! lock; the record is re-read under it, so two deliveries of the same fill
//! can never both advance the trade. Rejections feed the circuit breaker and
//! confirmed fills clear its consecutive-failure count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::handlers::postback::{HandlerError, OrderUpdateHandler};
use crate::domain::entities::order_update::OrderUpdate;
use crate::domain::entities::trade::{NewTrade, OrderStatus, TradeRecord};
use crate::domain::errors::TransitionError;
use crate::domain::repositories::{StoreError, TradeStore};
use crate::domain::services::circuit_breaker::CircuitBreaker;
use crate::domain::services::clock::{Clock, SystemClock};
use crate::domain::services::gatekeeper::PortfolioSnapshot;
use crate::domain::services::order_lifecycle::{self, LifecycleEvent};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What happened to a postback
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Trade state advanced and was persisted
    Applied { trade_id: i64, event: LifecycleEvent },
    /// Redelivery of a status the leg already has
    Duplicate { trade_id: i64 },
    /// Different terminal status on a settled leg; discarded
    Stale {
        trade_id: i64,
        current: OrderStatus,
        reported: OrderStatus,
    },
    /// Non-terminal status; nothing to record
    Unchanged { trade_id: i64, status: OrderStatus },
    /// No trade carries this order ID
    UnknownOrder { order_id: String },
}

type TradeLock = Arc<tokio::sync::Mutex<()>>;

pub struct FillReconciler {
    store: Arc<dyn TradeStore>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<i64, TradeLock>>,
}

impl std::fmt::Debug for FillReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillReconciler")
            .field("breaker", &self.breaker)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl FillReconciler {
    pub fn new(store: Arc<dyn TradeStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_clock(store, breaker, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn TradeStore>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            breaker,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    fn trade_lock(&self, trade_id: i64) -> TradeLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(trade_id).or_default().clone()
    }

    // Terminal trades never change again, so a fresh lock later is harmless.
    fn release_lock(&self, trade_id: i64) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(&trade_id);
    }

    /// Track a trade whose entry order was just accepted by the broker.
    pub async fn record_entry_order(&self, trade: NewTrade) -> Result<TradeRecord, ReconcileError> {
        let record = self.store.insert(trade, self.clock.now()).await?;
        info!(
            trade_id = record.id,
            symbol = %record.symbol,
            order_id = %record.entry_order_id,
            "entry order recorded"
        );
        Ok(record)
    }

    /// Attach a placed exit order to a held position.
    ///
    /// Refused while another exit order for the trade is still pending, and
    /// with `DuplicateOrderId` when the ID already names another order leg.
    pub async fn record_exit_order(
        &self,
        trade_id: i64,
        exit_order_id: &str,
        reason: Option<String>,
    ) -> Result<TradeRecord, ReconcileError> {
        let lock = self.trade_lock(trade_id);
        let _guard = lock.lock().await;

        let mut trade = self
            .store
            .get(trade_id)
            .await?
            .ok_or(StoreError::NotFound(trade_id))?;
        order_lifecycle::begin_exit(&mut trade, exit_order_id, reason, self.clock.now())?;
        self.store.update(&trade).await?;

        info!(trade_id, symbol = %trade.symbol, order_id = exit_order_id, "exit order recorded");
        Ok(trade)
    }

    /// Apply one broker postback.
    pub async fn handle_update(&self, update: &OrderUpdate) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(found) = self.store.find_by_order_id(&update.order_id).await? else {
            warn!(order_id = %update.order_id, status = %update.status, "postback for unknown order discarded");
            return Ok(ReconcileOutcome::UnknownOrder {
                order_id: update.order_id.clone(),
            });
        };
        let trade_id = found.id;

        let lock = self.trade_lock(trade_id);
        let _guard = lock.lock().await;

        let mut trade = self
            .store
            .get(trade_id)
            .await?
            .ok_or(StoreError::NotFound(trade_id))?;

        let event = match order_lifecycle::apply_order_update(&mut trade, update, self.clock.now()) {
            Ok(event) => event,
            Err(TransitionError::OrderNotOnTrade { order_id, .. }) => {
                // exit order was replaced between lookup and lock
                warn!(trade_id, %order_id, "postback no longer matches trade");
                return Ok(ReconcileOutcome::UnknownOrder { order_id });
            }
            Err(e) => {
                error!(trade_id, order_id = %update.order_id, "postback refused: {}", e);
                return Err(e.into());
            }
        };

        if event.changed_state() {
            self.store.update(&trade).await?;
        }

        self.feed_breaker(&trade, update, &event).await;

        if trade.position_state.is_terminal() {
            self.release_lock(trade_id);
        }

        Ok(match event {
            LifecycleEvent::Duplicate { leg, status } => {
                debug!(trade_id, %leg, %status, "duplicate postback ignored");
                ReconcileOutcome::Duplicate { trade_id }
            }
            LifecycleEvent::Stale {
                leg,
                current,
                reported,
            } => {
                warn!(trade_id, %leg, %current, %reported, "stale postback ignored");
                ReconcileOutcome::Stale {
                    trade_id,
                    current,
                    reported,
                }
            }
            LifecycleEvent::Unchanged { leg, status } => {
                debug!(trade_id, %leg, %status, filled = update.filled_qty, "order still working");
                ReconcileOutcome::Unchanged { trade_id, status }
            }
            event => {
                info!(
                    trade_id,
                    symbol = %trade.symbol,
                    state = %trade.position_state,
                    "trade updated: {:?}",
                    event
                );
                ReconcileOutcome::Applied { trade_id, event }
            }
        })
    }

    async fn feed_breaker(&self, trade: &TradeRecord, update: &OrderUpdate, event: &LifecycleEvent) {
        if event.is_fill() {
            self.breaker.record_success().await;
        } else if event.is_rejection() {
            let reason = format!(
                "order rejected: {} {}: {}",
                update.order_id, trade.symbol, update.error_message
            );
            self.breaker.record_failure(&reason).await;
        } else if let LifecycleEvent::EntryCancelled { .. } | LifecycleEvent::ExitFailed { .. } = event {
            info!(trade_id = trade.id, order_id = %update.order_id, "order cancelled");
        }
    }

    /// Portfolio view for the gatekeeper, derived from confirmed fills.
    pub async fn portfolio_snapshot(
        &self,
        available_capital: f64,
        marks: &HashMap<String, f64>,
    ) -> Result<PortfolioSnapshot, ReconcileError> {
        let today = self.clock.now().date_naive();
        let mut trades = self.store.open_trades().await?;
        let open_positions = order_lifecycle::open_positions(&trades);
        trades.extend(self.store.trades_closed_on(today).await?);

        Ok(PortfolioSnapshot {
            open_positions,
            daily_pnl: order_lifecycle::daily_pnl(&trades, today, marks),
            available_capital,
        })
    }
}

#[async_trait]
impl OrderUpdateHandler for FillReconciler {
    /// Desync outcomes (unknown, stale, duplicate) are acknowledged. Store
    /// and transition errors are returned so the broker redelivers.
    async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), HandlerError> {
        self.handle_update(update).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::trade::PositionState;
    use crate::domain::services::circuit_breaker::CircuitBreakerConfig;
    use crate::domain::services::clock::ManualClock;
    use crate::persistence::InMemoryTradeStore;
    use chrono::{Duration, TimeZone, Utc};

    struct Harness {
        reconciler: Arc<FillReconciler>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<ManualClock>,
    }

    fn harness(max_consecutive: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 9, 11, 4, 0, 0).unwrap(),
        ));
        let breaker = Arc::new(CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                max_consecutive_failures: max_consecutive,
                max_failures_per_hour: 0,
                cooldown_minutes: 0,
            },
            clock.clone(),
        ));
        let reconciler = Arc::new(FillReconciler::with_clock(
            Arc::new(InMemoryTradeStore::new()),
            breaker.clone(),
            clock.clone(),
        ));
        Harness {
            reconciler,
            breaker,
            clock,
        }
    }

    fn new_trade(symbol: &str, order_id: &str) -> NewTrade {
        NewTrade {
            symbol: symbol.to_string(),
            quantity: 10,
            requested_entry_price: 100.0,
            stop_loss: 95.0,
            target: None,
            strategy_id: "orb".to_string(),
            entry_order_id: order_id.to_string(),
        }
    }

    fn update(h: &Harness, order_id: &str, status: OrderStatus) -> OrderUpdate {
        OrderUpdate::new(order_id, status, h.clock.now())
    }

    #[tokio::test]
    async fn test_fill_then_duplicate() {
        let h = harness(3);
        let trade = h.reconciler.record_entry_order(new_trade("INFY", "E1")).await.unwrap();

        let fill = update(&h, "E1", OrderStatus::Completed).with_fill(101.5, 10);
        let outcome = h.reconciler.handle_update(&fill).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                trade_id: trade.id,
                event: LifecycleEvent::EntryFilled { fill_price: 101.5 }
            }
        );
        let filled = h.reconciler.store().get(trade.id).await.unwrap().unwrap();

        h.clock.advance(Duration::seconds(10));
        let again = update(&h, "E1", OrderStatus::Completed).with_fill(101.5, 10);
        let outcome = h.reconciler.handle_update(&again).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Duplicate { trade_id: trade.id });

        let stored = h.reconciler.store().get(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.entry_fill_time, filled.entry_fill_time);
        assert_eq!(stored.updated_at, filled.updated_at);
    }

    #[tokio::test]
    async fn test_unknown_order_is_discarded() {
        let h = harness(3);
        let outcome = h
            .reconciler
            .handle_update(&update(&h, "GHOST", OrderStatus::Completed))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::UnknownOrder {
                order_id: "GHOST".to_string()
            }
        );
        assert_eq!(h.breaker.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn test_rejections_trip_breaker_and_fills_reset_it() {
        let h = harness(2);
        for id in ["R1", "R2", "OK"] {
            h.reconciler.record_entry_order(new_trade(id, id)).await.unwrap();
        }

        let mut rejected = update(&h, "R1", OrderStatus::Rejected);
        rejected.error_message = "margin shortfall".to_string();
        h.reconciler.handle_update(&rejected).await.unwrap();
        assert_eq!(h.breaker.consecutive_failures().await, 1);

        // duplicates never count twice
        h.reconciler.handle_update(&rejected).await.unwrap();
        assert_eq!(h.breaker.consecutive_failures().await, 1);

        h.reconciler
            .handle_update(&update(&h, "OK", OrderStatus::Completed).with_fill(100.0, 10))
            .await
            .unwrap();
        assert_eq!(h.breaker.consecutive_failures().await, 0);

        h.reconciler.handle_update(&rejected).await.unwrap();
        h.reconciler
            .handle_update(&update(&h, "R2", OrderStatus::Rejected))
            .await
            .unwrap();
        assert_eq!(h.breaker.consecutive_failures().await, 1);
        assert!(!h.breaker.is_tripped().await);

        let mut r3 = new_trade("R3", "R3");
        r3.symbol = "SBIN".to_string();
        h.reconciler.record_entry_order(r3).await.unwrap();
        h.reconciler
            .handle_update(&update(&h, "R3", OrderStatus::Rejected))
            .await
            .unwrap();
        assert!(h.breaker.is_tripped().await);
        assert!(h.breaker.trip_reason().await.contains("order rejected: R3 SBIN"));
    }

    #[tokio::test]
    async fn test_cancel_does_not_feed_breaker() {
        let h = harness(1);
        let trade = h.reconciler.record_entry_order(new_trade("TCS", "C1")).await.unwrap();
        let outcome = h
            .reconciler
            .handle_update(&update(&h, "C1", OrderStatus::Cancelled))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { .. }));
        assert!(!h.breaker.is_tripped().await);
        let stored = h.reconciler.store().get(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.position_state, PositionState::Cancelled);
    }

    #[tokio::test]
    async fn test_completed_without_price_is_an_error() {
        let h = harness(3);
        let trade = h.reconciler.record_entry_order(new_trade("TCS", "E1")).await.unwrap();
        let err = h
            .reconciler
            .handle_update(&update(&h, "E1", OrderStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Transition(TransitionError::MissingFillPrice { .. })
        ));
        let stored = h.reconciler.store().get(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.position_state, PositionState::EntryPending);
    }

    #[tokio::test]
    async fn test_exit_flow_and_second_exit_refused() {
        let h = harness(3);
        let trade = h.reconciler.record_entry_order(new_trade("INFY", "E1")).await.unwrap();
        h.reconciler
            .handle_update(&update(&h, "E1", OrderStatus::Completed).with_fill(100.0, 10))
            .await
            .unwrap();

        h.reconciler
            .record_exit_order(trade.id, "X1", Some("stop hit".to_string()))
            .await
            .unwrap();
        let err = h
            .reconciler
            .record_exit_order(trade.id, "X2", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Transition(TransitionError::ExitAlreadyPending { .. })
        ));

        h.reconciler
            .handle_update(&update(&h, "X1", OrderStatus::Rejected))
            .await
            .unwrap();
        let held = h.reconciler.store().get(trade.id).await.unwrap().unwrap();
        assert_eq!(held.position_state, PositionState::EntryFilled);

        h.reconciler.record_exit_order(trade.id, "X2", None).await.unwrap();
        let outcome = h
            .reconciler
            .handle_update(&update(&h, "X2", OrderStatus::Completed).with_fill(96.0, 10))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                trade_id: trade.id,
                event: LifecycleEvent::ExitFilled {
                    fill_price: 96.0,
                    realized_pnl: Some(-40.0)
                }
            }
        );

        // old exit order no longer belongs to the trade
        let outcome = h
            .reconciler
            .handle_update(&update(&h, "X1", OrderStatus::Rejected))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::UnknownOrder { .. }));

        let snapshot = h.reconciler.portfolio_snapshot(50_000.0, &HashMap::new()).await.unwrap();
        assert!(snapshot.open_positions.is_empty());
        assert_eq!(snapshot.daily_pnl.realized_pnl, -40.0);
    }

    #[tokio::test]
    async fn test_exit_order_id_in_use_is_refused() {
        let h = harness(3);
        let infy = h.reconciler.record_entry_order(new_trade("INFY", "E1")).await.unwrap();
        let tcs = h.reconciler.record_entry_order(new_trade("TCS", "E2")).await.unwrap();
        for id in ["E1", "E2"] {
            h.reconciler
                .handle_update(&update(&h, id, OrderStatus::Completed).with_fill(100.0, 10))
                .await
                .unwrap();
        }
        h.reconciler.record_exit_order(infy.id, "X1", None).await.unwrap();

        for taken in ["X1", "E1", "E2"] {
            let err = h.reconciler.record_exit_order(tcs.id, taken, None).await.unwrap_err();
            assert!(matches!(
                err,
                ReconcileError::Store(StoreError::DuplicateOrderId(ref id)) if id == taken
            ));
        }
        let err = h.reconciler.record_entry_order(new_trade("SBIN", "X1")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(StoreError::DuplicateOrderId(_))));

        let held = h.reconciler.store().get(tcs.id).await.unwrap().unwrap();
        assert_eq!(held.position_state, PositionState::EntryFilled);
        assert_eq!(held.exit_order_id, None);

        let outcome = h
            .reconciler
            .handle_update(&update(&h, "X1", OrderStatus::Completed).with_fill(104.0, 10))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { trade_id, .. } if trade_id == infy.id));
        let tcs_after = h.reconciler.store().get(tcs.id).await.unwrap().unwrap();
        assert_eq!(tcs_after.position_state, PositionState::EntryFilled);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_fills_apply_once() {
        let h = harness(3);
        let trade = h.reconciler.record_entry_order(new_trade("INFY", "E1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let reconciler = h.reconciler.clone();
            let mut fill = OrderUpdate::new("E1", OrderStatus::Completed, h.clock.now())
                .with_fill(101.5, 10);
            fill.exchange_time = Some(h.clock.now() + Duration::milliseconds(i));
            handles.push(tokio::spawn(async move {
                reconciler.handle_update(&fill).await.unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReconcileOutcome::Applied { .. }) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let stored = h.reconciler.store().get(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.position_state, PositionState::EntryFilled);
        assert!(stored.is_consistent());
    }
}
