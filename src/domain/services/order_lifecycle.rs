//! Order lifecycle state machine
//!
//! Trades advance only on broker-confirmed postbacks:
//!
//! ```text
//! ENTRY_PENDING --entry COMPLETED--> ENTRY_FILLED --exit placed--> EXIT_PENDING --exit COMPLETED--> EXIT_FILLED
//!       |                                 ^                              |
//!       +--entry REJECTED/CANCELLED--> CANCELLED                         |
//!                                         +----exit REJECTED/CANCELLED---+
//! ```
//!
//! Every update is keyed by (trade, leg, reported status). Replaying an update
//! whose leg already reached that terminal status is a no-op, so redelivered
//! postbacks never move timestamps or prices.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::entities::order_update::OrderUpdate;
use crate::domain::entities::trade::{OrderLeg, OrderStatus, PositionState, TradeRecord};
use crate::domain::entities::trade_intent::PositionInfo;
use crate::domain::errors::TransitionError;
use crate::domain::value_objects::pnl::DailyPnl;

/// What applying a postback did to a trade
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    EntryFilled {
        fill_price: f64,
    },
    /// Entry rejected or cancelled; no position was taken
    EntryCancelled {
        status: OrderStatus,
    },
    ExitFilled {
        fill_price: f64,
        realized_pnl: Option<f64>,
    },
    /// Exit rejected or cancelled; position is held again
    ExitFailed {
        status: OrderStatus,
    },
    /// Leg already carries this terminal status
    Duplicate {
        leg: OrderLeg,
        status: OrderStatus,
    },
    /// Leg is terminal with a different status; late or out-of-order delivery
    Stale {
        leg: OrderLeg,
        current: OrderStatus,
        reported: OrderStatus,
    },
    /// Non-terminal report (pending, open, partial fill)
    Unchanged {
        leg: OrderLeg,
        status: OrderStatus,
    },
}

impl LifecycleEvent {
    /// True when the record was modified and must be persisted.
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::EntryFilled { .. }
                | LifecycleEvent::EntryCancelled { .. }
                | LifecycleEvent::ExitFilled { .. }
                | LifecycleEvent::ExitFailed { .. }
        )
    }

    /// Status reported as a broker rejection that ended a pending leg
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::EntryCancelled {
                status: OrderStatus::Rejected
            } | LifecycleEvent::ExitFailed {
                status: OrderStatus::Rejected
            }
        )
    }

    pub fn is_fill(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::EntryFilled { .. } | LifecycleEvent::ExitFilled { .. }
        )
    }
}

fn ensure_transition(trade: &TradeRecord, to: PositionState) -> Result<(), TransitionError> {
    if trade.position_state.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition {
            trade_id: trade.id,
            from: trade.position_state,
            to,
        })
    }
}

/// Apply a broker postback to the trade it belongs to.
///
/// On `Err` the record is left exactly as it was.
pub fn apply_order_update(
    trade: &mut TradeRecord,
    update: &OrderUpdate,
    now: DateTime<Utc>,
) -> Result<LifecycleEvent, TransitionError> {
    let leg = trade
        .leg_for(&update.order_id)
        .ok_or_else(|| TransitionError::OrderNotOnTrade {
            trade_id: trade.id,
            order_id: update.order_id.clone(),
        })?;

    match leg {
        OrderLeg::Entry => apply_entry_update(trade, update, now),
        OrderLeg::Exit => apply_exit_update(trade, update, now),
    }
}

fn settled(leg: OrderLeg, current: OrderStatus, reported: OrderStatus) -> LifecycleEvent {
    if current == reported {
        LifecycleEvent::Duplicate {
            leg,
            status: current,
        }
    } else {
        LifecycleEvent::Stale {
            leg,
            current,
            reported,
        }
    }
}

fn apply_entry_update(
    trade: &mut TradeRecord,
    update: &OrderUpdate,
    now: DateTime<Utc>,
) -> Result<LifecycleEvent, TransitionError> {
    let current = trade.entry_order_status;
    if current.is_terminal() {
        return Ok(settled(OrderLeg::Entry, current, update.status));
    }

    match update.status {
        OrderStatus::Pending | OrderStatus::Open => Ok(LifecycleEvent::Unchanged {
            leg: OrderLeg::Entry,
            status: update.status,
        }),
        OrderStatus::Completed => {
            let fill_price = update
                .fill_price()
                .ok_or_else(|| TransitionError::MissingFillPrice {
                    order_id: update.order_id.clone(),
                    status: update.status,
                })?;
            ensure_transition(trade, PositionState::EntryFilled)?;

            trade.entry_order_status = OrderStatus::Completed;
            trade.entry_fill_price = Some(fill_price);
            trade.entry_fill_time = Some(update.fill_time());
            trade.position_state = PositionState::EntryFilled;
            trade.updated_at = now;
            Ok(LifecycleEvent::EntryFilled { fill_price })
        }
        status @ (OrderStatus::Rejected | OrderStatus::Cancelled) => {
            ensure_transition(trade, PositionState::Cancelled)?;

            trade.entry_order_status = status;
            trade.position_state = PositionState::Cancelled;
            trade.updated_at = now;
            Ok(LifecycleEvent::EntryCancelled { status })
        }
    }
}

fn apply_exit_update(
    trade: &mut TradeRecord,
    update: &OrderUpdate,
    now: DateTime<Utc>,
) -> Result<LifecycleEvent, TransitionError> {
    let current = trade.exit_order_status.unwrap_or(OrderStatus::Pending);
    if current.is_terminal() {
        return Ok(settled(OrderLeg::Exit, current, update.status));
    }

    match update.status {
        OrderStatus::Pending | OrderStatus::Open => Ok(LifecycleEvent::Unchanged {
            leg: OrderLeg::Exit,
            status: update.status,
        }),
        OrderStatus::Completed => {
            let fill_price = update
                .fill_price()
                .ok_or_else(|| TransitionError::MissingFillPrice {
                    order_id: update.order_id.clone(),
                    status: update.status,
                })?;
            ensure_transition(trade, PositionState::ExitFilled)?;

            trade.exit_order_status = Some(OrderStatus::Completed);
            trade.exit_fill_price = Some(fill_price);
            trade.exit_fill_time = Some(update.fill_time());
            trade.position_state = PositionState::ExitFilled;
            trade.updated_at = now;
            Ok(LifecycleEvent::ExitFilled {
                fill_price,
                realized_pnl: trade.realized_pnl(),
            })
        }
        status @ (OrderStatus::Rejected | OrderStatus::Cancelled) => {
            ensure_transition(trade, PositionState::EntryFilled)?;

            trade.exit_order_status = Some(status);
            trade.position_state = PositionState::EntryFilled;
            trade.updated_at = now;
            Ok(LifecycleEvent::ExitFailed { status })
        }
    }
}

/// Record that an exit order was placed for a held position.
///
/// Only one exit order may be in flight per trade; a new one is refused
/// until the pending exit is confirmed, rejected or cancelled.
pub fn begin_exit(
    trade: &mut TradeRecord,
    exit_order_id: impl Into<String>,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    if trade.position_state == PositionState::ExitPending {
        return Err(TransitionError::ExitAlreadyPending {
            trade_id: trade.id,
            order_id: trade.exit_order_id.clone().unwrap_or_default(),
        });
    }
    if trade.position_state != PositionState::EntryFilled {
        return Err(TransitionError::NotHolding {
            trade_id: trade.id,
            state: trade.position_state,
        });
    }
    ensure_transition(trade, PositionState::ExitPending)?;

    trade.exit_order_id = Some(exit_order_id.into());
    trade.exit_order_status = Some(OrderStatus::Pending);
    trade.exit_fill_price = None;
    trade.exit_fill_time = None;
    trade.exit_reason = reason;
    trade.position_state = PositionState::ExitPending;
    trade.updated_at = now;
    Ok(())
}

/// Positions the risk engine must count
///
/// Filled positions use the broker fill price. Unconfirmed entries use the
/// requested price so they still count against duplicates and deployment.
pub fn open_positions(trades: &[TradeRecord]) -> Vec<PositionInfo> {
    trades
        .iter()
        .filter_map(|t| {
            let entry_price = match t.position_state {
                PositionState::EntryFilled | PositionState::ExitPending => {
                    t.entry_fill_price.unwrap_or(t.requested_entry_price)
                }
                PositionState::EntryPending => t.requested_entry_price,
                PositionState::ExitFilled | PositionState::Cancelled => return None,
            };
            Some(PositionInfo {
                symbol: t.symbol.clone(),
                entry_price,
                quantity: t.quantity,
                stop_loss: Some(t.stop_loss),
                entry_time: t.entry_fill_time,
            })
        })
        .collect()
}

/// Day's P&L from broker-confirmed fills
///
/// Realized: trades whose exit filled on `date`. Unrealized: held positions
/// that have a mark price in `marks`.
pub fn daily_pnl(trades: &[TradeRecord], date: NaiveDate, marks: &HashMap<String, f64>) -> DailyPnl {
    let realized = trades
        .iter()
        .filter(|t| t.exit_fill_time.map(|ts| ts.date_naive()) == Some(date))
        .filter_map(TradeRecord::realized_pnl)
        .sum();

    let unrealized = trades
        .iter()
        .filter_map(|t| {
            let mark = marks.get(&t.symbol)?;
            t.unrealized_pnl(*mark)
        })
        .sum();

    DailyPnl::new(date, realized, unrealized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::trade::NewTrade;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 11, 9, 20, 0).unwrap()
    }

    fn trade() -> TradeRecord {
        TradeRecord::pending(
            1,
            NewTrade {
                symbol: "RELIANCE".to_string(),
                quantity: 10,
                requested_entry_price: 100.0,
                stop_loss: 95.0,
                target: Some(110.0),
                strategy_id: "breakout".to_string(),
                entry_order_id: "ENT-1".to_string(),
            },
            t0(),
        )
    }

    fn filled(order_id: &str, price: f64, at: DateTime<Utc>) -> OrderUpdate {
        let mut update = OrderUpdate::new(order_id, OrderStatus::Completed, at).with_fill(price, 10);
        update.exchange_time = Some(at);
        update
    }

    fn held() -> TradeRecord {
        let mut t = trade();
        apply_order_update(&mut t, &filled("ENT-1", 101.5, t0()), t0()).unwrap();
        t
    }

    #[test]
    fn test_entry_fill_then_duplicate_is_noop() {
        let mut t = trade();
        let first = filled("ENT-1", 101.5, t0());

        let event = apply_order_update(&mut t, &first, t0()).unwrap();
        assert_eq!(event, LifecycleEvent::EntryFilled { fill_price: 101.5 });
        assert_eq!(t.position_state, PositionState::EntryFilled);
        assert_eq!(t.entry_fill_price, Some(101.5));
        assert_eq!(t.entry_fill_time, Some(t0()));
        assert!(t.is_consistent());

        let later = t0() + Duration::seconds(30);
        let redelivered = filled("ENT-1", 101.5, later);
        let snapshot = t.clone();
        let event = apply_order_update(&mut t, &redelivered, later).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::Duplicate {
                leg: OrderLeg::Entry,
                status: OrderStatus::Completed
            }
        );
        assert!(!event.changed_state());
        assert_eq!(t, snapshot);
    }

    #[test]
    fn test_entry_completed_without_price_is_refused() {
        let mut t = trade();
        let snapshot = t.clone();
        let update = OrderUpdate::new("ENT-1", OrderStatus::Completed, t0());
        let err = apply_order_update(&mut t, &update, t0()).unwrap_err();
        assert!(matches!(err, TransitionError::MissingFillPrice { .. }));
        assert_eq!(t, snapshot);
    }

    #[test]
    fn test_entry_rejection_cancels_trade() {
        for status in [OrderStatus::Rejected, OrderStatus::Cancelled] {
            let mut t = trade();
            let event = apply_order_update(&mut t, &OrderUpdate::new("ENT-1", status, t0()), t0()).unwrap();
            assert_eq!(event, LifecycleEvent::EntryCancelled { status });
            assert_eq!(event.is_rejection(), status == OrderStatus::Rejected);
            assert_eq!(t.position_state, PositionState::Cancelled);
            assert!(t.entry_fill_price.is_none());
            assert!(t.is_consistent());
            assert!(open_positions(&[t]).is_empty());
        }
    }

    #[test]
    fn test_non_terminal_updates_leave_trade_alone() {
        let mut t = trade();
        let snapshot = t.clone();
        for status in [OrderStatus::Pending, OrderStatus::Open] {
            let event = apply_order_update(&mut t, &OrderUpdate::new("ENT-1", status, t0()), t0()).unwrap();
            assert!(matches!(event, LifecycleEvent::Unchanged { .. }));
        }
        assert_eq!(t, snapshot);
    }

    #[test]
    fn test_late_cancel_after_fill_is_stale() {
        let mut t = held();
        let snapshot = t.clone();
        let event =
            apply_order_update(&mut t, &OrderUpdate::new("ENT-1", OrderStatus::Cancelled, t0()), t0()).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::Stale {
                leg: OrderLeg::Entry,
                current: OrderStatus::Completed,
                reported: OrderStatus::Cancelled
            }
        );
        assert_eq!(t, snapshot);
    }

    #[test]
    fn test_full_round_trip_uses_fill_prices() {
        let mut t = held();
        begin_exit(&mut t, "EXT-1", Some("target".to_string()), t0()).unwrap();
        assert_eq!(t.position_state, PositionState::ExitPending);
        assert!(t.is_consistent());

        let exit_at = t0() + Duration::hours(2);
        let event = apply_order_update(&mut t, &filled("EXT-1", 108.0, exit_at), exit_at).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::ExitFilled {
                fill_price: 108.0,
                realized_pnl: Some(65.0)
            }
        );
        assert_eq!(t.position_state, PositionState::ExitFilled);
        assert!(t.is_consistent());
        assert_eq!(t.realized_pnl(), Some(65.0));
    }

    #[test]
    fn test_exit_rejection_returns_to_held() {
        let mut t = held();
        begin_exit(&mut t, "EXT-1", None, t0()).unwrap();

        let event =
            apply_order_update(&mut t, &OrderUpdate::new("EXT-1", OrderStatus::Rejected, t0()), t0()).unwrap();
        assert_eq!(
            event,
            LifecycleEvent::ExitFailed {
                status: OrderStatus::Rejected
            }
        );
        assert!(event.is_rejection());
        assert_eq!(t.position_state, PositionState::EntryFilled);
        assert!(t.is_consistent());

        begin_exit(&mut t, "EXT-2", None, t0()).unwrap();
        assert_eq!(t.exit_order_id.as_deref(), Some("EXT-2"));
        assert_eq!(t.exit_order_status, Some(OrderStatus::Pending));
    }

    #[test]
    fn test_second_exit_refused_while_pending() {
        let mut t = held();
        begin_exit(&mut t, "EXT-1", None, t0()).unwrap();
        let err = begin_exit(&mut t, "EXT-2", None, t0()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::ExitAlreadyPending {
                trade_id: 1,
                order_id: "EXT-1".to_string()
            }
        );
        assert_eq!(t.exit_order_id.as_deref(), Some("EXT-1"));
    }

    #[test]
    fn test_exit_requires_filled_entry() {
        let mut t = trade();
        let err = begin_exit(&mut t, "EXT-1", None, t0()).unwrap_err();
        assert!(matches!(err, TransitionError::NotHolding { .. }));
        assert!(t.exit_order_id.is_none());
    }

    #[test]
    fn test_unknown_order_on_trade() {
        let mut t = trade();
        let err =
            apply_order_update(&mut t, &OrderUpdate::new("OTHER", OrderStatus::Completed, t0()), t0()).unwrap_err();
        assert!(matches!(err, TransitionError::OrderNotOnTrade { .. }));
    }

    #[test]
    fn test_closed_trade_cannot_reopen() {
        let mut t = held();
        begin_exit(&mut t, "EXT-1", None, t0()).unwrap();
        apply_order_update(&mut t, &filled("EXT-1", 99.0, t0()), t0()).unwrap();
        assert!(ensure_transition(&t, PositionState::EntryPending).is_err());
        assert!(begin_exit(&mut t, "EXT-2", None, t0()).is_err());
    }

    #[test]
    fn test_open_positions_prices() {
        let pending = trade();
        let holding = held();
        let mut closed = held();
        begin_exit(&mut closed, "EXT-1", None, t0()).unwrap();
        apply_order_update(&mut closed, &filled("EXT-1", 99.0, t0()), t0()).unwrap();

        let positions = open_positions(&[pending, holding, closed]);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].entry_price, 100.0);
        assert_eq!(positions[1].entry_price, 101.5);
        assert_eq!(positions[1].stop_loss, Some(95.0));
    }

    #[test]
    fn test_daily_pnl_counts_only_confirmed_exits() {
        let day = t0().date_naive();

        let mut closed = held();
        closed.id = 2;
        begin_exit(&mut closed, "EXT-1", None, t0()).unwrap();
        apply_order_update(&mut closed, &filled("EXT-1", 99.5, t0()), t0()).unwrap();

        let mut yesterday = held();
        yesterday.id = 3;
        begin_exit(&mut yesterday, "EXT-9", None, t0()).unwrap();
        let prior = t0() - Duration::days(1);
        apply_order_update(&mut yesterday, &filled("EXT-9", 50.0, prior), prior).unwrap();

        let mut exiting = held();
        exiting.symbol = "TCS".to_string();
        begin_exit(&mut exiting, "EXT-5", None, t0()).unwrap();

        let never_filled = trade();

        let marks: HashMap<String, f64> = [("TCS".to_string(), 103.0), ("RELIANCE".to_string(), 1.0)]
            .into_iter()
            .collect();

        let pnl = daily_pnl(&[closed, yesterday, exiting, never_filled], day, &marks);
        assert_eq!(pnl.realized_pnl, -20.0);
        assert_eq!(pnl.unrealized_pnl, 15.0);
        assert_eq!(pnl.total(), -5.0);
    }
}
