use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Broker-agnostic order status
///
/// `Open` covers partially filled or triggered orders; it is reported by the
/// broker but never stored on a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Completed,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    /// A terminal status ends the leg; later postbacks for it are redeliveries.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "OPEN" => Ok(OrderStatus::Open),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Lifecycle stage of a trade's holding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    EntryPending,
    EntryFilled,
    ExitPending,
    ExitFilled,
    Cancelled,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::EntryPending => "ENTRY_PENDING",
            PositionState::EntryFilled => "ENTRY_FILLED",
            PositionState::ExitPending => "EXIT_PENDING",
            PositionState::ExitFilled => "EXIT_FILLED",
            PositionState::Cancelled => "CANCELLED",
        }
    }

    /// Closed set of legal edges. Everything else, including any edge out of
    /// `ExitFilled` or `Cancelled`, is refused.
    pub fn can_transition_to(&self, next: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, next),
            (EntryPending, EntryFilled)
                | (EntryPending, Cancelled)
                | (EntryFilled, ExitPending)
                | (ExitPending, ExitFilled)
                | (ExitPending, EntryFilled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::ExitFilled | PositionState::Cancelled)
    }

    /// Money is (or may be) at risk in these states.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            PositionState::EntryPending | PositionState::EntryFilled | PositionState::ExitPending
        )
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY_PENDING" => Ok(PositionState::EntryPending),
            "ENTRY_FILLED" => Ok(PositionState::EntryFilled),
            "EXIT_PENDING" => Ok(PositionState::ExitPending),
            "EXIT_FILLED" => Ok(PositionState::ExitFilled),
            "CANCELLED" => Ok(PositionState::Cancelled),
            other => Err(format!("unknown position state: {}", other)),
        }
    }
}

/// Which side of a trade an order belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLeg {
    Entry,
    Exit,
}

impl std::fmt::Display for OrderLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderLeg::Entry => write!(f, "entry"),
            OrderLeg::Exit => write!(f, "exit"),
        }
    }
}

/// Input for creating a trade once its entry order has been placed
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub symbol: String,
    pub quantity: u32,
    pub requested_entry_price: f64,
    pub stop_loss: f64,
    pub target: Option<f64>,
    pub strategy_id: String,
    pub entry_order_id: String,
}

/// Persistent per-trade record tracking both order legs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub symbol: String,
    pub quantity: u32,
    pub requested_entry_price: f64,
    pub stop_loss: f64,
    pub target: Option<f64>,
    pub strategy_id: String,

    pub entry_order_id: String,
    pub entry_order_status: OrderStatus,
    pub entry_fill_price: Option<f64>,
    pub entry_fill_time: Option<DateTime<Utc>>,

    pub exit_order_id: Option<String>,
    pub exit_order_status: Option<OrderStatus>,
    pub exit_fill_price: Option<f64>,
    pub exit_fill_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,

    pub position_state: PositionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Fresh record at `ENTRY_PENDING`
    pub fn pending(id: i64, trade: NewTrade, now: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: trade.symbol,
            quantity: trade.quantity,
            requested_entry_price: trade.requested_entry_price,
            stop_loss: trade.stop_loss,
            target: trade.target,
            strategy_id: trade.strategy_id,
            entry_order_id: trade.entry_order_id,
            entry_order_status: OrderStatus::Pending,
            entry_fill_price: None,
            entry_fill_time: None,
            exit_order_id: None,
            exit_order_status: None,
            exit_fill_price: None,
            exit_fill_time: None,
            exit_reason: None,
            position_state: PositionState::EntryPending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Which leg a broker order ID belongs to, if any
    pub fn leg_for(&self, order_id: &str) -> Option<OrderLeg> {
        if self.entry_order_id == order_id {
            Some(OrderLeg::Entry)
        } else if self.exit_order_id.as_deref() == Some(order_id) {
            Some(OrderLeg::Exit)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        self.position_state.is_open()
    }

    /// Realized P&L from broker fill prices; `None` until `EXIT_FILLED`.
    pub fn realized_pnl(&self) -> Option<f64> {
        if self.position_state != PositionState::ExitFilled {
            return None;
        }
        let entry = self.entry_fill_price?;
        let exit = self.exit_fill_price?;
        Some((exit - entry) * f64::from(self.quantity))
    }

    /// Mark-to-market P&L while the position is held
    pub fn unrealized_pnl(&self, mark_price: f64) -> Option<f64> {
        match self.position_state {
            PositionState::EntryFilled | PositionState::ExitPending => {
                let entry = self.entry_fill_price?;
                Some((mark_price - entry) * f64::from(self.quantity))
            }
            _ => None,
        }
    }

    /// Checks the cross-field invariants that tie leg statuses to the state.
    pub fn is_consistent(&self) -> bool {
        let entry_filled =
            self.entry_order_status == OrderStatus::Completed && self.entry_fill_price.is_some();
        let exit_filled = self.exit_order_status == Some(OrderStatus::Completed)
            && self.exit_fill_price.is_some();

        match self.position_state {
            PositionState::EntryPending => self.entry_order_status == OrderStatus::Pending,
            PositionState::EntryFilled => {
                entry_filled && self.exit_order_status != Some(OrderStatus::Pending)
            }
            PositionState::ExitPending => {
                entry_filled && self.exit_order_status == Some(OrderStatus::Pending)
            }
            PositionState::ExitFilled => entry_filled && exit_filled,
            PositionState::Cancelled => matches!(
                self.entry_order_status,
                OrderStatus::Rejected | OrderStatus::Cancelled
            ),
        }
    }
}
