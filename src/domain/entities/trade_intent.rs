use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action proposed by the strategy layer for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Exit,
    Hold,
    Skip,
}

impl TradeAction {
    /// Only BUY opens new risk; everything else passes the gate untouched.
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::Buy)
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Exit => write!(f, "EXIT"),
            TradeAction::Hold => write!(f, "HOLD"),
            TradeAction::Skip => write!(f, "SKIP"),
        }
    }
}

/// A proposed trade, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub action: TradeAction,
    pub symbol: String,
    pub price: f64,
    pub stop_loss: f64,
    pub quantity: u32,
    pub target: Option<f64>,
}

impl TradeIntent {
    pub fn new(action: TradeAction, symbol: impl Into<String>, price: f64, stop_loss: f64, quantity: u32) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            price,
            stop_loss,
            quantity,
            target: None,
        }
    }

    pub fn buy(symbol: impl Into<String>, price: f64, stop_loss: f64, quantity: u32) -> Self {
        Self::new(TradeAction::Buy, symbol, price, stop_loss, quantity)
    }

    pub fn exit(symbol: impl Into<String>, price: f64, quantity: u32) -> Self {
        Self::new(TradeAction::Exit, symbol, price, 0.0, quantity)
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target = Some(target);
        self
    }

    /// Price × quantity
    pub fn notional(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }

    /// Amount lost if the stop-loss is hit
    pub fn risk_amount(&self) -> f64 {
        (self.price - self.stop_loss) * f64::from(self.quantity)
    }
}

/// Read-only snapshot of a currently open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: u32,
    pub stop_loss: Option<f64>,
    pub entry_time: Option<DateTime<Utc>>,
}

impl PositionInfo {
    pub fn new(symbol: impl Into<String>, entry_price: f64, quantity: u32) -> Self {
        Self {
            symbol: symbol.into(),
            entry_price,
            quantity,
            stop_loss: None,
            entry_time: None,
        }
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * f64::from(self.quantity)
    }
}
