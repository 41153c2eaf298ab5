use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The day's cumulative trading result
///
/// Realized P&L only includes trades whose exit has been confirmed by the
/// broker; unrealized P&L marks still-held positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyPnl {
    pub date: NaiveDate,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl DailyPnl {
    pub fn new(date: NaiveDate, realized_pnl: f64, unrealized_pnl: f64) -> Self {
        Self {
            date,
            realized_pnl,
            unrealized_pnl,
        }
    }

    /// Breakeven day
    pub fn flat(date: NaiveDate) -> Self {
        Self::new(date, 0.0, 0.0)
    }

    pub fn total(&self) -> f64 {
        self.realized_pnl + self.unrealized_pnl
    }

    /// Magnitude of the combined loss, zero when the day is flat or positive
    pub fn loss(&self) -> f64 {
        let total = self.total();
        if total < 0.0 {
            -total
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for DailyPnl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.total();
        if total >= 0.0 {
            write!(f, "{} +{:.2}", self.date, total)
        } else {
            write!(f, "{} -{:.2}", self.date, total.abs())
        }
    }
}
