//! Single decision point in front of order placement
//!
//! Owns the risk validator and shares the circuit breaker with the fill
//! reconciler. Entries go through the breaker first, then the risk rules.
//! Exits, holds and skips are never halted.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::domain::entities::trade_intent::{PositionInfo, TradeIntent};
use crate::domain::services::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::domain::services::risk_validator::{RiskConfig, RiskValidator, SectorMap, ValidationResult};
use crate::domain::value_objects::pnl::DailyPnl;

/// Portfolio state supplied per evaluation
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub open_positions: Vec<PositionInfo>,
    pub daily_pnl: DailyPnl,
    pub available_capital: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Approved(ValidationResult),
    Rejected(ValidationResult),
    /// Breaker is tripped; risk rules were not consulted
    Halted { reason: String },
}

impl GateDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateDecision::Approved(_))
    }

    pub fn validation(&self) -> Option<&ValidationResult> {
        match self {
            GateDecision::Approved(result) | GateDecision::Rejected(result) => Some(result),
            GateDecision::Halted { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct Gatekeeper {
    validator: RiskValidator,
    breaker: Arc<CircuitBreaker>,
    sector_map: RwLock<Option<Arc<SectorMap>>>,
}

impl Gatekeeper {
    pub fn new(risk: RiskConfig, total_capital: f64, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            validator: RiskValidator::new(risk, total_capital),
            breaker,
            sector_map: RwLock::new(None),
        }
    }

    pub fn with_sector_map(self, sector_map: SectorMap) -> Self {
        self.set_sector_map(Some(sector_map));
        self
    }

    pub fn validator(&self) -> &RiskValidator {
        &self.validator
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// `None` disables the sector concentration rule.
    pub fn set_sector_map(&self, sector_map: Option<SectorMap>) {
        let mut guard = self
            .sector_map
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = sector_map.map(Arc::new);
    }

    fn sector_map(&self) -> Option<Arc<SectorMap>> {
        self.sector_map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decide whether `intent` may be sent to the broker.
    pub async fn evaluate(&self, intent: &TradeIntent, snapshot: &PortfolioSnapshot) -> GateDecision {
        if intent.action.is_entry() {
            if let Some(reason) = self.breaker.halt_reason().await {
                warn!(symbol = %intent.symbol, %reason, "entry halted by circuit breaker");
                return GateDecision::Halted { reason };
            }
        }

        let sector_map = self.sector_map();
        let result = self.validator.validate(
            intent,
            &snapshot.open_positions,
            &snapshot.daily_pnl,
            snapshot.available_capital,
            sector_map.as_deref(),
        );

        if result.approved() {
            GateDecision::Approved(result)
        } else {
            GateDecision::Rejected(result)
        }
    }

    /// Swap every limit from a reloaded configuration.
    ///
    /// The breaker keeps its counters and tripped flag.
    pub async fn apply_config(&self, risk: RiskConfig, breaker: CircuitBreakerConfig, total_capital: f64) {
        self.validator.update(risk, total_capital);
        self.breaker.update_config(breaker).await;
        info!(
            capital = self.validator.total_capital(),
            "gatekeeper limits updated"
        );
    }
}
