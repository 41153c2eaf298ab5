//! Hard risk guardrails
//!
//! The validator is the final gate before an entry order reaches the broker.
//! Strategies cannot override it. Every BUY must carry a stop loss, and all
//! rules run independently so a rejection lists every violated rule.

use crate::domain::entities::trade_intent::{PositionInfo, TradeIntent};
use crate::domain::value_objects::pnl::DailyPnl;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Symbol to sector name
pub type SectorMap = HashMap<String, String>;

/// Risk thresholds, percentages of total capital
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_risk_per_trade_pct: f64,
    pub max_open_positions: u32,
    pub max_daily_loss_pct: f64,
    pub max_capital_deployment_pct: f64,
    /// Positions allowed per sector; 0 disables the check
    #[serde(default)]
    pub max_per_sector: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade_pct: 1.0,
            max_open_positions: 5,
            max_daily_loss_pct: 3.0,
            max_capital_deployment_pct: 80.0,
            max_per_sector: 0,
        }
    }
}

/// Rule that rejected an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionRule {
    MandatoryStopLoss,
    InvalidStopLoss,
    MaxRiskPerTrade,
    DuplicatePosition,
    MaxOpenPositions,
    MaxDailyLoss,
    MaxCapitalDeployment,
    InsufficientCapital,
    MaxSectorConcentration,
}

impl RejectionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionRule::MandatoryStopLoss => "MANDATORY_STOP_LOSS",
            RejectionRule::InvalidStopLoss => "INVALID_STOP_LOSS",
            RejectionRule::MaxRiskPerTrade => "MAX_RISK_PER_TRADE",
            RejectionRule::DuplicatePosition => "DUPLICATE_POSITION",
            RejectionRule::MaxOpenPositions => "MAX_OPEN_POSITIONS",
            RejectionRule::MaxDailyLoss => "MAX_DAILY_LOSS",
            RejectionRule::MaxCapitalDeployment => "MAX_CAPITAL_DEPLOYMENT",
            RejectionRule::InsufficientCapital => "INSUFFICIENT_CAPITAL",
            RejectionRule::MaxSectorConcentration => "MAX_SECTOR_CONCENTRATION",
        }
    }
}

impl std::fmt::Display for RejectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an intent was rejected
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("risk rejected [{rule}]: {message}")]
pub struct RejectionReason {
    pub rule: RejectionRule,
    pub message: String,
}

/// Outcome of validating one intent
///
/// `approved()` is true exactly when no rule rejected the intent.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    intent: TradeIntent,
    rejections: Vec<RejectionReason>,
}

impl ValidationResult {
    fn new(intent: TradeIntent) -> Self {
        Self {
            intent,
            rejections: Vec::new(),
        }
    }

    fn reject(&mut self, rule: RejectionRule, message: String) {
        debug!(symbol = %self.intent.symbol, rule = %rule, "{}", message);
        self.rejections.push(RejectionReason { rule, message });
    }

    pub fn approved(&self) -> bool {
        self.rejections.is_empty()
    }

    pub fn intent(&self) -> &TradeIntent {
        &self.intent
    }

    /// Rejections in rule evaluation order
    pub fn rejections(&self) -> &[RejectionReason] {
        &self.rejections
    }

    pub fn has_rejection(&self, rule: RejectionRule) -> bool {
        self.rejections.iter().any(|r| r.rule == rule)
    }

    pub fn rules(&self) -> Vec<RejectionRule> {
        self.rejections.iter().map(|r| r.rule).collect()
    }
}

#[derive(Debug, Clone)]
struct RiskState {
    config: RiskConfig,
    total_capital: f64,
}

/// Stateless-per-call rule evaluator over hot-swappable limits
///
/// The capital base and risk config sit behind one lock; `validate` copies
/// them out once so a concurrent reload is never observed half-applied.
#[derive(Debug)]
pub struct RiskValidator {
    state: RwLock<RiskState>,
}

impl RiskValidator {
    pub fn new(config: RiskConfig, total_capital: f64) -> Self {
        Self {
            state: RwLock::new(RiskState {
                config,
                total_capital,
            }),
        }
    }

    /// Replace the capital base. Non-positive values are ignored.
    pub fn update_capital(&self, total_capital: f64) {
        if !(total_capital.is_finite() && total_capital > 0.0) {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.total_capital = total_capital;
    }

    pub fn update_risk_config(&self, config: RiskConfig) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.config = config;
    }

    /// Swap config and capital together under one write.
    pub fn update(&self, config: RiskConfig, total_capital: f64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.config = config;
        if total_capital.is_finite() && total_capital > 0.0 {
            state.total_capital = total_capital;
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        self.snapshot().config
    }

    pub fn total_capital(&self) -> f64 {
        self.snapshot().total_capital
    }

    fn snapshot(&self) -> RiskState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check an intent against every rule.
    ///
    /// EXIT, HOLD and SKIP are always approved; only BUY is evaluated.
    /// `sector_map` of `None` disables the sector concentration rule.
    pub fn validate(
        &self,
        intent: &TradeIntent,
        open_positions: &[PositionInfo],
        daily_pnl: &DailyPnl,
        available_capital: f64,
        sector_map: Option<&SectorMap>,
    ) -> ValidationResult {
        let mut result = ValidationResult::new(intent.clone());
        if !intent.action.is_entry() {
            return result;
        }

        let state = self.snapshot();
        let rules = RuleSet {
            config: &state.config,
            total_capital: state.total_capital,
        };

        rules.check_stop_loss(&mut result, intent);
        rules.check_max_risk_per_trade(&mut result, intent);
        rules.check_max_open_positions(&mut result, intent, open_positions);
        rules.check_max_daily_loss(&mut result, daily_pnl);
        rules.check_max_capital_deployment(&mut result, intent, open_positions);
        rules.check_affordability(&mut result, intent, available_capital);
        rules.check_sector_concentration(&mut result, intent, open_positions, sector_map);

        if result.approved() {
            info!(symbol = %intent.symbol, qty = intent.quantity, price = intent.price, "risk approved");
        } else {
            info!(
                symbol = %intent.symbol,
                rejections = result.rejections.len(),
                "risk rejected: {:?}",
                result.rules()
            );
        }

        result
    }
}

/// Finite and at most `limit`. NaN or infinite amounts never pass a limit.
fn within(amount: f64, limit: f64) -> bool {
    amount.is_finite() && amount <= limit
}

/// One evaluation's frozen view of the limits
struct RuleSet<'a> {
    config: &'a RiskConfig,
    total_capital: f64,
}

impl RuleSet<'_> {
    fn pct_of_capital(&self, pct: f64) -> f64 {
        self.total_capital * (pct / 100.0)
    }

    fn check_stop_loss(&self, result: &mut ValidationResult, intent: &TradeIntent) {
        if !(intent.stop_loss.is_finite() && intent.stop_loss > 0.0) {
            result.reject(
                RejectionRule::MandatoryStopLoss,
                "every trade must have a stop loss".to_string(),
            );
        }
        if !(intent.price.is_finite() && intent.stop_loss < intent.price) {
            result.reject(
                RejectionRule::InvalidStopLoss,
                format!(
                    "stop loss {:.2} must be below entry price {:.2}",
                    intent.stop_loss, intent.price
                ),
            );
        }
    }

    fn check_max_risk_per_trade(&self, result: &mut ValidationResult, intent: &TradeIntent) {
        let total_risk = intent.risk_amount();
        let max_allowed = self.pct_of_capital(self.config.max_risk_per_trade_pct);

        if !within(total_risk, max_allowed) {
            result.reject(
                RejectionRule::MaxRiskPerTrade,
                format!(
                    "trade risk {:.2} exceeds max allowed {:.2} ({:.1}% of {:.2})",
                    total_risk, max_allowed, self.config.max_risk_per_trade_pct, self.total_capital
                ),
            );
        }
    }

    fn check_max_open_positions(
        &self,
        result: &mut ValidationResult,
        intent: &TradeIntent,
        positions: &[PositionInfo],
    ) {
        if positions.iter().any(|p| p.symbol == intent.symbol) {
            result.reject(
                RejectionRule::DuplicatePosition,
                format!("already have an open position in {}", intent.symbol),
            );
            return;
        }

        let max = self.config.max_open_positions as usize;
        if positions.len() >= max {
            result.reject(
                RejectionRule::MaxOpenPositions,
                format!("at position limit: {}/{}", positions.len(), max),
            );
        }
    }

    fn check_max_daily_loss(&self, result: &mut ValidationResult, daily_pnl: &DailyPnl) {
        let loss = daily_pnl.loss();
        let max_loss = self.pct_of_capital(self.config.max_daily_loss_pct);

        if loss > 0.0 && loss >= max_loss {
            result.reject(
                RejectionRule::MaxDailyLoss,
                format!("daily loss {:.2} has reached limit {:.2}", loss, max_loss),
            );
        }
    }

    fn check_max_capital_deployment(
        &self,
        result: &mut ValidationResult,
        intent: &TradeIntent,
        positions: &[PositionInfo],
    ) {
        let deployed: f64 = positions.iter().map(PositionInfo::notional).sum();
        let proposed = deployed + intent.notional();
        let max_deployment = self.pct_of_capital(self.config.max_capital_deployment_pct);

        if !within(proposed, max_deployment) {
            result.reject(
                RejectionRule::MaxCapitalDeployment,
                format!(
                    "total deployment {:.2} would exceed limit {:.2} ({:.1}% of {:.2})",
                    proposed,
                    max_deployment,
                    self.config.max_capital_deployment_pct,
                    self.total_capital
                ),
            );
        }
    }

    fn check_affordability(
        &self,
        result: &mut ValidationResult,
        intent: &TradeIntent,
        available_capital: f64,
    ) {
        let cost = intent.notional();
        if !(available_capital.is_finite() && within(cost, available_capital)) {
            result.reject(
                RejectionRule::InsufficientCapital,
                format!(
                    "trade cost {:.2} exceeds available capital {:.2}",
                    cost, available_capital
                ),
            );
        }
    }

    fn check_sector_concentration(
        &self,
        result: &mut ValidationResult,
        intent: &TradeIntent,
        positions: &[PositionInfo],
        sector_map: Option<&SectorMap>,
    ) {
        let Some(sector_map) = sector_map else {
            return;
        };
        let max = self.config.max_per_sector;
        if max == 0 {
            return;
        }
        let Some(sector) = sector_map.get(&intent.symbol) else {
            return;
        };

        let in_sector = positions
            .iter()
            .filter(|p| sector_map.get(&p.symbol) == Some(sector))
            .count();

        if in_sector >= max as usize {
            result.reject(
                RejectionRule::MaxSectorConcentration,
                format!(
                    "already have {} positions in sector {} (max {})",
                    in_sector, sector, max
                ),
            );
        }
    }
}
