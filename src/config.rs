use crate::application::handlers::postback::DEFAULT_POSTBACK_PATH;
use crate::domain::services::circuit_breaker::CircuitBreakerConfig;
use crate::domain::services::risk_validator::{RiskConfig, SectorMap};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const LIVE_MAX_OPEN_POSITIONS: u32 = 5;
const LIVE_MAX_RISK_PER_TRADE_PCT: f64 = 2.0;
const LIVE_MAX_CAPITAL_DEPLOYMENT_PCT: f64 = 70.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl FromStr for TradingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(ConfigError::Invalid(format!(
                "trading_mode must be 'paper' or 'live', got {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

/// Risk block: rule limits plus the circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    #[serde(flatten)]
    pub limits: RiskConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_webhook_port(),
            path: default_webhook_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_webhook_port() -> u16 {
    8080
}

fn default_webhook_path() -> String {
    DEFAULT_POSTBACK_PATH.to_string()
}

fn default_database_url() -> String {
    "sqlite://data/tradegate.db".to_string()
}

/// Gatekeeper configuration, loaded from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    pub capital: f64,
    pub risk: RiskSettings,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// JSON object of symbol to sector; absent disables sector limits
    #[serde(default)]
    pub sector_map_path: Option<PathBuf>,
}

impl GatekeeperConfig {
    /// Read, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::read(path.as_ref())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override file values from `TRADEGATE_*` variables. Unparseable values
    /// are logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("TRADEGATE_TRADING_MODE").filter(|v| !v.is_empty()) {
            match mode.parse::<TradingMode>() {
                Ok(value) => self.trading_mode = value,
                Err(e) => tracing::warn!("Ignoring TRADEGATE_TRADING_MODE: {}", e),
            }
        }

        if let Some(url) = lookup("TRADEGATE_DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database_url = url;
        }

        if let Some(capital) = lookup("TRADEGATE_CAPITAL").filter(|v| !v.is_empty()) {
            match capital.parse::<f64>() {
                Ok(value) => self.capital = value,
                Err(e) => tracing::warn!(
                    "Failed to parse TRADEGATE_CAPITAL '{}': {}, using {}",
                    capital,
                    e,
                    self.capital
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };
        let pct_ok = |v: f64| v > 0.0 && v <= 100.0;
        let risk = &self.risk.limits;

        if !(self.capital.is_finite() && self.capital > 0.0) {
            return invalid(format!("capital must be positive, got {}", self.capital));
        }
        if !pct_ok(risk.max_risk_per_trade_pct) {
            return invalid(format!(
                "max_risk_per_trade_pct must be in (0, 100], got {}",
                risk.max_risk_per_trade_pct
            ));
        }
        if risk.max_open_positions == 0 {
            return invalid("max_open_positions must be positive, got 0".to_string());
        }
        if !pct_ok(risk.max_daily_loss_pct) {
            return invalid(format!(
                "max_daily_loss_pct must be in (0, 100], got {}",
                risk.max_daily_loss_pct
            ));
        }
        if !pct_ok(risk.max_capital_deployment_pct) {
            return invalid(format!(
                "max_capital_deployment_pct must be in (0, 100], got {}",
                risk.max_capital_deployment_pct
            ));
        }
        if self.database_url.is_empty() {
            return invalid("database_url is required".to_string());
        }
        if self.webhook.enabled && !self.webhook.path.starts_with('/') {
            return invalid(format!(
                "webhook.path must start with '/', got {:?}",
                self.webhook.path
            ));
        }

        if self.trading_mode == TradingMode::Live {
            self.validate_live_mode()?;
        }
        Ok(())
    }

    fn validate_live_mode(&self) -> Result<(), ConfigError> {
        let risk = &self.risk.limits;
        if risk.max_open_positions > LIVE_MAX_OPEN_POSITIONS {
            return Err(ConfigError::Invalid(format!(
                "live mode: max_open_positions cannot exceed {} (got {})",
                LIVE_MAX_OPEN_POSITIONS, risk.max_open_positions
            )));
        }
        if risk.max_risk_per_trade_pct > LIVE_MAX_RISK_PER_TRADE_PCT {
            return Err(ConfigError::Invalid(format!(
                "live mode: max_risk_per_trade_pct cannot exceed {:.0}% (got {:.1}%)",
                LIVE_MAX_RISK_PER_TRADE_PCT, risk.max_risk_per_trade_pct
            )));
        }
        if risk.max_capital_deployment_pct > LIVE_MAX_CAPITAL_DEPLOYMENT_PCT {
            return Err(ConfigError::Invalid(format!(
                "live mode: max_capital_deployment_pct cannot exceed {:.0}% (got {:.1}%)",
                LIVE_MAX_CAPITAL_DEPLOYMENT_PCT, risk.max_capital_deployment_pct
            )));
        }
        Ok(())
    }

    /// True when a reload must be pushed into the gatekeeper.
    pub fn risk_changed(&self, other: &GatekeeperConfig) -> bool {
        self.capital != other.capital || self.risk != other.risk
    }

    pub fn load_sector_map(&self) -> Result<Option<SectorMap>, ConfigError> {
        let Some(path) = &self.sector_map_path else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let map = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Some(map))
    }
}
