pub mod order_update;
pub mod trade;
pub mod trade_intent;

pub use order_update::OrderUpdate;
pub use trade::{NewTrade, OrderLeg, OrderStatus, PositionState, TradeRecord};
pub use trade_intent::{PositionInfo, TradeAction, TradeIntent};
