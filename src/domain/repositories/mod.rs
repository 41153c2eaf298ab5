pub mod trade_store;

pub use trade_store::{StoreError, StoreResult, TradeStore};
