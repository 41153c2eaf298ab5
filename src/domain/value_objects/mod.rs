pub mod pnl;

pub use pnl::DailyPnl;
