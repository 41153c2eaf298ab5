use crate::domain::entities::trade::OrderStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broker-agnostic order status notification (postback)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    /// Tag supplied when the order was placed
    pub correlation_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    /// "BUY" or "SELL"
    pub side: String,
    pub quantity: u32,
    pub filled_qty: u32,
    pub pending_qty: u32,
    pub average_price: f64,
    pub error_code: String,
    pub error_message: String,
    pub exchange_time: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl OrderUpdate {
    pub fn new(order_id: impl Into<String>, status: OrderStatus, received_at: DateTime<Utc>) -> Self {
        Self {
            order_id: order_id.into(),
            correlation_id: String::new(),
            symbol: String::new(),
            status,
            side: String::new(),
            quantity: 0,
            filled_qty: 0,
            pending_qty: 0,
            average_price: 0.0,
            error_code: String::new(),
            error_message: String::new(),
            exchange_time: None,
            received_at,
        }
    }

    pub fn with_fill(mut self, average_price: f64, filled_qty: u32) -> Self {
        self.average_price = average_price;
        self.filled_qty = filled_qty;
        self
    }

    /// Broker-reported fill price; a zero or non-finite average means no fill.
    pub fn fill_price(&self) -> Option<f64> {
        if self.average_price.is_finite() && self.average_price > 0.0 {
            Some(self.average_price)
        } else {
            None
        }
    }

    /// Exchange timestamp when known, otherwise the time we received it
    pub fn fill_time(&self) -> DateTime<Utc> {
        self.exchange_time.unwrap_or(self.received_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fill_price_requires_positive_average() {
        let now = Utc::now();
        let update = OrderUpdate::new("1", OrderStatus::Completed, now);
        assert!(update.fill_price().is_none());
        assert_eq!(update.with_fill(101.5, 10).fill_price(), Some(101.5));
    }

    #[test]
    fn test_fill_time_prefers_exchange_time() {
        let received = Utc.with_ymd_and_hms(2024, 9, 11, 10, 0, 5).unwrap();
        let exchanged = Utc.with_ymd_and_hms(2024, 9, 11, 10, 0, 1).unwrap();
        let mut update = OrderUpdate::new("1", OrderStatus::Completed, received);
        assert_eq!(update.fill_time(), received);
        update.exchange_time = Some(exchanged);
        assert_eq!(update.fill_time(), exchanged);
    }
}
