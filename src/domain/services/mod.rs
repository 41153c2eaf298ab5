pub mod circuit_breaker;
pub mod clock;
pub mod gatekeeper;
pub mod order_lifecycle;
pub mod risk_validator;
