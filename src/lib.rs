//! Tradegate Library
//!
//! Trade-execution gatekeeper: risk validation, circuit breaker and the
//! order lifecycle that reconciles broker postbacks into position state.

pub mod application;
pub mod config;
pub mod config_watcher;
pub mod domain;
pub mod persistence;
