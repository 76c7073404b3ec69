//! Tail-risk hedging engine: option pricing under crisis dynamics, volatility
//! regimes, a put-position lifecycle and strategy comparison over stress paths.

pub mod analysis;
pub mod config;
pub mod errors;
pub mod models;
pub mod portfolio;
pub mod risk;
pub mod state;
pub mod strategy;
