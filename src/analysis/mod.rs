pub mod comparison;
pub mod metrics;
pub mod ranking;
pub mod scenarios;
