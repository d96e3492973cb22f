//! European option pricing and volatility analytics.
//!
//! Closed-form Black-Scholes-Merton pricing with analytic Greeks, implied
//! volatility inversion, realized volatility estimators, option-chain
//! normalization, multi-leg payoff analysis and Monte Carlo P&L distributions.
//! Everything except the simulator is a pure function over immutable inputs.

pub mod chain;
pub mod config;
pub mod errors;
pub mod models;
pub mod server;
pub mod simulation;
pub mod state;
pub mod strategy;

pub use errors::{EngineError, EngineResult};
pub use models::PricingModel;
