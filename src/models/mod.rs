pub mod normal;
pub mod black_scholes;
pub mod implied_vol;
pub mod volatility;

use crate::errors::EngineResult;
use crate::state::{GreeksResult, PricingInputs};

/// All option pricing models implement this trait.
/// price() and greeks() must be pure functions: deterministic output from inputs only.
/// Send + Sync required so models can be shared with simulation worker threads.
pub trait PricingModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fair value of one unit. Fails with `InvalidInput` on invariant violations.
    fn price(&self, inputs: &PricingInputs) -> EngineResult<f64>;

    /// Analytic sensitivities for the same snapshot.
    fn greeks(&self, inputs: &PricingInputs) -> EngineResult<GreeksResult>;
}
