use crate::errors::{
    require_finite, require_non_negative, require_positive, EngineError, EngineResult,
};
use crate::models::black_scholes::MIN_TIME_TO_EXPIRY;
use crate::models::PricingModel;
use crate::state::{MarketInputs, OptionType};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Below this raw vega (price change per 1.0 of vol) a Newton step is not trusted.
const MIN_VEGA: f64 = 1e-8;

/// A Newton step must at least halve the residual or the next step bisects.
const NEWTON_PROGRESS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Absolute price tolerance: stop once |price(sigma) - target| < tolerance.
    pub tolerance: f64,
    pub max_iterations: u32,
    /// Annualized volatility search interval.
    pub vol_lower: f64,
    pub vol_upper: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-7,
            max_iterations: 100,
            vol_lower: 0.001,
            vol_upper: 5.0,
        }
    }
}

impl SolverConfig {
    /// Rejects settings the solver cannot run with: a non-positive tolerance or
    /// budget, or a search interval that is not 0 < vol_lower < vol_upper.
    pub fn validate(&self) -> EngineResult<()> {
        require_positive("tolerance", self.tolerance)?;
        if self.max_iterations == 0 {
            return Err(EngineError::invalid("max_iterations", "must be > 0"));
        }
        require_positive("vol_lower", self.vol_lower)?;
        require_finite("vol_upper", self.vol_upper)?;
        if self.vol_upper <= self.vol_lower {
            return Err(EngineError::invalid(
                "vol_upper",
                format!("must exceed vol_lower {}, got {}", self.vol_lower, self.vol_upper),
            ));
        }
        Ok(())
    }
}

/// Range of prices any volatility can produce for a European option.
///
/// call: [max(S*e^(-qT) - K*e^(-rT), 0), S*e^(-qT)]
/// put:  [max(K*e^(-rT) - S*e^(-qT), 0), K*e^(-rT)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NoArbitrageBounds {
    pub lower: f64,
    pub upper: f64,
}

impl NoArbitrageBounds {
    pub fn for_market(m: &MarketInputs) -> Self {
        let forward_leg = m.spot * (-m.dividend_yield * m.time_to_expiry).exp();
        let strike_leg = m.strike * (-m.rate * m.time_to_expiry).exp();
        match m.option_type {
            OptionType::Call => Self {
                lower: (forward_leg - strike_leg).max(0.0),
                upper: forward_leg,
            },
            OptionType::Put => Self {
                lower: (strike_leg - forward_leg).max(0.0),
                upper: strike_leg,
            },
        }
    }

    #[inline]
    fn contains(&self, price: f64) -> bool {
        let slack = 1e-12 * (1.0 + self.upper.abs());
        price >= self.lower - slack && price <= self.upper + slack
    }
}

/// Inverts a pricing model over volatility.
///
/// Safeguarded Newton-Raphson: every iteration tightens a [lo, hi] bracket
/// (price is increasing in vol), takes the Newton step when vega is usable and
/// the step stays inside the bracket, and bisects otherwise.
pub struct ImpliedVolSolver<'a> {
    model: &'a dyn PricingModel,
    config: SolverConfig,
}

impl<'a> ImpliedVolSolver<'a> {
    pub fn new(model: &'a dyn PricingModel, config: SolverConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn solve(&self, target_price: f64, market: &MarketInputs) -> EngineResult<f64> {
        validate_market(market)?;
        require_finite("target_price", target_price)?;
        if market.time_to_expiry < MIN_TIME_TO_EXPIRY {
            return Err(EngineError::invalid(
                "time_to_expiry",
                format!("must be >= {MIN_TIME_TO_EXPIRY:e} to imply a volatility"),
            ));
        }

        let bounds = NoArbitrageBounds::for_market(market);
        if !bounds.contains(target_price) {
            return Err(EngineError::ArbitrageViolation {
                price: target_price,
                lower: bounds.lower,
                upper: bounds.upper,
            });
        }

        let mut lo = self.config.vol_lower;
        let mut hi = self.config.vol_upper;
        let mut sigma = initial_guess(market, target_price, bounds.lower).clamp(lo, hi);
        let mut residual = f64::INFINITY;
        let mut last_step_newton = false;

        for iteration in 1..=self.config.max_iterations {
            let inputs = market.with_volatility(sigma);
            let diff = self.model.price(&inputs)? - target_price;

            if diff.abs() < self.config.tolerance {
                tracing::trace!(iterations = iteration, sigma, "implied vol converged");
                return Ok(sigma);
            }

            if diff > 0.0 {
                hi = sigma;
            } else {
                lo = sigma;
            }

            let stalled = last_step_newton && diff.abs() > NEWTON_PROGRESS * residual;
            residual = diff.abs();

            // greeks() reports vega per vol point
            let vega = self.model.greeks(&inputs)?.vega * 100.0;
            let newton = sigma - diff / vega;

            if !stalled && vega > MIN_VEGA && newton.is_finite() && newton > lo && newton < hi {
                sigma = newton;
                last_step_newton = true;
            } else {
                tracing::debug!(iteration, sigma, vega, stalled, "implied vol bisection step");
                sigma = 0.5 * (lo + hi);
                last_step_newton = false;
            }
        }

        tracing::warn!(
            target_price,
            strike = market.strike,
            iterations = self.config.max_iterations,
            residual,
            "implied vol did not converge"
        );
        Err(EngineError::NoConvergence {
            iterations: self.config.max_iterations,
            residual,
        })
    }
}

fn validate_market(m: &MarketInputs) -> EngineResult<()> {
    require_positive("spot", m.spot)?;
    require_positive("strike", m.strike)?;
    require_non_negative("time_to_expiry", m.time_to_expiry)?;
    require_finite("rate", m.rate)?;
    require_non_negative("dividend_yield", m.dividend_yield)?;
    Ok(())
}

/// Brenner-Subrahmanyam style guess from time value, widened for moneyness.
fn initial_guess(m: &MarketInputs, target_price: f64, lower_bound: f64) -> f64 {
    let forward_leg = m.spot * (-m.dividend_yield * m.time_to_expiry).exp();
    let time_value = (target_price - lower_bound).max(1e-12);
    let atm = (2.0 * PI / m.time_to_expiry).sqrt() * time_value / forward_leg;
    let moneyness = (m.spot / m.strike).ln().abs();
    atm * (1.0 + 0.5 * moneyness + 0.125 * moneyness * moneyness)
}
