use crate::chain::types::OptionContract;
use crate::errors::{require_finite, require_non_negative, require_positive, EngineError, EngineResult};
use crate::models::normal::norm_inv;
use crate::models::PricingModel;
use crate::state::{GreeksResult, PricingInputs, SecondOrderGreeks};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// What a leg holds.
///
/// Option legs carry full pricing inputs; their `spot` is the reference spot
/// and is replaced by the scenario spot on every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegInstrument {
    Option(PricingInputs),
    Underlying,
}

/// One leg of a strategy. Positive quantity is long, negative is short.
/// `entry_price` is the per-unit premium (or stock price) paid or received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyLeg {
    pub instrument: LegInstrument,
    pub quantity: f64,
    pub entry_price: f64,
}

impl StrategyLeg {
    pub fn option(inputs: PricingInputs, quantity: f64, entry_price: f64) -> Self {
        Self {
            instrument: LegInstrument::Option(inputs),
            quantity,
            entry_price,
        }
    }

    pub fn underlying(quantity: f64, entry_price: f64) -> Self {
        Self {
            instrument: LegInstrument::Underlying,
            quantity,
            entry_price,
        }
    }

    /// Builds an option leg from a normalized contract, entered at its
    /// reference price and priced at its quoted implied volatility.
    pub fn from_contract(
        contract: &OptionContract,
        as_of: NaiveDate,
        rate: f64,
        dividend_yield: f64,
        quantity: f64,
    ) -> EngineResult<Self> {
        let volatility = contract
            .implied_volatility
            .get()
            .ok_or_else(|| EngineError::invalid("implied_volatility", format!("not reported for {}", contract.symbol)))?;
        let entry_price = contract
            .reference_price()
            .ok_or_else(|| EngineError::invalid("entry_price", format!("no mid or last for {}", contract.symbol)))?;
        let inputs = PricingInputs::new(
            contract.option_type,
            contract.underlying_price,
            contract.strike,
            contract.time_to_expiry(as_of),
            volatility,
            rate,
            dividend_yield,
        );
        inputs.validate()?;
        Ok(Self::option(inputs, quantity, entry_price))
    }

    /// Years to expiry; `None` for the underlying, which never expires.
    #[inline]
    pub fn time_to_expiry(&self) -> Option<f64> {
        match self.instrument {
            LegInstrument::Option(inputs) => Some(inputs.time_to_expiry),
            LegInstrument::Underlying => None,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        require_finite("quantity", self.quantity)?;
        require_non_negative("entry_price", self.entry_price)?;
        if let LegInstrument::Option(inputs) = self.instrument {
            inputs.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PayoffPoint {
    pub spot: f64,
    pub value: f64,
}

/// Extremes and zero crossings of a sampled payoff curve. Only as good as
/// the grid: a curve still rising at the grid edge reports the edge value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoffSummary {
    pub max_profit: f64,
    pub max_loss: f64,
    pub breakevens: SmallVec<[f64; 4]>,
}

/// Values multi-leg positions across spot scenarios.
pub struct StrategyEngine<'a> {
    model: &'a dyn PricingModel,
}

impl<'a> StrategyEngine<'a> {
    pub fn new(model: &'a dyn PricingModel) -> Self {
        Self { model }
    }

    /// Aggregate P&L at each spot. At expiry every option leg pays its
    /// intrinsic value; otherwise each leg is priced with its own remaining
    /// time, so calendars and diagonals need no shared T.
    pub fn payoff_curve(&self, legs: &[StrategyLeg], spots: &[f64], at_expiry: bool) -> EngineResult<Vec<PayoffPoint>> {
        validate_legs(legs)?;
        spots
            .iter()
            .map(|&spot| {
                let value = if at_expiry {
                    expiry_value(legs, spot)?
                } else {
                    self.value_after(legs, spot, 0.0)?
                };
                Ok(PayoffPoint { spot, value })
            })
            .collect()
    }

    /// P&L curve after `elapsed` years. Each leg is aged by the same elapsed
    /// time; legs whose expiry has passed are worth their intrinsic value.
    pub fn value_at_horizon(&self, legs: &[StrategyLeg], spots: &[f64], elapsed: f64) -> EngineResult<Vec<PayoffPoint>> {
        validate_legs(legs)?;
        require_non_negative("elapsed", elapsed)?;
        spots
            .iter()
            .map(|&spot| {
                Ok(PayoffPoint {
                    spot,
                    value: self.value_after(legs, spot, elapsed)?,
                })
            })
            .collect()
    }

    /// Position P&L at one spot after `elapsed` years. Legs are assumed
    /// validated by the caller.
    pub(crate) fn value_after(&self, legs: &[StrategyLeg], spot: f64, elapsed: f64) -> EngineResult<f64> {
        require_positive("spot", spot)?;
        let mut total = 0.0;
        for leg in legs {
            let unit = match leg.instrument {
                LegInstrument::Underlying => spot,
                LegInstrument::Option(inputs) => {
                    let remaining = (inputs.time_to_expiry - elapsed).max(0.0);
                    self.model
                        .price(&inputs.with_spot(spot).with_time_to_expiry(remaining))?
                }
            };
            total += leg.quantity * (unit - leg.entry_price);
        }
        Ok(total)
    }

    /// Net sensitivities of the whole position at each leg's reference spot.
    /// The underlying contributes delta 1 per unit and nothing else.
    pub fn position_greeks(&self, legs: &[StrategyLeg]) -> EngineResult<GreeksResult> {
        validate_legs(legs)?;
        let mut total = GreeksResult {
            second_order: Some(SecondOrderGreeks::default()),
            ..GreeksResult::default()
        };
        for leg in legs {
            let unit = match leg.instrument {
                LegInstrument::Option(inputs) => self.model.greeks(&inputs)?,
                LegInstrument::Underlying => GreeksResult {
                    delta: 1.0,
                    second_order: Some(SecondOrderGreeks::default()),
                    ..GreeksResult::default()
                },
            };
            total = total.add(&unit.scaled(leg.quantity));
        }
        Ok(total)
    }
}

/// Aggregate P&L at expiry for one terminal spot. Needs no pricing model.
pub fn expiry_value(legs: &[StrategyLeg], spot: f64) -> EngineResult<f64> {
    require_positive("spot", spot)?;
    Ok(legs
        .iter()
        .map(|leg| {
            let unit = match leg.instrument {
                LegInstrument::Underlying => spot,
                LegInstrument::Option(inputs) => inputs.option_type.intrinsic(spot, inputs.strike),
            };
            leg.quantity * (unit - leg.entry_price)
        })
        .sum())
}

pub(crate) fn validate_legs(legs: &[StrategyLeg]) -> EngineResult<()> {
    if legs.is_empty() {
        return Err(EngineError::invalid("legs", "strategy has no legs"));
    }
    legs.iter().try_for_each(StrategyLeg::validate)
}

/// `steps` evenly spaced spots from `lower` to `upper`, both inclusive.
pub fn spot_grid(lower: f64, upper: f64, steps: usize) -> EngineResult<Vec<f64>> {
    require_positive("lower", lower)?;
    require_positive("upper", upper)?;
    if upper <= lower {
        return Err(EngineError::invalid("upper", format!("must exceed lower bound {lower}")));
    }
    if steps < 2 {
        return Err(EngineError::invalid("steps", "need at least 2 grid points"));
    }
    let step = (upper - lower) / (steps - 1) as f64;
    Ok((0..steps)
        .map(|i| if i == steps - 1 { upper } else { lower + step * i as f64 })
        .collect())
}

/// Central `confidence` interval of the lognormal terminal spot after `t`
/// years (driftless), for sizing a payoff chart's x-axis.
pub fn lognormal_spot_range(spot: f64, volatility: f64, t: f64, confidence: f64) -> EngineResult<(f64, f64)> {
    require_positive("spot", spot)?;
    require_positive("volatility", volatility)?;
    require_positive("time_to_expiry", t)?;
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(EngineError::invalid("confidence", format!("must be in (0, 1), got {confidence}")));
    }
    let z = norm_inv(0.5 + 0.5 * confidence);
    let width = z * volatility * t.sqrt();
    Ok((spot * (-width).exp(), spot * width.exp()))
}

/// Max profit, max loss and linearly interpolated zero crossings.
pub fn summarize(curve: &[PayoffPoint]) -> EngineResult<PayoffSummary> {
    if curve.is_empty() {
        return Err(EngineError::invalid("curve", "no points"));
    }
    let max_profit = curve.iter().map(|p| p.value).fold(f64::NEG_INFINITY, f64::max);
    let max_loss = curve.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);

    let mut breakevens: SmallVec<[f64; 4]> = SmallVec::new();
    let mut push = |s: f64| {
        if breakevens.last().map_or(true, |last| (s - last).abs() > 1e-9) {
            breakevens.push(s);
        }
    };
    // A run of zeros contributes the points where the curve enters or leaves
    // it. The grid edges are neither.
    for (i, p) in curve.iter().enumerate() {
        let next = curve.get(i + 1);
        if p.value == 0.0 {
            let entered = i > 0 && curve[i - 1].value != 0.0;
            let exits = next.is_some_and(|n| n.value != 0.0);
            if entered || exits {
                push(p.spot);
            }
        } else if let Some(n) = next.filter(|n| p.value * n.value < 0.0) {
            let w = p.value / (p.value - n.value);
            push(p.spot + w * (n.spot - p.spot));
        }
    }

    Ok(PayoffSummary {
        max_profit,
        max_loss,
        breakevens,
    })
}
