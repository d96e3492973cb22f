use crate::config::AppConfig;
use crate::errors::{require_finite, require_non_negative, require_positive, EngineResult};
use crate::models::black_scholes::BlackScholes;
use crate::models::PricingModel;
use chrono::NaiveDate;
use portable_atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Option type ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Payoff at expiry for one unit: max(S-K, 0) or max(K-S, 0).
    #[inline]
    pub fn intrinsic(self, spot: f64, strike: f64) -> f64 {
        match self {
            Self::Call => (spot - strike).max(0.0),
            Self::Put => (strike - spot).max(0.0),
        }
    }

    /// Calls are in the money when K < S, puts when K > S. At-the-money is neither.
    #[inline]
    pub fn is_in_the_money(self, strike: f64, underlying: f64) -> bool {
        match self {
            Self::Call => strike < underlying,
            Self::Put => strike > underlying,
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Put => write!(f, "put"),
        }
    }
}

// ── Pricing inputs ──

/// Everything needed to price one European option. Built fresh per evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingInputs {
    pub option_type: OptionType,
    pub spot: f64,
    pub strike: f64,
    /// Years to expiry. Zero means "at expiry".
    pub time_to_expiry: f64,
    /// Annualized volatility.
    pub volatility: f64,
    pub rate: f64,
    /// Continuous dividend yield.
    #[serde(default)]
    pub dividend_yield: f64,
}

impl PricingInputs {
    pub fn new(
        option_type: OptionType,
        spot: f64,
        strike: f64,
        time_to_expiry: f64,
        volatility: f64,
        rate: f64,
        dividend_yield: f64,
    ) -> Self {
        Self {
            option_type,
            spot,
            strike,
            time_to_expiry,
            volatility,
            rate,
            dividend_yield,
        }
    }

    /// Checks the positivity/range invariants. Never clamps.
    pub fn validate(&self) -> EngineResult<()> {
        require_positive("spot", self.spot)?;
        require_positive("strike", self.strike)?;
        require_non_negative("time_to_expiry", self.time_to_expiry)?;
        require_positive("volatility", self.volatility)?;
        require_finite("rate", self.rate)?;
        require_non_negative("dividend_yield", self.dividend_yield)?;
        Ok(())
    }

    /// The same contract and market, without the volatility.
    #[inline]
    pub fn market(&self) -> MarketInputs {
        MarketInputs {
            option_type: self.option_type,
            spot: self.spot,
            strike: self.strike,
            time_to_expiry: self.time_to_expiry,
            rate: self.rate,
            dividend_yield: self.dividend_yield,
        }
    }

    #[inline]
    pub fn with_spot(&self, spot: f64) -> Self {
        Self { spot, ..*self }
    }

    #[inline]
    pub fn with_time_to_expiry(&self, time_to_expiry: f64) -> Self {
        Self {
            time_to_expiry,
            ..*self
        }
    }
}

/// Pricing inputs minus volatility: the known side of an implied-vol solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketInputs {
    pub option_type: OptionType,
    pub spot: f64,
    pub strike: f64,
    pub time_to_expiry: f64,
    pub rate: f64,
    #[serde(default)]
    pub dividend_yield: f64,
}

impl MarketInputs {
    #[inline]
    pub fn with_volatility(&self, volatility: f64) -> PricingInputs {
        PricingInputs {
            option_type: self.option_type,
            spot: self.spot,
            strike: self.strike,
            time_to_expiry: self.time_to_expiry,
            volatility,
            rate: self.rate,
            dividend_yield: self.dividend_yield,
        }
    }
}

// ── Greeks ──

/// Sensitivities for one PricingInputs snapshot.
///
/// Units: delta and gamma per 1.0 of spot, theta per calendar day,
/// vega and rho per 1 percentage point of volatility / rate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GreeksResult {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_order: Option<SecondOrderGreeks>,
}

/// Raw model units except charm, which is per calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SecondOrderGreeks {
    /// d(delta)/d(sigma)
    pub vanna: f64,
    /// -d(delta)/d(T), per day
    pub charm: f64,
    /// d(vega)/d(sigma)
    pub vomma: f64,
    /// d(gamma)/d(S)
    pub speed: f64,
}

impl GreeksResult {
    /// Scale every sensitivity by a signed position quantity.
    pub fn scaled(&self, quantity: f64) -> Self {
        Self {
            delta: self.delta * quantity,
            gamma: self.gamma * quantity,
            theta: self.theta * quantity,
            vega: self.vega * quantity,
            rho: self.rho * quantity,
            second_order: self.second_order.map(|s| SecondOrderGreeks {
                vanna: s.vanna * quantity,
                charm: s.charm * quantity,
                vomma: s.vomma * quantity,
                speed: s.speed * quantity,
            }),
        }
    }

    /// Component-wise sum. Second-order terms survive only if both sides have them.
    pub fn add(&self, other: &Self) -> Self {
        let second_order = match (self.second_order, other.second_order) {
            (Some(a), Some(b)) => Some(SecondOrderGreeks {
                vanna: a.vanna + b.vanna,
                charm: a.charm + b.charm,
                vomma: a.vomma + b.vomma,
                speed: a.speed + b.speed,
            }),
            _ => None,
        };
        Self {
            delta: self.delta + other.delta,
            gamma: self.gamma + other.gamma,
            theta: self.theta + other.theta,
            vega: self.vega + other.vega,
            rho: self.rho + other.rho,
            second_order,
        }
    }
}

// ── Historical series ──

/// One trading day. Caller-owned; series are ascending by date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolMethod {
    CloseToClose,
    Parkinson,
    Ewma,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilityEstimate {
    /// Window length in trading days.
    pub window: usize,
    /// Annualized volatility.
    pub volatility: f64,
    /// Observations (returns or ranges) that went into the estimate.
    pub sample_count: usize,
    pub method: VolMethod,
}

// ── Performance Counters (lock-free) ──

pub struct PerfCounters {
    pub price_requests: AtomicU64,
    pub implied_vol_requests: AtomicU64,
    pub historical_vol_requests: AtomicU64,
    pub chain_requests: AtomicU64,
    pub payoff_requests: AtomicU64,
    pub simulations_started: AtomicU64,
    pub simulations_cancelled: AtomicU64,
    pub errors_returned: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            price_requests: AtomicU64::new(0),
            implied_vol_requests: AtomicU64::new(0),
            historical_vol_requests: AtomicU64::new(0),
            chain_requests: AtomicU64::new(0),
            payoff_requests: AtomicU64::new(0),
            simulations_started: AtomicU64::new(0),
            simulations_cancelled: AtomicU64::new(0),
            errors_returned: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

// ── Host shared state (immutable config + lock-free counters) ──

pub struct AppState {
    pub config: AppConfig,
    /// Shared with blocking simulation workers.
    pub model: Arc<dyn PricingModel>,
    pub counters: PerfCounters,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            model: Arc::new(BlackScholes::new()),
            counters: PerfCounters::new(),
        })
    }
}
