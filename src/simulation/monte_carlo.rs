use crate::errors::{require_finite, require_non_negative, require_positive, EngineError, EngineResult};
use crate::models::PricingModel;
use crate::strategy::payoff::{expiry_value, validate_legs, StrategyEngine, StrategyLeg};
use portable_atomic::{AtomicBool, Ordering};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Paths between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Used when a request does not name a path count.
    pub default_paths: usize,
    pub max_paths: usize,
    /// Reported P&L percentiles, as fractions in [0, 1].
    pub percentiles: Vec<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            default_paths: 10_000,
            max_paths: 1_000_000,
            percentiles: vec![0.05, 0.25, 0.5, 0.75, 0.95],
        }
    }
}

/// Market assumptions for the simulated underlying.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    pub spot: f64,
    pub volatility: f64,
    pub rate: f64,
    #[serde(default)]
    pub dividend_yield: f64,
    /// Years to simulate. Defaults to the earliest option expiry among the legs.
    #[serde(default)]
    pub horizon: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub legs: Vec<StrategyLeg>,
    pub params: SimulationParams,
    #[serde(default)]
    pub path_count: Option<usize>,
    /// Fixed seed for reproducible runs; drawn from OS entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileOutcome {
    pub percentile: f64,
    pub value: f64,
}

/// Distribution of strategy P&L at the horizon. All P&L figures are net of
/// entry prices and undiscounted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub percentiles: Vec<PercentileOutcome>,
    pub expected_value: f64,
    /// Fraction of paths with P&L strictly above zero.
    pub probability_of_profit: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub mean_terminal_price: f64,
    pub horizon: f64,
    pub path_count: usize,
    pub seed: u64,
}

/// Cooperative cancellation flag shared between a caller and a running
/// simulation. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Terminal-price Monte Carlo under geometric Brownian motion:
///
/// S_T = S * exp((r - q - sigma^2/2) * T + sigma * sqrt(T) * Z),  Z ~ N(0, 1)
///
/// Each path values the strategy at the horizon. Legs expiring by then pay
/// intrinsic; later legs are marked with the pricing model at their
/// remaining time.
pub struct MonteCarloSimulator<'a> {
    model: &'a dyn PricingModel,
    config: SimulationConfig,
}

impl<'a> MonteCarloSimulator<'a> {
    pub fn new(model: &'a dyn PricingModel, config: SimulationConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Runs the request to completion, or returns `Cancelled` (never a partial
    /// result) once `cancel` is observed.
    pub fn simulate(&self, request: &SimulationRequest, cancel: &CancelToken) -> EngineResult<SimulationResult> {
        let legs = &request.legs;
        let p = &request.params;
        validate_legs(legs)?;
        require_positive("spot", p.spot)?;
        require_positive("volatility", p.volatility)?;
        require_finite("rate", p.rate)?;
        require_non_negative("dividend_yield", p.dividend_yield)?;

        let horizon = match p.horizon {
            Some(h) => {
                require_non_negative("horizon", h)?;
                h
            }
            None => legs
                .iter()
                .filter_map(StrategyLeg::time_to_expiry)
                .min_by(f64::total_cmp)
                .ok_or_else(|| EngineError::invalid("horizon", "required when no leg has an expiry"))?,
        };

        let path_count = request.path_count.unwrap_or(self.config.default_paths);
        if path_count == 0 || path_count > self.config.max_paths {
            return Err(EngineError::invalid(
                "path_count",
                format!("must be in 1..={}, got {path_count}", self.config.max_paths),
            ));
        }

        let seed = request.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);

        let drift = (p.rate - p.dividend_yield - 0.5 * p.volatility * p.volatility) * horizon;
        let diffusion = p.volatility * horizon.sqrt();
        let needs_model = legs
            .iter()
            .any(|l| l.time_to_expiry().is_some_and(|t| t > horizon));
        let engine = StrategyEngine::new(self.model);

        tracing::info!(path_count, seed, horizon, legs = legs.len(), needs_model, "simulation started");

        let mut outcomes = Vec::with_capacity(path_count);
        let mut terminal_sum = 0.0;
        for i in 0..path_count {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                tracing::info!(completed = i, path_count, seed, "simulation cancelled");
                return Err(EngineError::Cancelled);
            }
            let z: f64 = StandardNormal.sample(&mut rng);
            let terminal = p.spot * (drift + diffusion * z).exp();
            terminal_sum += terminal;
            let pnl = if needs_model {
                engine.value_after(legs, terminal, horizon)?
            } else {
                expiry_value(legs, terminal)?
            };
            outcomes.push(pnl);
        }

        let result = summarize_outcomes(
            outcomes,
            &self.config.percentiles,
            terminal_sum / path_count as f64,
            horizon,
            seed,
        );
        tracing::debug!(
            expected_value = result.expected_value,
            probability_of_profit = result.probability_of_profit,
            "simulation finished"
        );
        Ok(result)
    }
}

/// Runs a simulation on tokio's blocking pool so the calling task stays
/// responsive. Dropping the returned future does not stop the work; cancel
/// through the token.
pub async fn simulate_async(
    model: Arc<dyn PricingModel>,
    config: SimulationConfig,
    request: SimulationRequest,
    cancel: CancelToken,
) -> EngineResult<SimulationResult> {
    tokio::task::spawn_blocking(move || MonteCarloSimulator::new(model.as_ref(), config).simulate(&request, &cancel))
        .await?
}

fn summarize_outcomes(
    mut outcomes: Vec<f64>,
    percentiles: &[f64],
    mean_terminal_price: f64,
    horizon: f64,
    seed: u64,
) -> SimulationResult {
    outcomes.sort_unstable_by(f64::total_cmp);
    let n = outcomes.len();
    let mean = outcomes.iter().sum::<f64>() / n as f64;
    let std_dev = if n > 1 {
        let ss: f64 = outcomes.iter().map(|x| (x - mean) * (x - mean)).sum();
        (ss / (n - 1) as f64).sqrt()
    } else {
        0.0
    };
    let profitable = outcomes.iter().filter(|x| **x > 0.0).count();

    SimulationResult {
        percentiles: percentiles
            .iter()
            .map(|&q| PercentileOutcome {
                percentile: q,
                value: sorted_quantile(&outcomes, q),
            })
            .collect(),
        expected_value: mean,
        probability_of_profit: profitable as f64 / n as f64,
        std_dev,
        min: outcomes[0],
        max: outcomes[n - 1],
        mean_terminal_price,
        horizon,
        path_count: n,
        seed,
    }
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty.
fn sorted_quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let w = pos - lo as f64;
    sorted[lo] + w * (sorted[hi] - sorted[lo])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::black_scholes::BlackScholes;
    use crate::models::normal::norm_cdf;
    use crate::state::{OptionType, PricingInputs};
    use crate::strategy::payoff::LegInstrument;

    fn params(horizon: Option<f64>) -> SimulationParams {
        SimulationParams {
            spot: 100.0,
            volatility: 0.2,
            rate: 0.03,
            dividend_yield: 0.0,
            horizon,
        }
    }

    fn call_leg(t: f64) -> StrategyLeg {
        StrategyLeg::option(PricingInputs::new(OptionType::Call, 100.0, 100.0, t, 0.2, 0.03, 0.0), 1.0, 0.0)
    }

    fn request(legs: Vec<StrategyLeg>, paths: usize, seed: Option<u64>) -> SimulationRequest {
        SimulationRequest {
            legs,
            params: params(None),
            path_count: Some(paths),
            seed,
        }
    }

    #[test]
    fn test_same_seed_bit_identical() {
        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        let req = request(vec![call_leg(0.5), call_leg(1.0)], 20_000, Some(7));
        let a = sim.simulate(&req, &CancelToken::new()).unwrap();
        let b = sim.simulate(&req, &CancelToken::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.seed, 7);

        let other = sim.simulate(&request(req.legs.clone(), 20_000, Some(8)), &CancelToken::new()).unwrap();
        assert_ne!(a.expected_value, other.expected_value);
    }

    #[test]
    fn test_unseeded_run_records_reproducible_seed() {
        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        let first = sim.simulate(&request(vec![call_leg(0.25)], 5_000, None), &CancelToken::new()).unwrap();
        let replay = sim
            .simulate(&request(vec![call_leg(0.25)], 5_000, Some(first.seed)), &CancelToken::new())
            .unwrap();
        assert_eq!(first, replay);
    }

    #[test]
    fn test_long_call_matches_forward_value() {
        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        let leg = call_leg(0.5);
        let n = 200_000;
        let r = sim.simulate(&request(vec![leg], n, Some(42)), &CancelToken::new()).unwrap();

        // undiscounted expected payoff = BS price grown at r
        let LegInstrument::Option(inputs) = leg.instrument else { unreachable!() };
        let analytic = bs.price(&inputs).unwrap() * (0.03_f64 * 0.5).exp();
        let stderr = r.std_dev / (n as f64).sqrt();
        assert!(
            (r.expected_value - analytic).abs() < 4.0 * stderr,
            "ev={} analytic={analytic} stderr={stderr}",
            r.expected_value
        );

        let forward = 100.0 * (0.03_f64 * 0.5).exp();
        assert!((r.mean_terminal_price - forward).abs() < 0.2, "mean S_T={}", r.mean_terminal_price);
        assert_eq!(r.horizon, 0.5);
        assert_eq!(r.min, 0.0);
        assert!(r.percentiles.windows(2).all(|w| w[0].value <= w[1].value));
        assert_eq!(r.percentiles[0].value, 0.0, "5th pct of a long call is worthless");
    }

    #[test]
    fn test_probability_of_profit_long_stock() {
        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        let req = SimulationRequest {
            legs: vec![StrategyLeg::underlying(1.0, 100.0)],
            params: SimulationParams {
                rate: 0.0,
                ..params(Some(1.0))
            },
            path_count: Some(100_000),
            seed: Some(3),
        };
        let r = sim.simulate(&req, &CancelToken::new()).unwrap();
        // P(S_T > S) = P(Z > sigma*sqrt(T)/2)
        let expected = norm_cdf(-0.1);
        assert!((r.probability_of_profit - expected).abs() < 0.01, "pop={}", r.probability_of_profit);
        assert!(r.probability_of_profit >= 0.0 && r.probability_of_profit <= 1.0);
    }

    #[test]
    fn test_horizon_is_earliest_expiry() {
        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        let short_near = StrategyLeg::option(
            PricingInputs::new(OptionType::Call, 100.0, 100.0, 0.1, 0.2, 0.03, 0.0),
            -1.0,
            2.5,
        );
        let r = sim
            .simulate(&request(vec![short_near, call_leg(0.4)], 4_000, Some(11)), &CancelToken::new())
            .unwrap();
        assert_eq!(r.horizon, 0.1);
        assert!(r.min > -100.0, "calendar losses are bounded, min={}", r.min);

        let stock_only = request(vec![StrategyLeg::underlying(1.0, 100.0)], 100, Some(1));
        assert!(matches!(
            sim.simulate(&stock_only, &CancelToken::new()),
            Err(EngineError::InvalidInput { field: "horizon", .. })
        ));
    }

    #[test]
    fn test_path_count_limits() {
        let bs = BlackScholes::new();
        let config = SimulationConfig {
            max_paths: 1_000,
            ..SimulationConfig::default()
        };
        let sim = MonteCarloSimulator::new(&bs, config);
        for paths in [0, 1_001] {
            assert!(matches!(
                sim.simulate(&request(vec![call_leg(0.5)], paths, Some(1)), &CancelToken::new()),
                Err(EngineError::InvalidInput { field: "path_count", .. })
            ));
        }
        let single = sim.simulate(&request(vec![call_leg(0.5)], 1, Some(1)), &CancelToken::new()).unwrap();
        assert_eq!(single.std_dev, 0.0);
        assert_eq!(single.min, single.max);
    }

    #[test]
    fn test_cancelled_returns_no_partial_result() {
        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            sim.simulate(&request(vec![call_leg(0.5)], 50_000, Some(1)), &cancel),
            Err(EngineError::Cancelled)
        );
    }

    #[test]
    fn test_cancel_from_another_thread_mid_run() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let bs = BlackScholes::new();
        let sim = MonteCarloSimulator::new(&bs, SimulationConfig::default());
        // calendar legs: every path reprices the far leg through the model
        let req = request(vec![call_leg(0.5), call_leg(1.0)], 1_000_000, Some(3));
        let cancel = CancelToken::new();

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            started_rx.recv().unwrap();
            thread::sleep(Duration::from_millis(5));
            remote.cancel();
        });

        started_tx.send(()).unwrap();
        let result = sim.simulate(&req, &cancel);
        canceller.join().unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(result, Err(EngineError::Cancelled));
    }

    #[test]
    fn test_sorted_quantile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sorted_quantile(&xs, 0.0), 1.0);
        assert_eq!(sorted_quantile(&xs, 0.5), 3.0);
        assert_eq!(sorted_quantile(&xs, 1.0), 5.0);
        assert!((sorted_quantile(&xs, 0.3) - 2.2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_async_matches_sync() {
        let bs = BlackScholes::new();
        let req = request(vec![call_leg(0.5)], 10_000, Some(99));
        let sync = MonteCarloSimulator::new(&bs, SimulationConfig::default())
            .simulate(&req, &CancelToken::new())
            .unwrap();
        let model: Arc<dyn PricingModel> = Arc::new(bs);
        let async_result = simulate_async(model.clone(), SimulationConfig::default(), req.clone(), CancelToken::new())
            .await
            .unwrap();
        assert_eq!(sync, async_result);

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            simulate_async(model, SimulationConfig::default(), req, cancel).await,
            Err(EngineError::Cancelled)
        );
    }
}
